//! Reverse tunnel agent.
//!
//! One outbound control connection per session. The broker tells the agent which
//! loopback ports to expose, and every read on those ports comes back to the broker
//! as a `<protocol> <port> <base64>` line.

pub mod conn;
pub mod control;
pub mod framer;
pub mod listener;
pub mod outbuf;
pub mod protocol;
pub mod reactor;
pub mod session;
pub mod supervisor;
