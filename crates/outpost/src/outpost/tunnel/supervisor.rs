use std::time::Duration;

use crate::outpost::tunnel::{
    protocol::Metadata,
    session::{Session, SessionOptions},
};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Something that can run one complete session.
pub trait Connector {
    fn run_session(&mut self) -> anyhow::Result<()>;
}

pub trait Sleeper {
    fn sleep(&mut self, d: Duration);
}

#[derive(Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Connects to the broker with a brand-new session each time.
#[derive(Debug, Clone)]
pub struct BrokerConnector {
    pub opts: SessionOptions,
    pub metadata: Metadata,
}

impl Connector for BrokerConnector {
    fn run_session(&mut self) -> anyhow::Result<()> {
        let session = Session::start(&self.opts, &self.metadata)?;
        tracing::info!(session = %session.id(), broker = %self.opts.broker, "tunnel: session starting");
        session.run()
    }
}

/// Reconnect loop: run a session, wait a fixed interval, repeat.
///
/// There is no backoff growth and no retry cap.
#[derive(Debug)]
pub struct Supervisor<C, S = ThreadSleeper> {
    connector: C,
    interval: Duration,
    sleeper: S,
}

impl<C: Connector> Supervisor<C, ThreadSleeper> {
    pub fn new(connector: C, interval: Duration) -> Self {
        Self::with_sleeper(connector, interval, ThreadSleeper)
    }
}

impl<C: Connector, S: Sleeper> Supervisor<C, S> {
    pub fn with_sleeper(connector: C, interval: Duration, sleeper: S) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_RECONNECT_INTERVAL
        } else {
            interval
        };
        Self {
            connector,
            interval,
            sleeper,
        }
    }

    /// Runs sessions back to back. With `max_sessions = None` this never returns.
    pub fn run(&mut self, max_sessions: Option<u64>) {
        let mut n: u64 = 0;
        loop {
            match self.connector.run_session() {
                Ok(()) => tracing::info!("tunnel: session ended"),
                Err(err) => tracing::warn!(err = %format!("{err:#}"), "tunnel: session failed"),
            }
            n += 1;
            if max_sessions.is_some_and(|max| n >= max) {
                return;
            }

            tracing::info!(
                interval = %humantime::format_duration(self.interval),
                "tunnel: reconnecting"
            );
            self.sleeper.sleep(self.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        rc::Rc,
        thread,
    };

    use super::*;
    use crate::outpost::tunnel::{framer::LineFramer, listener::BindOptions};

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Session,
        Sleep(Duration),
    }

    type Trace = Rc<RefCell<Vec<Event>>>;

    struct FakeConnector {
        trace: Trace,
        fail: bool,
    }

    impl Connector for FakeConnector {
        fn run_session(&mut self) -> anyhow::Result<()> {
            self.trace.borrow_mut().push(Event::Session);
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }
    }

    struct FakeSleeper(Trace);

    impl Sleeper for FakeSleeper {
        fn sleep(&mut self, d: Duration) {
            self.0.borrow_mut().push(Event::Sleep(d));
        }
    }

    #[test]
    fn waits_exactly_one_interval_between_sessions() {
        for fail in [false, true] {
            let trace: Trace = Rc::default();
            let interval = Duration::from_secs(10);
            let mut sup = Supervisor::with_sleeper(
                FakeConnector {
                    trace: trace.clone(),
                    fail,
                },
                interval,
                FakeSleeper(trace.clone()),
            );
            sup.run(Some(2));
            assert_eq!(
                *trace.borrow(),
                vec![Event::Session, Event::Sleep(interval), Event::Session]
            );
        }
    }

    #[test]
    fn zero_interval_falls_back_to_default() {
        let trace: Trace = Rc::default();
        let mut sup = Supervisor::with_sleeper(
            FakeConnector {
                trace: trace.clone(),
                fail: false,
            },
            Duration::ZERO,
            FakeSleeper(trace.clone()),
        );
        sup.run(Some(2));
        assert_eq!(trace.borrow()[1], Event::Sleep(DEFAULT_RECONNECT_INTERVAL));
    }

    fn read_line(conn: &mut TcpStream, framer: &mut LineFramer) -> String {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(line) = framer.next_line() {
                return String::from_utf8(line.to_vec()).unwrap();
            }
            let n = conn.read(&mut buf).unwrap();
            assert!(n > 0, "agent hung up early");
            let _ = framer.feed(&buf[..n]);
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Broker side of one session: handshake, bind `port`, prove it relays, hang up.
    fn serve_one(ln: &TcpListener, port: u16) -> (String, String) {
        let (mut conn, _) = ln.accept().unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut framer = LineFramer::default();

        let hello = read_line(&mut conn, &mut framer);
        conn.write_all(
            format!("{{\"bind\":[{{\"protocol\":\"tcp\",\"port\":{port}}}]}}\n").as_bytes(),
        )
        .unwrap();

        let mut peer = None;
        for _ in 0..100 {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(s) => {
                    peer = Some(s);
                    break;
                }
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        }
        let mut peer = peer.expect("agent never bound the port");
        peer.write_all(b"hi").unwrap();
        let frame = read_line(&mut conn, &mut framer);

        drop(peer);
        drop(conn);
        (hello, frame)
    }

    #[test]
    fn reconnects_with_a_fresh_session() {
        let ln = TcpListener::bind("127.0.0.1:0").unwrap();
        let broker = ln.local_addr().unwrap();
        let (p1, p2) = (free_port(), free_port());

        let server = thread::spawn(move || {
            let first = serve_one(&ln, p1);
            let second = serve_one(&ln, p2);
            (first, second)
        });

        let mut metadata = Metadata::new();
        metadata.insert("id".into(), "agent-9".into());
        let trace: Trace = Rc::default();
        let mut sup = Supervisor::with_sleeper(
            BrokerConnector {
                opts: SessionOptions {
                    broker,
                    bind: BindOptions::default(),
                },
                metadata,
            },
            Duration::from_millis(50),
            FakeSleeper(trace.clone()),
        );
        sup.run(Some(2));

        let (first, second) = server.join().unwrap();
        // Each session handshakes from scratch and accepts a new configuration.
        assert_eq!(first.0, r#"{"id":"agent-9"}"#);
        assert_eq!(second.0, r#"{"id":"agent-9"}"#);
        assert_eq!(first.1, format!("tcp {p1} aGk="));
        assert_eq!(second.1, format!("tcp {p2} aGk="));
        assert_eq!(*trace.borrow(), vec![Event::Sleep(Duration::from_millis(50))]);

        // Nothing from either session is still listening.
        drop(TcpListener::bind(("127.0.0.1", p1)).unwrap());
        drop(TcpListener::bind(("127.0.0.1", p2)).unwrap());
    }
}
