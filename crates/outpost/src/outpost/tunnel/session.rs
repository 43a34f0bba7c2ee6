use std::net::SocketAddr;

use anyhow::Context as _;
use mio::Token;

use crate::outpost::{
    telemetry,
    tunnel::{
        control::ControlChannel, listener::BindOptions, protocol::Metadata, reactor::Reactor,
    },
};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub broker: SocketAddr,
    pub bind: BindOptions,
}

/// One connect → handshake → relay → teardown lifetime.
///
/// Every session gets its own reactor, so nothing a previous session opened can leak
/// into the next one.
#[derive(Debug)]
pub struct Session {
    id: String,
    reactor: Reactor,
    control: Token,
}

impl Session {
    pub fn start(opts: &SessionOptions, metadata: &Metadata) -> anyhow::Result<Self> {
        let id = telemetry::new_session_id();
        let mut reactor = Reactor::new().context("session: create poller")?;
        let control = ControlChannel::connect(opts.broker, metadata, id.clone(), opts.bind)
            .with_context(|| format!("session: connect {}", opts.broker))?;
        let control = reactor
            .spawn(Box::new(control))
            .context("session: register control channel")?;

        telemetry::session_started();
        tracing::debug!(session = %id, broker = %opts.broker, "session: started");
        Ok(Self {
            id,
            reactor,
            control,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drives the session until the control channel and everything it owns is closed.
    pub fn run(mut self) -> anyhow::Result<()> {
        let res = self.reactor.run();
        // A poll failure leaves handles behind; close them before reporting.
        if self.reactor.contains(self.control) {
            tracing::debug!(session = %self.id, handles = self.reactor.len(), "session: closing leftover handles");
            self.reactor.close(self.control);
        }
        res.with_context(|| format!("session {}: event loop failed", self.id))?;
        tracing::debug!(session = %self.id, "session: ended");
        Ok(())
    }
}
