use std::{
    io::{self, Read, Write},
    net::SocketAddr,
};

use bytes::Bytes;
use mio::{Token, event::Source, net::TcpStream};

use crate::outpost::{
    telemetry,
    tunnel::{
        framer::{LINE_DELIMITER, LineFramer},
        listener::{BindOptions, Listener},
        outbuf::OutputBuffer,
        protocol::{self, Configuration, Metadata, Protocol, ProtocolError},
        reactor::{Context, Message, Pollable},
    },
};

#[derive(Debug)]
enum State {
    Handshaking,
    Bound(Configuration),
}

/// The agent's single connection to the broker.
///
/// Sends the metadata line first, takes the first inbound line as the session
/// configuration, binds its listeners, and from then on relays every local read as a
/// tagged line. Closing it closes every listener it bound.
pub struct ControlChannel {
    stream: TcpStream,
    broker: SocketAddr,
    session: String,
    connected: bool,
    state: State,
    framer: LineFramer,
    out: OutputBuffer,
    listeners: Vec<Token>,
    bind: BindOptions,
    buf: Vec<u8>,
}

impl ControlChannel {
    /// Starts a non-blocking connect and queues the handshake.
    pub fn connect(
        broker: SocketAddr,
        metadata: &Metadata,
        session: String,
        bind: BindOptions,
    ) -> anyhow::Result<Self> {
        let handshake = protocol::encode_metadata(metadata)?;
        let stream = TcpStream::connect(broker)?;

        let mut ch = Self {
            stream,
            broker,
            session,
            connected: false,
            state: State::Handshaking,
            framer: LineFramer::new(LINE_DELIMITER),
            out: OutputBuffer::new(),
            listeners: Vec::new(),
            bind,
            buf: vec![0u8; bind.recv_max.max(1)],
        };
        ch.send_line(handshake.as_bytes());
        Ok(ch)
    }

    /// Frames a local read as `<protocol> <port> <base64>` and queues it for the broker.
    pub fn receive_client_data(&mut self, protocol: Protocol, port: u16, payload: &[u8]) {
        let line = protocol::encode_data_frame(protocol, port, payload);
        self.send_line(line.as_bytes());
        telemetry::frame_relayed(protocol, payload.len());
    }

    fn send_line(&mut self, line: &[u8]) {
        self.out.enqueue(line);
        self.out.enqueue(&[LINE_DELIMITER]);
    }

    /// Returns `false` once the session has been torn down.
    fn receive_line(&mut self, cx: &mut Context<'_>, line: Bytes) -> bool {
        match self.state {
            State::Handshaking => match protocol::parse_configuration(&line) {
                Ok(cfg) => self.bind_all(cx, cfg),
                Err(err) => {
                    self.reject_configuration(cx, &err);
                    false
                }
            },
            State::Bound(ref cfg) => {
                tracing::debug!(session = %self.session, len = line.len(), bound = cfg.bind.len(), "control: ignoring line after configuration");
                true
            }
        }
    }

    fn reject_configuration(&mut self, cx: &mut Context<'_>, err: &ProtocolError) {
        tracing::error!(session = %self.session, err = %err, "control: invalid configuration");
        cx.close_self();
    }

    fn bind_all(&mut self, cx: &mut Context<'_>, cfg: Configuration) -> bool {
        tracing::info!(session = %self.session, bind = ?cfg.bind, "control: configuration received");

        for entry in &cfg.bind {
            let bound = entry
                .target()
                .and_then(|(proto, port)| Listener::bind(proto, port, cx.token(), self.bind));
            match bound {
                Ok(ln) => {
                    let (proto, port) = (ln.protocol(), ln.port());
                    match cx.spawn(Box::new(ln)) {
                        Ok(token) => {
                            tracing::info!(session = %self.session, protocol = %proto, port, "control: listening");
                            telemetry::listener_opened();
                            self.listeners.push(token);
                        }
                        Err(err) => {
                            telemetry::bind_failed();
                            tracing::error!(session = %self.session, entry = %entry, err = %err, "control: failed to register listener");
                        }
                    }
                }
                Err(err) => {
                    telemetry::bind_failed();
                    tracing::error!(session = %self.session, entry = %entry, err = %err, "control: failed to bind");
                }
            }
        }

        let requested = cfg.bind.len();
        self.state = State::Bound(cfg);

        if self.listeners.len() != requested {
            tracing::error!(
                session = %self.session,
                bound = self.listeners.len(),
                requested,
                "control: unable to bind everything"
            );
            cx.close_self();
            return false;
        }
        true
    }

    fn check_connected(&mut self) -> io::Result<bool> {
        if self.connected {
            return Ok(true);
        }
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                tracing::info!(session = %self.session, broker = %self.broker, "control: connected");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl Pollable for ControlChannel {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn wants_write(&self) -> bool {
        !self.connected || self.out.has_pending_output()
    }

    fn on_readable(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        loop {
            let n = match self.stream.read(&mut self.buf) {
                Ok(0) => {
                    tracing::info!(session = %self.session, "control: closed");
                    cx.close_self();
                    return Ok(());
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };

            let lines: Vec<Bytes> = self.framer.feed(&self.buf[..n]).collect();
            for line in lines {
                if !self.receive_line(cx, line) {
                    return Ok(());
                }
            }
        }
    }

    fn on_writable(&mut self, _cx: &mut Context<'_>) -> io::Result<()> {
        if !self.check_connected()? {
            return Ok(());
        }
        let stream = &mut self.stream;
        while self.out.has_pending_output() {
            match self.out.drain(|b| stream.write(b)) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn on_error(&mut self, cx: &mut Context<'_>, err: io::Error) {
        tracing::error!(session = %self.session, broker = %self.broker, err = %err, "control: error");
        cx.close_self();
    }

    fn on_message(&mut self, _cx: &mut Context<'_>, msg: Message) {
        if let Message::ClientData {
            protocol,
            port,
            payload,
        } = msg
        {
            self.receive_client_data(protocol, port, &payload);
        }
    }

    fn on_close(&mut self, cx: &mut Context<'_>) {
        for token in self.listeners.drain(..) {
            cx.close(token);
        }
        if self.out.has_pending_output() || !self.framer.pending().is_empty() {
            tracing::debug!(
                session = %self.session,
                unsent = self.out.pending().len(),
                partial = self.framer.pending().len(),
                "control: discarding buffered data"
            );
        }
        self.state = State::Handshaking;
        self.out.clear();
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.stream.take_error()
    }
}
