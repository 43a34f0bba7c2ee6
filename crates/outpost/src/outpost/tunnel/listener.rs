use std::{collections::HashMap, io, net::SocketAddr};

use mio::{
    Token,
    event::Source,
    net::{TcpListener, UdpSocket},
};
use thiserror::Error;

use crate::outpost::{
    net, telemetry,
    tunnel::{
        conn::Connection,
        protocol::Protocol,
        reactor::{Context, Message, Pollable},
    },
};

pub const DEFAULT_BACKLOG: i32 = 5;
pub const DEFAULT_RECV_MAX: usize = 8192;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),
    #[error("missing port")]
    MissingPort,
    #[error("port out of range: {0}")]
    PortOutOfRange(i64),
    #[error("bind {protocol}/{port}: {source}")]
    Io {
        protocol: Protocol,
        port: u16,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct BindOptions {
    pub backlog: i32,
    /// Upper bound for a single read or datagram.
    pub recv_max: usize,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            recv_max: DEFAULT_RECV_MAX,
        }
    }
}

enum Socket {
    Tcp {
        listener: TcpListener,
        peers: HashMap<SocketAddr, Token>,
    },
    Udp {
        socket: UdpSocket,
        buf: Vec<u8>,
    },
}

/// One exposed `protocol/port` pair on loopback.
///
/// TCP listeners accept peers and keep them in a registry keyed by remote address; UDP
/// listeners forward each datagram directly. All traffic is tagged and handed to the
/// control channel at `control`.
pub struct Listener {
    protocol: Protocol,
    port: u16,
    control: Token,
    recv_max: usize,
    socket: Socket,
}

impl Listener {
    pub fn bind(
        protocol: Protocol,
        port: u16,
        control: Token,
        opts: BindOptions,
    ) -> Result<Self, BindError> {
        let io_err = |source| BindError::Io {
            protocol,
            port,
            source,
        };
        let socket = match protocol {
            Protocol::Tcp => Socket::Tcp {
                listener: net::bind_tcp_listener(port, opts.backlog).map_err(io_err)?,
                peers: HashMap::new(),
            },
            Protocol::Udp => Socket::Udp {
                socket: net::bind_udp_socket(port).map_err(io_err)?,
                buf: vec![0u8; opts.recv_max],
            },
        };
        Ok(Self {
            protocol,
            port,
            control,
            recv_max: opts.recv_max,
            socket,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer_count(&self) -> usize {
        match &self.socket {
            Socket::Tcp { peers, .. } => peers.len(),
            Socket::Udp { .. } => 0,
        }
    }

    /// Forgets `addr`. Unknown addresses are ignored.
    pub fn remove_client(&mut self, addr: &SocketAddr) -> bool {
        match &mut self.socket {
            Socket::Tcp { peers, .. } => peers.remove(addr).is_some(),
            Socket::Udp { .. } => false,
        }
    }

    fn forward(&self, cx: &mut Context<'_>, payload: Vec<u8>) {
        cx.send(
            self.control,
            Message::ClientData {
                protocol: self.protocol,
                port: self.port,
                payload,
            },
        );
    }
}

impl Pollable for Listener {
    fn source(&mut self) -> &mut dyn Source {
        match &mut self.socket {
            Socket::Tcp { listener, .. } => listener,
            Socket::Udp { socket, .. } => socket,
        }
    }

    fn on_readable(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        let (protocol, port, control, recv_max) =
            (self.protocol, self.port, self.control, self.recv_max);
        match &mut self.socket {
            Socket::Tcp { listener, peers } => loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        let conn = Connection::new(stream, addr, cx.token(), recv_max);
                        match cx.spawn(Box::new(conn)) {
                            Ok(token) => {
                                if let Some(stale) = peers.insert(addr, token) {
                                    cx.close(stale);
                                }
                                telemetry::peer_accepted();
                                tracing::debug!(port, peer = %addr, "listener: accepted");
                            }
                            Err(err) => {
                                tracing::warn!(port, peer = %addr, err = %err, "listener: register peer failed");
                            }
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    // The peer gave up before we got to it.
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                        ) =>
                    {
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            },
            Socket::Udp { socket, buf } => loop {
                match socket.recv_from(buf) {
                    Ok((n, _from)) => cx.send(
                        control,
                        Message::ClientData {
                            protocol,
                            port,
                            payload: buf[..n].to_vec(),
                        },
                    ),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            },
        }
    }

    fn on_error(&mut self, cx: &mut Context<'_>, err: io::Error) {
        tracing::info!(protocol = %self.protocol, port = self.port, err = %err, "listener: error");
        cx.close_self();
    }

    fn on_message(&mut self, cx: &mut Context<'_>, msg: Message) {
        match msg {
            Message::PeerData(payload) => self.forward(cx, payload),
            Message::PeerClosed(addr) => {
                self.remove_client(&addr);
            }
            Message::ClientData { .. } => {}
        }
    }

    fn on_close(&mut self, cx: &mut Context<'_>) {
        let peers_open = self.peer_count();
        if let Socket::Tcp { peers, .. } = &mut self.socket {
            for (_, token) in peers.drain() {
                cx.close(token);
            }
        }
        telemetry::listener_closed();
        tracing::debug!(protocol = %self.protocol, port = self.port, peers = peers_open, "listener: closed");
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        match &self.socket {
            Socket::Tcp { listener, .. } => listener.take_error(),
            Socket::Udp { socket, .. } => socket.take_error(),
        }
    }
}
