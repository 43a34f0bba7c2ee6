use std::{
    io::{self, Read},
    net::SocketAddr,
};

use mio::{Token, event::Source, net::TcpStream};

use crate::outpost::tunnel::reactor::{Context, Message, Pollable};

/// A TCP peer accepted by a [`Listener`](super::listener::Listener).
///
/// Inbound bytes go to the owning listener; EOF and errors both deregister the peer
/// from the listener and release the socket.
pub struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
    listener: Token,
    buf: Vec<u8>,
}

impl Connection {
    pub fn new(stream: TcpStream, addr: SocketAddr, listener: Token, recv_max: usize) -> Self {
        Self {
            stream,
            addr,
            listener,
            buf: vec![0u8; recv_max.max(1)],
        }
    }

    fn shutdown(&mut self, cx: &mut Context<'_>) {
        cx.send(self.listener, Message::PeerClosed(self.addr));
        cx.close_self();
    }
}

impl Pollable for Connection {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn on_readable(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        loop {
            match self.stream.read(&mut self.buf) {
                Ok(0) => {
                    tracing::info!(peer = %self.addr, "peer: closed");
                    self.shutdown(cx);
                    return Ok(());
                }
                Ok(n) => cx.send(self.listener, Message::PeerData(self.buf[..n].to_vec())),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn on_error(&mut self, cx: &mut Context<'_>, err: io::Error) {
        tracing::info!(peer = %self.addr, err = %err, "peer: error");
        self.shutdown(cx);
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.stream.take_error()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, io::Write, rc::Rc, time::Duration};

    use super::*;
    use crate::outpost::tunnel::reactor::Reactor;

    /// Stands in for a listener: records what its connections report.
    struct Sink {
        sock: mio::net::UdpSocket,
        seen: Rc<RefCell<Vec<Message>>>,
    }

    impl Pollable for Sink {
        fn source(&mut self) -> &mut dyn Source {
            &mut self.sock
        }

        fn on_readable(&mut self, _cx: &mut Context<'_>) -> io::Result<()> {
            Ok(())
        }

        fn on_error(&mut self, _cx: &mut Context<'_>, _err: io::Error) {}

        fn on_message(&mut self, _cx: &mut Context<'_>, msg: Message) {
            self.seen.borrow_mut().push(msg);
        }
    }

    #[test]
    fn forwards_reads_in_order_then_reports_close() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut r = Reactor::new().unwrap();
        let sink = r
            .spawn(Box::new(Sink {
                sock: mio::net::UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap(),
                seen: seen.clone(),
            }))
            .unwrap();

        let ln = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(ln.local_addr().unwrap()).unwrap();
        let (accepted, addr) = ln.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        // Small read size so one write arrives as several reads.
        let conn = Connection::new(TcpStream::from_std(accepted), addr, sink, 4);
        let ct = r.spawn(Box::new(conn)).unwrap();

        client.write_all(b"hello world").unwrap();
        drop(client);

        for _ in 0..100 {
            if !r.contains(ct) {
                break;
            }
            r.turn(Some(Duration::from_millis(20))).unwrap();
        }
        assert!(!r.contains(ct));

        let seen = seen.borrow();
        let mut data = Vec::new();
        for m in seen.iter().take(seen.len() - 1) {
            match m {
                Message::PeerData(p) => {
                    assert!(p.len() <= 4);
                    data.extend_from_slice(p);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(data, b"hello world");
        assert!(matches!(seen.last(), Some(Message::PeerClosed(a)) if *a == addr));
    }
}
