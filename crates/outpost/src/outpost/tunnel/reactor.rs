//! Single-threaded readiness loop.
//!
//! The reactor owns every live socket as a boxed [`Pollable`]. Callbacks never touch
//! other handles directly; they queue commands on their [`Context`] (spawn, close,
//! send a message) which the reactor applies once the callback has returned. One
//! callback always runs to completion before the next one starts.

use std::{
    collections::{HashMap, VecDeque},
    io,
    net::SocketAddr,
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, event::Source};

use crate::outpost::tunnel::protocol::Protocol;

const EVENTS_CAPACITY: usize = 256;

/// Notifications passed between handles.
#[derive(Debug)]
pub enum Message {
    /// Raw bytes read from a local peer, bound for the broker.
    ClientData {
        protocol: Protocol,
        port: u16,
        payload: Vec<u8>,
    },
    /// Bytes read by an accepted connection, for its listener to tag.
    PeerData(Vec<u8>),
    /// An accepted connection went away on its own.
    PeerClosed(SocketAddr),
}

/// Capabilities the reactor needs from a socket owner.
///
/// Readiness is edge-triggered: `on_readable`/`on_writable` must keep going until the
/// socket reports `WouldBlock`. Returning an error routes it to `on_error`.
pub trait Pollable {
    fn source(&mut self) -> &mut dyn Source;

    fn wants_read(&self) -> bool {
        true
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn on_readable(&mut self, cx: &mut Context<'_>) -> io::Result<()>;

    fn on_writable(&mut self, _cx: &mut Context<'_>) -> io::Result<()> {
        Ok(())
    }

    fn on_error(&mut self, cx: &mut Context<'_>, err: io::Error);

    fn on_message(&mut self, _cx: &mut Context<'_>, _msg: Message) {}

    /// Called once when the handle is being closed, before its socket is released.
    fn on_close(&mut self, _cx: &mut Context<'_>) {}

    /// Pending socket error (`SO_ERROR`), consulted on error readiness.
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }
}

enum Command {
    Insert(Token, Box<dyn Pollable>, Interest),
    Close(Token),
    Deliver(Token, Message),
}

/// What a callback may ask of the reactor.
pub struct Context<'a> {
    token: Token,
    poll: &'a Poll,
    next_token: &'a mut usize,
    commands: &'a mut VecDeque<Command>,
}

impl Context<'_> {
    /// Token of the handle whose callback is running.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Registers a new handle. It starts receiving events from the next poll.
    pub fn spawn(&mut self, mut handle: Box<dyn Pollable>) -> io::Result<Token> {
        let token = Token(*self.next_token);
        let interest = interest_of(handle.as_ref());
        self.poll
            .registry()
            .register(handle.source(), token, interest)?;
        *self.next_token += 1;
        self.commands
            .push_back(Command::Insert(token, handle, interest));
        Ok(token)
    }

    pub fn send(&mut self, to: Token, msg: Message) {
        self.commands.push_back(Command::Deliver(to, msg));
    }

    /// Closes `token`; closing an unknown or already closed token is a no-op.
    pub fn close(&mut self, token: Token) {
        self.commands.push_back(Command::Close(token));
    }

    pub fn close_self(&mut self) {
        self.close(self.token);
    }
}

struct Slot {
    handle: Box<dyn Pollable>,
    interest: Interest,
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
    error: bool,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    handles: HashMap<Token, Slot>,
    next_token: usize,
    commands: VecDeque<Command>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            handles: HashMap::new(),
            next_token: 0,
            commands: VecDeque::new(),
        })
    }

    pub fn spawn(&mut self, handle: Box<dyn Pollable>) -> io::Result<Token> {
        let mut cx = Context {
            token: Token(usize::MAX),
            poll: &self.poll,
            next_token: &mut self.next_token,
            commands: &mut self.commands,
        };
        let token = cx.spawn(handle)?;
        self.apply_commands();
        Ok(token)
    }

    pub fn close(&mut self, token: Token) {
        self.close_handle(token);
        self.apply_commands();
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn contains(&self, token: Token) -> bool {
        self.handles.contains_key(&token)
    }

    /// Runs until no handle is left.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.is_empty() {
            self.turn(None)?;
        }
        Ok(())
    }

    /// Waits for readiness once (up to `timeout`) and dispatches what fired.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        let ready: Vec<(Token, Readiness)> = self
            .events
            .iter()
            .map(|ev| {
                (
                    ev.token(),
                    Readiness {
                        readable: ev.is_readable() || ev.is_read_closed(),
                        writable: ev.is_writable(),
                        error: ev.is_error(),
                    },
                )
            })
            .collect();

        for (token, r) in ready {
            self.dispatch(token, r);
        }
        Ok(())
    }

    fn dispatch(&mut self, token: Token, r: Readiness) {
        if r.error {
            let pending = match self.handles.get(&token) {
                Some(slot) => slot.handle.take_error(),
                None => return,
            };
            let err = match pending {
                Ok(Some(err)) | Err(err) => Some(err),
                Ok(None) => None,
            };
            if let Some(err) = err {
                self.with_handle(token, |h, cx| {
                    h.on_error(cx, err);
                    Ok(())
                });
                return;
            }
        }

        if r.readable {
            self.with_handle(token, |h, cx| h.on_readable(cx));
        }
        if r.writable && self.contains(token) {
            self.with_handle(token, |h, cx| h.on_writable(cx));
        }
    }

    /// Runs `f` against the handle at `token`, applies queued commands, and re-syncs
    /// its interest. An error from `f` is routed to the handle's `on_error`.
    fn with_handle<F>(&mut self, token: Token, f: F)
    where
        F: FnOnce(&mut dyn Pollable, &mut Context<'_>) -> io::Result<()>,
    {
        let Some(mut slot) = self.handles.remove(&token) else {
            return;
        };

        {
            let mut cx = Context {
                token,
                poll: &self.poll,
                next_token: &mut self.next_token,
                commands: &mut self.commands,
            };
            if let Err(err) = f(slot.handle.as_mut(), &mut cx) {
                slot.handle.on_error(&mut cx, err);
            }
        }

        self.handles.insert(token, slot);
        self.apply_commands();
        self.sync_interest(token);
    }

    fn apply_commands(&mut self) {
        while let Some(cmd) = self.commands.pop_front() {
            self.process(cmd);
        }
    }

    fn process(&mut self, cmd: Command) {
        match cmd {
            Command::Insert(token, handle, interest) => {
                self.handles.insert(token, Slot { handle, interest });
            }
            Command::Close(token) => self.close_handle(token),
            Command::Deliver(to, msg) => {
                let Some(mut slot) = self.handles.remove(&to) else {
                    tracing::trace!(token = to.0, ?msg, "reactor: message for closed handle dropped");
                    return;
                };
                {
                    let mut cx = Context {
                        token: to,
                        poll: &self.poll,
                        next_token: &mut self.next_token,
                        commands: &mut self.commands,
                    };
                    slot.handle.on_message(&mut cx, msg);
                }
                self.handles.insert(to, slot);
                self.sync_interest(to);
            }
        }
    }

    /// Closes children queued by `on_close` before releasing the handle's own socket.
    fn close_handle(&mut self, token: Token) {
        let Some(mut slot) = self.handles.remove(&token) else {
            return;
        };

        let mut children = VecDeque::new();
        {
            let mut cx = Context {
                token,
                poll: &self.poll,
                next_token: &mut self.next_token,
                commands: &mut children,
            };
            slot.handle.on_close(&mut cx);
        }
        for cmd in children {
            self.process(cmd);
        }

        if let Err(err) = self.poll.registry().deregister(slot.handle.source()) {
            tracing::debug!(token = token.0, err = %err, "reactor: deregister failed");
        }
    }

    fn sync_interest(&mut self, token: Token) {
        let Some(slot) = self.handles.get_mut(&token) else {
            return;
        };
        let want = interest_of(slot.handle.as_ref());
        if want == slot.interest {
            return;
        }
        match self
            .poll
            .registry()
            .reregister(slot.handle.source(), token, want)
        {
            Ok(()) => slot.interest = want,
            Err(err) => {
                tracing::warn!(token = token.0, err = %err, "reactor: reregister failed; closing handle");
                self.close_handle(token);
                self.apply_commands();
            }
        }
    }
}

fn interest_of(h: &dyn Pollable) -> Interest {
    match (h.wants_read(), h.wants_write()) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use mio::net::UdpSocket;

    use super::*;

    type Log = Rc<RefCell<Vec<String>>>;

    struct Tracer {
        name: &'static str,
        sock: UdpSocket,
        children: Vec<Token>,
        log: Log,
    }

    impl Tracer {
        fn boxed(name: &'static str, children: Vec<Token>, log: &Log) -> Box<dyn Pollable> {
            let sock = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            Box::new(Tracer {
                name,
                sock,
                children,
                log: log.clone(),
            })
        }
    }

    impl Drop for Tracer {
        fn drop(&mut self) {
            self.log.borrow_mut().push(format!("drop {}", self.name));
        }
    }

    impl Pollable for Tracer {
        fn source(&mut self) -> &mut dyn Source {
            &mut self.sock
        }

        fn on_readable(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
            let mut buf = [0u8; 64];
            loop {
                match self.sock.recv_from(&mut buf) {
                    Ok((n, _)) => {
                        if &buf[..n] == b"close" {
                            cx.close_self();
                        }
                        self.log
                            .borrow_mut()
                            .push(format!("{} read {}", self.name, n));
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        }

        fn on_error(&mut self, cx: &mut Context<'_>, _err: io::Error) {
            cx.close_self();
        }

        fn on_message(&mut self, _cx: &mut Context<'_>, msg: Message) {
            if let Message::PeerClosed(addr) = msg {
                self.log
                    .borrow_mut()
                    .push(format!("{} peer {}", self.name, addr.port()));
            }
        }

        fn on_close(&mut self, cx: &mut Context<'_>) {
            self.log.borrow_mut().push(format!("close {}", self.name));
            for c in self.children.drain(..) {
                cx.close(c);
            }
        }
    }

    #[test]
    fn closing_parent_releases_children_first() {
        let log: Log = Rc::default();
        let mut r = Reactor::new().unwrap();

        let a = r.spawn(Tracer::boxed("a", vec![], &log)).unwrap();
        let b = r.spawn(Tracer::boxed("b", vec![], &log)).unwrap();
        let parent = r.spawn(Tracer::boxed("parent", vec![a, b], &log)).unwrap();
        assert_eq!(r.len(), 3);

        r.close(parent);
        assert!(r.is_empty());
        assert_eq!(
            *log.borrow(),
            vec!["close parent", "close a", "drop a", "close b", "drop b", "drop parent"]
        );

        // Closing again is harmless.
        r.close(parent);
        r.close(a);
        assert!(r.is_empty());
    }

    #[test]
    fn messages_reach_live_handles_only() {
        let log: Log = Rc::default();
        let mut r = Reactor::new().unwrap();
        let t = r.spawn(Tracer::boxed("p", vec![], &log)).unwrap();

        let peer: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        {
            let mut cx = Context {
                token: Token(usize::MAX),
                poll: &r.poll,
                next_token: &mut r.next_token,
                commands: &mut r.commands,
            };
            cx.send(t, Message::PeerClosed(peer));
            cx.send(Token(999), Message::PeerClosed(peer));
        }
        r.apply_commands();
        assert_eq!(*log.borrow(), vec!["p peer 4242"]);
    }

    #[test]
    fn readable_event_dispatches_and_self_close_ends_loop() {
        let log: Log = Rc::default();
        let mut r = Reactor::new().unwrap();

        let sock = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = sock.local_addr().unwrap();
        r.spawn(Box::new(Tracer {
            name: "u",
            sock,
            children: vec![],
            log: log.clone(),
        }))
        .unwrap();

        let tx = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(b"hi", addr).unwrap();
        tx.send_to(b"close", addr).unwrap();

        for _ in 0..50 {
            if r.is_empty() {
                break;
            }
            r.turn(Some(Duration::from_millis(20))).unwrap();
        }
        assert!(r.is_empty());
        let log = log.borrow();
        assert_eq!(log[0], "u read 2");
        assert!(log.contains(&"close u".to_string()));
        assert_eq!(log.last().map(String::as_str), Some("drop u"));
    }
}
