//! A single engine-owned `mio::Poll` shared by every command, replacing
//! the teacher's one-`Poll`-per-connection pattern so the dispatcher can
//! drive many commands cooperatively on one thread.

use std::collections::HashSet;
use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

pub struct SocketMultiplexer {
    poll: Poll,
    events: Events,
    next_token: usize,
    readable: HashSet<Token>,
    writable: HashSet<Token>,
}

impl SocketMultiplexer {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            next_token: 0,
            readable: HashSet::new(),
            writable: HashSet::new(),
        })
    }

    /// Hands out a fresh, process-unique token for a new socket
    /// registration.
    pub fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Registers any `mio` event source (`TcpStream`, `UdpSocket`, ...)
    /// under a token allocated via `alloc_token`.
    pub fn register<S: Source + ?Sized>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister<S: Source + ?Sized>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S: Source + ?Sized>(&mut self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Blocks up to `timeout` for readiness, then records which tokens
    /// became readable/writable this tick.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<()> {
        self.readable.clear();
        self.writable.clear();
        self.poll.poll(&mut self.events, Some(timeout))?;
        for event in self.events.iter() {
            if event.is_readable() {
                self.readable.insert(event.token());
            }
            if event.is_writable() {
                self.writable.insert(event.token());
            }
        }
        Ok(())
    }

    pub fn is_readable(&self, token: Token) -> bool {
        self.readable.contains(&token)
    }

    pub fn is_writable(&self, token: Token) -> bool {
        self.writable.contains(&token)
    }

    pub fn has_any_events(&self) -> bool {
        !self.readable.is_empty() || !self.writable.is_empty()
    }
}
