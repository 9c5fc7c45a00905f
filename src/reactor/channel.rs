//! Binding of one socket to one event loop.
//!
//! A channel owns its socket, carries the interest mask, and holds the
//! read/write handlers the loop invokes on readiness. A channel belongs
//! to a single loop for its whole life; closing it deregisters from the
//! poll and closes the fd exactly once.
//!
//! Handlers run on the loop thread only. Invocation takes the handler
//! out of its slot and restores it afterwards, so no lock is held across
//! the call and a handler may replace itself.
//!
//! Readiness is edge-triggered: a channel is created unregistered so its
//! handlers can be installed first, and the first `enable_*` call
//! performs the actual poll registration (which reports any readiness
//! already pending).

use crate::lock;
use crate::reactor::event_loop::EventLoop;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::debug;

static NEXT_CHANNEL_ID: AtomicI64 = AtomicI64::new(0);

/// Handler invoked on read or write readiness.
pub(crate) type EventHandler = Box<dyn FnMut() + Send>;

/// The socket a channel drives. Concrete variants keep the I/O calls
/// typed; callers always know which kind they registered.
pub(crate) enum Sock {
    Stream(TcpStream),
    Listener(TcpListener),
    Datagram(UdpSocket),
}

impl Sock {
    fn register(&mut self, registry: &mio::Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Sock::Stream(s) => registry.register(s, token, interest),
            Sock::Listener(l) => registry.register(l, token, interest),
            Sock::Datagram(d) => registry.register(d, token, interest),
        }
    }

    fn reregister(&mut self, registry: &mio::Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Sock::Stream(s) => registry.reregister(s, token, interest),
            Sock::Listener(l) => registry.reregister(l, token, interest),
            Sock::Datagram(d) => registry.reregister(d, token, interest),
        }
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        match self {
            Sock::Stream(s) => registry.deregister(s),
            Sock::Listener(l) => registry.deregister(l),
            Sock::Datagram(d) => registry.deregister(d),
        }
    }
}

struct InterestFlags {
    read: bool,
    write: bool,
    registered: bool,
}

/// One fd registered with one loop.
pub struct Channel {
    base: EventLoop,
    id: i64,
    token: Token,
    sock: Mutex<Option<Sock>>,
    interest: Mutex<InterestFlags>,
    read_cb: Mutex<Option<EventHandler>>,
    write_cb: Mutex<Option<EventHandler>>,
    closed: AtomicBool,
}

impl Channel {
    pub(crate) fn new(base: EventLoop, sock: Sock, token: Token) -> Self {
        Self {
            base,
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            token,
            sock: Mutex::new(Some(sock)),
            interest: Mutex::new(InterestFlags {
                read: false,
                write: false,
                registered: false,
            }),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Process-unique channel id.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    /// The loop this channel is bound to.
    pub fn base(&self) -> &EventLoop {
        &self.base
    }

    pub(crate) fn set_read_handler(&self, handler: EventHandler) {
        *lock(&self.read_cb) = Some(handler);
    }

    pub(crate) fn set_write_handler(&self, handler: EventHandler) {
        *lock(&self.write_cb) = Some(handler);
    }

    pub fn enable_read(&self, enable: bool) -> io::Result<()> {
        let mut flags = lock(&self.interest);
        flags.read = enable;
        self.apply_interest(&mut flags)
    }

    pub fn enable_write(&self, enable: bool) -> io::Result<()> {
        let mut flags = lock(&self.interest);
        flags.write = enable;
        self.apply_interest(&mut flags)
    }

    pub fn enable_read_write(&self, read: bool, write: bool) -> io::Result<()> {
        let mut flags = lock(&self.interest);
        flags.read = read;
        flags.write = write;
        self.apply_interest(&mut flags)
    }

    pub fn read_enabled(&self) -> bool {
        lock(&self.interest).read
    }

    pub fn write_enabled(&self) -> bool {
        lock(&self.interest).write
    }

    fn apply_interest(&self, flags: &mut InterestFlags) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let registry = self.base.registry();
        let mut guard = lock(&self.sock);
        let Some(sock) = guard.as_mut() else { return Ok(()) };
        let interest = match (flags.read, flags.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        match interest {
            Some(interest) if flags.registered => sock.reregister(registry, self.token, interest),
            Some(interest) => {
                sock.register(registry, self.token, interest)?;
                flags.registered = true;
                Ok(())
            }
            None if flags.registered => {
                flags.registered = false;
                sock.deregister(registry)
            }
            None => Ok(()),
        }
    }

    /// Invoke the read handler, if any.
    pub(crate) fn handle_read(&self) {
        Self::invoke(&self.read_cb);
    }

    /// Invoke the write handler, if any.
    pub(crate) fn handle_write(&self) {
        Self::invoke(&self.write_cb);
    }

    fn invoke(slot: &Mutex<Option<EventHandler>>) {
        let taken = lock(slot).take();
        if let Some(mut handler) = taken {
            handler();
            // Restore unless the handler installed a replacement.
            let mut guard = lock(slot);
            if guard.is_none() {
                *guard = Some(handler);
            }
        }
    }

    /// Remove from the poll and the loop's table, drop the handlers and
    /// close the fd. Idempotent: the fd closes exactly once.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(channel = self.id, "channel closed");
        {
            let mut flags = lock(&self.interest);
            let mut sock = lock(&self.sock);
            if flags.registered {
                flags.registered = false;
                // The kernel already dropped the registration if the fd
                // was closed under us; either way there is nothing left
                // to report.
                if let Some(sock) = sock.as_mut() {
                    let _ = sock.deregister(self.base.registry());
                }
            }
            *sock = None;
        }
        *lock(&self.read_cb) = None;
        *lock(&self.write_cb) = None;
        self.base.remove_channel(self);
    }

    // Typed I/O. The wrong-variant arms are unreachable from within the
    // crate; they fail loudly instead of faulting.

    pub(crate) fn stream_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &*lock(&self.sock) {
            Some(Sock::Stream(s)) => (&mut &*s).read(buf),
            Some(_) => Err(wrong_kind()),
            None => Err(closed()),
        }
    }

    pub(crate) fn stream_write(&self, buf: &[u8]) -> io::Result<usize> {
        match &*lock(&self.sock) {
            Some(Sock::Stream(s)) => (&mut &*s).write(buf),
            Some(_) => Err(wrong_kind()),
            None => Err(closed()),
        }
    }

    pub(crate) fn stream_take_error(&self) -> io::Result<Option<io::Error>> {
        match &*lock(&self.sock) {
            Some(Sock::Stream(s)) => s.take_error(),
            Some(_) => Err(wrong_kind()),
            None => Err(closed()),
        }
    }

    pub(crate) fn stream_peer_addr(&self) -> io::Result<SocketAddr> {
        match &*lock(&self.sock) {
            Some(Sock::Stream(s)) => s.peer_addr(),
            Some(_) => Err(wrong_kind()),
            None => Err(closed()),
        }
    }

    pub(crate) fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match &*lock(&self.sock) {
            Some(Sock::Stream(s)) => s.set_nodelay(nodelay),
            Some(_) => Err(wrong_kind()),
            None => Err(closed()),
        }
    }

    pub(crate) fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match &*lock(&self.sock) {
            Some(Sock::Listener(l)) => l.accept(),
            Some(_) => Err(wrong_kind()),
            None => Err(closed()),
        }
    }

    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match &*lock(&self.sock) {
            Some(Sock::Datagram(d)) => d.recv_from(buf),
            Some(_) => Err(wrong_kind()),
            None => Err(closed()),
        }
    }

    pub(crate) fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        match &*lock(&self.sock) {
            Some(Sock::Datagram(d)) => d.send_to(buf, peer),
            Some(_) => Err(wrong_kind()),
            None => Err(closed()),
        }
    }

    pub(crate) fn dgram_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &*lock(&self.sock) {
            Some(Sock::Datagram(d)) => d.recv(buf),
            Some(_) => Err(wrong_kind()),
            None => Err(closed()),
        }
    }

    pub(crate) fn dgram_send(&self, buf: &[u8]) -> io::Result<usize> {
        match &*lock(&self.sock) {
            Some(Sock::Datagram(d)) => d.send(buf),
            Some(_) => Err(wrong_kind()),
            None => Err(closed()),
        }
    }
}

fn wrong_kind() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "operation on wrong socket kind")
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel closed")
}
