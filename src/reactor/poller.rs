//! Readiness polling over the platform multiplexer.
//!
//! `mio::Poll` fronts epoll on Linux and kqueue on the BSDs/macOS, which
//! is exactly the abstraction the loop needs: add/modify/remove interest
//! plus a blocking wait with a millisecond timeout.

use mio::{Events, Poll, Registry, Token};
use std::io;
use std::time::Duration;

/// One ready event, copied out of the kernel batch so the poller lock is
/// released before any handler runs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    /// Failure here is fatal to the loop being constructed.
    pub fn new(max_events: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(max_events.max(1)),
        })
    }

    pub fn registry(&self) -> io::Result<Registry> {
        self.poll.registry().try_clone()
    }

    /// Wait up to `timeout` and copy the ready set into `out`, in reverse
    /// arrival order (the dispatch order handlers observe). An
    /// interrupted wait reports zero events; any other failure surfaces
    /// to the caller, who logs it and keeps looping.
    pub fn wait(&mut self, timeout: Duration, out: &mut Vec<Ready>) -> io::Result<usize> {
        out.clear();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }
        for event in self.events.iter() {
            out.push(Ready {
                token: event.token(),
                readable: event.is_readable() || event.is_error() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
            });
        }
        out.reverse();
        Ok(out.len())
    }
}
