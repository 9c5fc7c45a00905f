//! eddy: a reactor-style network I/O foundation.
//!
//! Single-process, multi-loop TCP/UDP plumbing in the tradition of the
//! classic C++ reactor frameworks:
//! - readiness polling (epoll/kqueue via mio) behind per-thread event loops
//! - one-shot and repeating timers keyed to loop time
//! - cross-thread task injection with a poll-breaking waker
//! - a TCP connection state machine with connect timeout and reconnect
//! - idle-connection tracking with per-timeout LRU buckets
//! - pluggable frame codecs (newline-delimited and length-prefixed)
//! - half-sync/half-async servers backed by a worker pool
//!
//! IPv4 only; all sockets are non-blocking and close-on-exec.

pub mod buffer;
pub mod clock;
pub mod codec;
pub mod config;
pub mod conn;
pub mod hsha;
pub mod net;
pub mod queue;
pub mod reactor;
pub mod server;
pub mod thread_pool;
pub mod udp;

pub use buffer::Buffer;
pub use codec::{Codec, CodecError, Frame, LengthCodec, LineCodec};
pub use config::{ConfigError, NetConfig};
pub use conn::{ConnRef, ConnState, TcpConn};
pub use hsha::{HshaServer, UdpHshaServer};
pub use net::Addr;
pub use queue::{SafeQueue, Task};
pub use reactor::event_loop::{EventLoop, LoopGroup, LoopPool};
pub use reactor::timer::TimerId;
pub use server::TcpServer;
pub use thread_pool::ThreadPool;
pub use udp::{UdpConn, UdpServer};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, riding through poisoning: a panicking handler must not
/// wedge every other thread that touches the same connection.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
