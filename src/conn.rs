//! TCP connection state machine.
//!
//! A connection is shared as an `Arc` between the loop that drives its
//! I/O and any application threads holding a handle. All I/O runs on the
//! loop thread; the public setters may be called from anywhere, so each
//! mutable field group sits behind its own small lock and no lock is
//! ever held across a user callback.
//!
//! Lifecycle: `INVALID` until attached, `HANDSHAKING` while a
//! non-blocking connect (or a freshly accepted socket) waits for
//! writability, then `CONNECTED` until peer close, error or an explicit
//! [`close`](TcpConn::close) lands it in `CLOSED`. A handshake that
//! never completes lands in `FAILED`. Clients with a non-negative
//! reconnect interval go back to `HANDSHAKING` on a loop timer.

use crate::buffer::Buffer;
use crate::clock::now_ms;
use crate::codec::{Codec, CodecError};
use crate::config::NetConfig;
use crate::lock;
use crate::net::{self, Addr};
use crate::reactor::channel::{Channel, Sock};
use crate::reactor::event_loop::EventLoop;
use crate::reactor::idle::IdleHandle;
use crate::reactor::timer::TimerId;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Shared connection handle.
pub type ConnRef = Arc<TcpConn>;
/// Callback observing a connection (state change, readable, writable).
pub type ConnCallback = Arc<dyn Fn(&ConnRef) + Send + Sync>;
/// Callback receiving one decoded frame.
pub type MsgCallback = Arc<dyn Fn(&ConnRef, &[u8]) + Send + Sync>;

/// Bytes reserved per read syscall.
const READ_CHUNK: usize = 4096;

static NEXT_CONN_ID: AtomicI64 = AtomicI64::new(1);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Invalid,
    Handshaking,
    Connected,
    Closed,
    Failed,
}

#[derive(Default)]
struct Callbacks {
    read: Option<ConnCallback>,
    write: Option<ConnCallback>,
    state: Option<ConnCallback>,
    msg: Option<MsgCallback>,
}

/// Remembered connect parameters; present iff this is a client
/// connection that knows how to reconnect.
#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    timeout_ms: i64,
    local_ip: String,
}

pub struct TcpConn {
    conn_id: i64,
    base: Mutex<Option<EventLoop>>,
    channel: Mutex<Option<Arc<Channel>>>,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    local: Mutex<Addr>,
    peer: Mutex<Addr>,
    state: Mutex<ConnState>,
    cbs: Mutex<Callbacks>,
    codec: Mutex<Option<Box<dyn Codec>>>,
    idle_handles: Mutex<Vec<IdleHandle>>,
    timeout_timer: Mutex<TimerId>,
    reconnect_interval: Mutex<i64>,
    connected_time: AtomicI64,
    target: Mutex<Option<Target>>,
    cleaning: AtomicBool,
}

impl TcpConn {
    /// Fresh, detached connection in the `INVALID` state.
    pub fn new() -> ConnRef {
        Arc::new(Self {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            base: Mutex::new(None),
            channel: Mutex::new(None),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            local: Mutex::new(Addr::any(0)),
            peer: Mutex::new(Addr::any(0)),
            state: Mutex::new(ConnState::Invalid),
            cbs: Mutex::new(Callbacks::default()),
            codec: Mutex::new(None),
            idle_handles: Mutex::new(Vec::new()),
            timeout_timer: Mutex::new(TimerId::NONE),
            reconnect_interval: Mutex::new(-1),
            connected_time: AtomicI64::new(0),
            target: Mutex::new(None),
            cleaning: AtomicBool::new(false),
        })
    }

    /// Client constructor: start a non-blocking connect on `base`.
    /// `timeout_ms` of 0 means no connect timeout; `local_ip` may be
    /// empty.
    pub fn connect(
        base: &EventLoop,
        host: &str,
        port: u16,
        timeout_ms: i64,
        local_ip: &str,
    ) -> io::Result<ConnRef> {
        let conn = Self::new();
        conn.do_connect(base, host, port, timeout_ms, local_ip)?;
        Ok(conn)
    }

    /// Client constructor taking its timeout and reconnect interval from
    /// `config`.
    pub fn connect_with_config(
        base: &EventLoop,
        host: &str,
        port: u16,
        config: &NetConfig,
    ) -> io::Result<ConnRef> {
        let conn = Self::new();
        conn.set_reconnect_interval(config.reconnect_interval_ms);
        conn.do_connect(base, host, port, config.connect_timeout_ms, "")?;
        Ok(conn)
    }

    /// Begin connecting a connection created with [`new`](Self::new).
    /// Unlike [`connect`](Self::connect) this lets the caller install
    /// callbacks on the detached object first, so no handshake event can
    /// beat them to it.
    pub fn start_connect(
        self: &Arc<Self>,
        base: &EventLoop,
        host: &str,
        port: u16,
        timeout_ms: i64,
        local_ip: &str,
    ) -> io::Result<()> {
        self.do_connect(base, host, port, timeout_ms, local_ip)
    }

    /// Adopt an accepted socket on `base`. The socket is made
    /// non-blocking and watched for both readability and writability
    /// until the (trivial) handshake completes.
    pub fn attach(
        self: &Arc<Self>,
        base: &EventLoop,
        stream: std::net::TcpStream,
        local: Addr,
        peer: Addr,
    ) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        self.attach_stream(base, mio::net::TcpStream::from_std(stream), local, peer)
    }

    pub(crate) fn attach_stream(
        self: &Arc<Self>,
        base: &EventLoop,
        stream: mio::net::TcpStream,
        local: Addr,
        peer: Addr,
    ) -> io::Result<()> {
        {
            let mut state = lock(&self.state);
            debug_assert_eq!(*state, ConnState::Invalid, "attach on a live connection");
            *state = ConnState::Handshaking;
        }
        self.install_channel(base, Sock::Stream(stream), local, peer)
    }

    pub fn state(&self) -> ConnState {
        *lock(&self.state)
    }

    /// True for connections that remember a connect target (and can
    /// therefore reconnect).
    pub fn is_client(&self) -> bool {
        lock(&self.target).is_some()
    }

    pub fn local_addr(&self) -> Addr {
        *lock(&self.local)
    }

    pub fn peer_addr(&self) -> Addr {
        *lock(&self.peer)
    }

    /// Loop time (ms) of the latest successful handshake, or of the
    /// latest connect attempt while none has succeeded yet.
    pub fn connected_time_ms(&self) -> i64 {
        self.connected_time.load(Ordering::SeqCst)
    }

    /// The loop driving this connection, once attached.
    pub fn loop_handle(&self) -> Option<EventLoop> {
        lock(&self.base).clone()
    }

    /// State-transition callback: fired on CONNECTED and on every
    /// terminal transition.
    pub fn on_state(&self, cb: impl Fn(&ConnRef) + Send + Sync + 'static) {
        lock(&self.cbs).state = Some(Arc::new(cb));
    }

    /// Raw-readable callback, fired when new bytes land in the input
    /// buffer and no codec is installed.
    pub fn on_read(&self, cb: impl Fn(&ConnRef) + Send + Sync + 'static) {
        lock(&self.cbs).read = Some(Arc::new(cb));
    }

    /// Fired when the output buffer drains back to empty.
    pub fn on_writable(&self, cb: impl Fn(&ConnRef) + Send + Sync + 'static) {
        lock(&self.cbs).write = Some(Arc::new(cb));
    }

    /// Install a codec and a per-frame callback. Each complete frame is
    /// handed to `cb` and consumed; a malformed stream closes the
    /// connection.
    pub fn on_msg<C: Codec + 'static>(
        &self,
        codec: C,
        cb: impl Fn(&ConnRef, &[u8]) + Send + Sync + 'static,
    ) {
        self.set_codec(Box::new(codec));
        self.set_msg_callback(Arc::new(cb));
    }

    pub fn set_codec(&self, codec: Box<dyn Codec>) {
        *lock(&self.codec) = Some(codec);
    }

    pub fn set_msg_callback(&self, cb: MsgCallback) {
        lock(&self.cbs).msg = Some(cb);
    }

    /// Reconnect interval in ms. Negative disables reconnecting, zero
    /// retries immediately.
    pub fn set_reconnect_interval(&self, interval_ms: i64) {
        *lock(&self.reconnect_interval) = interval_ms;
    }

    /// Fire `cb` whenever this connection has been inactive for
    /// `timeout_s` seconds. Requires the connection to be attached.
    pub fn add_idle_cb(
        self: &Arc<Self>,
        timeout_s: u64,
        cb: impl Fn(&ConnRef) + Send + Sync + 'static,
    ) {
        let Some(base) = self.loop_handle() else {
            warn!(conn = self.conn_id, "idle callback before attach; ignoring");
            return;
        };
        let handle = base.register_idle(timeout_s, self, Arc::new(cb));
        lock(&self.idle_handles).push(handle);
    }

    /// Access the input buffer, e.g. from a raw-readable callback. The
    /// view is only valid inside the closure; consume what you take.
    pub fn with_input<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        f(&mut lock(&self.input))
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match self.channel() {
            Some(channel) => channel.set_nodelay(nodelay),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no channel")),
        }
    }

    /// Queue bytes for delivery. With an empty output buffer the write
    /// is attempted in-line; whatever does not fit is buffered and the
    /// write interest armed. Without a channel the bytes are dropped
    /// with a warning.
    pub fn send(&self, bytes: &[u8]) {
        let Some(channel) = self.channel() else {
            warn!(
                conn = self.conn_id,
                len = bytes.len(),
                "send on a connection with no channel; dropping"
            );
            return;
        };
        let need_write = {
            let mut output = lock(&self.output);
            if output.is_empty() {
                let mut off = 0;
                while off < bytes.len() {
                    match channel.stream_write(&bytes[off..]) {
                        Ok(0) => break,
                        Ok(n) => off += n,
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // Buffer the rest; the event path will
                            // observe the failure and run cleanup.
                            debug!(conn = self.conn_id, error = %e, "in-line write failed");
                            break;
                        }
                    }
                }
                if off < bytes.len() {
                    output.append(&bytes[off..]);
                }
            } else {
                output.append(bytes);
            }
            !output.is_empty()
        };
        if need_write && !channel.write_enabled() {
            let _ = channel.enable_write(true);
        }
    }

    /// Encode one frame through the installed codec and send it.
    pub fn send_msg(&self, msg: &[u8]) -> Result<(), CodecError> {
        let mut staged = Buffer::new();
        {
            let codec = lock(&self.codec);
            let Some(codec) = codec.as_ref() else {
                warn!(conn = self.conn_id, "send_msg without a codec; dropping");
                return Ok(());
            };
            codec.encode(msg, &mut staged)?;
        }
        self.send(staged.data());
        Ok(())
    }

    /// Close the connection. The teardown runs on the owning loop; this
    /// never tears down synchronously from a foreign thread.
    pub fn close(self: &Arc<Self>) {
        let Some(base) = self.loop_handle() else { return };
        if base.exited() {
            self.cleanup();
            return;
        }
        let conn = Arc::clone(self);
        base.safe_call(move || conn.cleanup());
    }

    fn channel(&self) -> Option<Arc<Channel>> {
        lock(&self.channel).clone()
    }

    fn do_connect(
        self: &Arc<Self>,
        base: &EventLoop,
        host: &str,
        port: u16,
        timeout_ms: i64,
        local_ip: &str,
    ) -> io::Result<()> {
        *lock(&self.target) = Some(Target {
            host: host.to_string(),
            port,
            timeout_ms,
            local_ip: local_ip.to_string(),
        });
        self.connected_time.store(now_ms(), Ordering::SeqCst);

        let dest = Addr::resolve(host, port);
        let stream = net::tcp_connect(&dest, local_ip)?;
        let local = stream.local_addr().map(Addr::from).unwrap_or_else(|_| Addr::any(0));
        let stream = mio::net::TcpStream::from_std(stream);
        {
            let mut state = lock(&self.state);
            *state = ConnState::Handshaking;
        }
        debug!(conn = self.conn_id, dest = %dest, "connecting");
        self.install_channel(base, Sock::Stream(stream), local, dest)?;

        if timeout_ms > 0 {
            let weak = Arc::downgrade(self);
            let id = base.run_after(
                timeout_ms,
                move || {
                    if let Some(conn) = weak.upgrade() {
                        if conn.state() == ConnState::Handshaking {
                            debug!(conn = conn.conn_id, "connect timed out");
                            conn.cleanup();
                        }
                    }
                },
                0,
            );
            *lock(&self.timeout_timer) = id;
        }
        Ok(())
    }

    fn install_channel(
        self: &Arc<Self>,
        base: &EventLoop,
        sock: Sock,
        local: Addr,
        peer: Addr,
    ) -> io::Result<()> {
        *lock(&self.base) = Some(base.clone());
        *lock(&self.local) = local;
        *lock(&self.peer) = peer;

        let channel = base.add_channel(sock);
        let weak = Arc::downgrade(self);
        channel.set_read_handler(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read();
            }
        }));
        let weak = Arc::downgrade(self);
        channel.set_write_handler(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        }));
        if let Err(e) = channel.enable_read_write(true, true) {
            channel.close();
            return Err(e);
        }

        let old = lock(&self.channel).replace(channel);
        if let Some(old) = old {
            old.close();
        }
        Ok(())
    }

    fn handle_read(self: &Arc<Self>) {
        if self.state() == ConnState::Handshaking && !self.handle_handshake() {
            return;
        }
        loop {
            if self.state() != ConnState::Connected {
                return;
            }
            let Some(channel) = self.channel() else { return };
            let result = {
                let mut input = lock(&self.input);
                let room = input.make_room(READ_CHUNK);
                match channel.stream_read(room) {
                    Ok(n) => {
                        input.commit(n);
                        Ok(n)
                    }
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(0) => {
                    self.cleanup();
                    return;
                }
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.touch_idle();
                    self.dispatch_input();
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = self.conn_id, error = %e, "read failed");
                    self.cleanup();
                    return;
                }
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        match self.state() {
            ConnState::Handshaking => {
                self.handle_handshake();
            }
            ConnState::Connected => self.flush_output(),
            _ => {}
        }
    }

    /// Resolve an in-progress connect: writable with no pending socket
    /// error means connected. Returns true once the connection is up.
    fn handle_handshake(self: &Arc<Self>) -> bool {
        if self.state() != ConnState::Handshaking {
            return self.state() == ConnState::Connected;
        }
        let Some(channel) = self.channel() else { return false };
        let verdict = match channel.stream_take_error() {
            Ok(None) => match channel.stream_peer_addr() {
                Ok(_) => Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::NotConnected => return false,
                Err(e) => Err(e),
            },
            Ok(Some(e)) => Err(e),
            Err(e) => Err(e),
        };
        match verdict {
            Ok(()) => {
                *lock(&self.state) = ConnState::Connected;
                self.connected_time.store(now_ms(), Ordering::SeqCst);
                let _ = channel.enable_read_write(true, false);
                debug!(conn = self.conn_id, peer = %self.peer_addr(), "connected");
                self.fire_state_cb();
                // Bytes queued during the handshake go out now.
                self.flush_output();
                true
            }
            Err(e) => {
                debug!(conn = self.conn_id, error = %e, "connect failed");
                self.cleanup();
                false
            }
        }
    }

    fn flush_output(self: &Arc<Self>) {
        let Some(channel) = self.channel() else { return };
        let mut failed = false;
        let emptied = {
            let mut output = lock(&self.output);
            loop {
                if output.is_empty() {
                    break;
                }
                match channel.stream_write(output.data()) {
                    Ok(0) => break,
                    Ok(n) => output.consume(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(conn = self.conn_id, error = %e, "write failed");
                        failed = true;
                        break;
                    }
                }
            }
            output.is_empty()
        };
        if failed {
            self.cleanup();
            return;
        }
        if emptied {
            if channel.write_enabled() {
                let _ = channel.enable_write(false);
                let cb = lock(&self.cbs).write.clone();
                if let Some(cb) = cb {
                    cb(self);
                }
            }
        } else if !channel.write_enabled() {
            let _ = channel.enable_write(true);
        }
    }

    /// Run the decode loop (codec installed) or the raw readable
    /// callback over whatever sits in the input buffer.
    fn dispatch_input(self: &Arc<Self>) {
        loop {
            if self.state() != ConnState::Connected {
                return;
            }
            enum Step {
                Frame(Vec<u8>),
                Raw,
                Wait,
                Bad,
            }
            let step = {
                let codec = lock(&self.codec);
                match codec.as_ref() {
                    None => Step::Raw,
                    Some(codec) => {
                        let mut input = lock(&self.input);
                        match codec.try_decode(input.data()) {
                            Ok(Some(frame)) => {
                                let bytes = input.data()[frame.payload.clone()].to_vec();
                                input.consume(frame.consumed);
                                Step::Frame(bytes)
                            }
                            Ok(None) => Step::Wait,
                            Err(e) => {
                                warn!(conn = self.conn_id, error = %e, "decode failed");
                                Step::Bad
                            }
                        }
                    }
                }
            };
            match step {
                Step::Frame(bytes) => {
                    let cb = lock(&self.cbs).msg.clone();
                    if let Some(cb) = cb {
                        cb(self, &bytes);
                    }
                }
                Step::Raw => {
                    let cb = lock(&self.cbs).read.clone();
                    if let Some(cb) = cb {
                        if !lock(&self.input).is_empty() {
                            cb(self);
                        }
                    }
                    return;
                }
                Step::Wait => return,
                Step::Bad => {
                    self.cleanup();
                    return;
                }
            }
        }
    }

    fn touch_idle(&self) {
        let Some(base) = self.loop_handle() else { return };
        let handles: Vec<IdleHandle> = lock(&self.idle_handles).clone();
        for handle in handles {
            base.update_idle(handle);
        }
    }

    fn fire_state_cb(self: &Arc<Self>) {
        let cb = lock(&self.cbs).state.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Terminal transition. Exactly one caller wins; late and re-entrant
    /// calls are no-ops. Runs on the loop thread.
    pub(crate) fn cleanup(self: &Arc<Self>) {
        if self.cleaning.swap(true, Ordering::SeqCst) {
            return;
        }
        let prior = self.state();
        if !matches!(prior, ConnState::Handshaking | ConnState::Connected) {
            self.cleaning.store(false, Ordering::SeqCst);
            return;
        }

        // Deliver anything still buffered before the state flips.
        if prior == ConnState::Connected {
            self.dispatch_input();
        }

        *lock(&self.state) = if prior == ConnState::Handshaking {
            ConnState::Failed
        } else {
            ConnState::Closed
        };
        debug!(conn = self.conn_id, state = ?self.state(), "connection down");

        let timer = std::mem::replace(&mut *lock(&self.timeout_timer), TimerId::NONE);
        let base = self.loop_handle();
        if let Some(base) = &base {
            if !timer.is_none() {
                base.cancel(timer);
            }
        }

        self.fire_state_cb();

        let interval = *lock(&self.reconnect_interval);
        let reconnectable = interval >= 0
            && self.is_client()
            && base.as_ref().map(|b| !b.exited()).unwrap_or(false);
        if reconnectable {
            // The fd goes away now; the Channel slot itself is replaced
            // when the next attempt attaches.
            if let Some(channel) = self.channel() {
                channel.close();
            }
            if let Some(base) = base {
                self.schedule_reconnect(&base, interval);
            }
            self.cleaning.store(false, Ordering::SeqCst);
            return;
        }

        let handles: Vec<IdleHandle> = lock(&self.idle_handles).drain(..).collect();
        if let Some(base) = &base {
            for handle in handles {
                base.unregister_idle(handle);
            }
        }

        {
            let mut cbs = lock(&self.cbs);
            *cbs = Callbacks::default();
        }
        *lock(&self.codec) = None;
        if let Some(channel) = lock(&self.channel).take() {
            channel.close();
        }
        self.cleaning.store(false, Ordering::SeqCst);
    }

    /// Park the connection in the loop's reconnect set and schedule the
    /// next attempt, spaced `interval` from the last (attempted)
    /// connection time.
    fn schedule_reconnect(self: &Arc<Self>, base: &EventLoop, interval_ms: i64) {
        base.hold_for_reconnect(self.conn_id, Arc::clone(self));
        let elapsed = now_ms() - self.connected_time.load(Ordering::SeqCst);
        let delay = (interval_ms - elapsed).max(0);
        debug!(conn = self.conn_id, delay, "reconnect scheduled");
        let conn_id = self.conn_id;
        let base_handle = base.clone();
        base.run_after(
            delay,
            move || {
                let Some(conn) = base_handle.take_reconnect(conn_id) else { return };
                if base_handle.exited() {
                    return;
                }
                conn.retry_connect(&base_handle);
            },
            0,
        );
    }

    fn retry_connect(self: &Arc<Self>, base: &EventLoop) {
        let target = lock(&self.target).clone();
        let Some(t) = target else { return };
        *lock(&self.state) = ConnState::Invalid;
        if let Err(e) = self.do_connect(base, &t.host, t.port, t.timeout_ms, &t.local_ip) {
            warn!(conn = self.conn_id, error = %e, "reconnect attempt failed");
            *lock(&self.state) = ConnState::Failed;
            self.fire_state_cb();
            let interval = *lock(&self.reconnect_interval);
            if interval >= 0 && !base.exited() {
                self.schedule_reconnect(base, interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_conn_is_invalid() {
        let conn = TcpConn::new();
        assert_eq!(conn.state(), ConnState::Invalid);
        assert!(!conn.is_client());
        assert_eq!(conn.connected_time_ms(), 0);
        assert!(conn.loop_handle().is_none());
    }

    #[test]
    fn test_send_without_channel_drops() {
        let conn = TcpConn::new();
        conn.send(b"nowhere to go");
        assert_eq!(conn.state(), ConnState::Invalid);
    }

    #[test]
    fn test_send_msg_without_codec_is_a_noop() {
        let conn = TcpConn::new();
        assert!(conn.send_msg(b"frame").is_ok());
    }

    #[test]
    fn test_close_without_base_is_a_noop() {
        let conn = TcpConn::new();
        conn.close();
        assert_eq!(conn.state(), ConnState::Invalid);
    }

    #[test]
    fn test_cleanup_requires_live_state() {
        let conn = TcpConn::new();
        conn.cleanup();
        assert_eq!(conn.state(), ConnState::Invalid);
    }
}
