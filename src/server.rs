//! TCP listener that dispatches accepted connections across a loop pool.
//!
//! The listening channel lives on one "accept loop" picked from the
//! pool. Each accepted socket is handed to the pool's next loop via
//! `safe_call`, where the connection object is built (a user factory may
//! substitute its own), attached, and wired with the server's callbacks
//! and a per-connection clone of the codec.

use crate::codec::Codec;
use crate::config::NetConfig;
use crate::conn::{ConnCallback, ConnRef, MsgCallback, TcpConn};
use crate::lock;
use crate::net::{self, Addr};
use crate::reactor::channel::{Channel, Sock};
use crate::reactor::event_loop::{EventLoop, LoopPool};
use mio::net::TcpListener;
use std::io;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Builds the connection object for each accepted socket.
pub type ConnFactory = Arc<dyn Fn() -> ConnRef + Send + Sync>;

#[derive(Default)]
struct ServerCallbacks {
    state: Option<ConnCallback>,
    read: Option<ConnCallback>,
    msg: Option<MsgCallback>,
}

pub struct TcpServer {
    pool: Arc<dyn LoopPool>,
    accept_loop: EventLoop,
    channel: Mutex<Option<Arc<Channel>>>,
    addr: Addr,
    cbs: Mutex<ServerCallbacks>,
    codec: Mutex<Option<Box<dyn Codec>>>,
    factory: Mutex<Option<ConnFactory>>,
}

impl TcpServer {
    /// Listen on `host:port` with default options (backlog 20). Port 0
    /// binds an ephemeral port, reported by [`local_addr`](Self::local_addr).
    pub fn bind(
        pool: Arc<dyn LoopPool>,
        host: &str,
        port: u16,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let config = NetConfig {
            reuse_port,
            ..NetConfig::default()
        };
        Self::bind_with_config(pool, host, port, &config)
    }

    pub fn bind_with_config(
        pool: Arc<dyn LoopPool>,
        host: &str,
        port: u16,
        config: &NetConfig,
    ) -> io::Result<Arc<TcpServer>> {
        let addr = Addr::resolve(host, port);
        let listener = net::tcp_listener(&addr, config.listen_backlog, config.reuse_port)?;
        let bound: Addr = listener.local_addr()?.into();

        let accept_loop = pool.alloc_loop();
        let server = Arc::new(TcpServer {
            pool,
            accept_loop: accept_loop.clone(),
            channel: Mutex::new(None),
            addr: bound,
            cbs: Mutex::new(ServerCallbacks::default()),
            codec: Mutex::new(None),
            factory: Mutex::new(None),
        });

        let channel = accept_loop.add_channel(Sock::Listener(TcpListener::from_std(listener)));
        let weak = Arc::downgrade(&server);
        channel.set_read_handler(Box::new(move || {
            if let Some(server) = weak.upgrade() {
                server.handle_accept();
            }
        }));
        if let Err(e) = channel.enable_read(true) {
            channel.close();
            return Err(e);
        }
        *lock(&server.channel) = Some(channel);

        info!(addr = %bound, "tcp server listening");
        Ok(server)
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> Addr {
        self.addr
    }

    /// Callback fired on every connection state transition.
    pub fn on_conn_state(&self, cb: impl Fn(&ConnRef) + Send + Sync + 'static) {
        lock(&self.cbs).state = Some(Arc::new(cb));
    }

    /// Raw readable callback installed on each connection (no codec).
    pub fn on_conn_read(&self, cb: impl Fn(&ConnRef) + Send + Sync + 'static) {
        lock(&self.cbs).read = Some(Arc::new(cb));
    }

    /// Install a codec and per-frame callback; every accepted connection
    /// receives an independent clone of the codec.
    pub fn on_conn_msg<C: Codec + 'static>(
        &self,
        codec: C,
        cb: impl Fn(&ConnRef, &[u8]) + Send + Sync + 'static,
    ) {
        *lock(&self.codec) = Some(Box::new(codec));
        lock(&self.cbs).msg = Some(Arc::new(cb));
    }

    /// Override construction of the per-connection object, e.g. to
    /// return a subtype prepared with extra state.
    pub fn set_conn_factory(&self, factory: impl Fn() -> ConnRef + Send + Sync + 'static) {
        *lock(&self.factory) = Some(Arc::new(factory));
    }

    /// Stop accepting. Established connections are unaffected.
    pub fn stop(self: &Arc<Self>) {
        let server = Arc::clone(self);
        self.accept_loop.safe_call(move || {
            if let Some(channel) = lock(&server.channel).take() {
                channel.close();
            }
        });
    }

    fn handle_accept(self: &Arc<Self>) {
        let Some(channel) = lock(&self.channel).clone() else { return };
        loop {
            match channel.accept() {
                Ok((stream, peer)) => {
                    let local = stream
                        .local_addr()
                        .map(Addr::from)
                        .unwrap_or_else(|_| Addr::any(0));
                    let peer: Addr = peer.into();
                    let worker = self.pool.alloc_loop();
                    let server = Arc::clone(self);
                    let conn_loop = worker.clone();
                    debug!(peer = %peer, "accepted connection");
                    worker.safe_call(move || {
                        server.setup_conn(&conn_loop, stream, local, peer);
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Runs on the worker loop that will own the connection.
    fn setup_conn(&self, worker: &EventLoop, stream: mio::net::TcpStream, local: Addr, peer: Addr) {
        let conn = match lock(&self.factory).clone() {
            Some(factory) => factory(),
            None => TcpConn::new(),
        };

        {
            let cbs = lock(&self.cbs);
            if let Some(cb) = &cbs.state {
                let cb = Arc::clone(cb);
                conn.on_state(move |c| cb(c));
            }
            if let Some(cb) = &cbs.read {
                let cb = Arc::clone(cb);
                conn.on_read(move |c| cb(c));
            }
            if let Some(cb) = &cbs.msg {
                conn.set_msg_callback(Arc::clone(cb));
            }
        }
        if let Some(codec) = lock(&self.codec).as_ref() {
            conn.set_codec(codec.clone_boxed());
        }

        if let Err(e) = conn.attach_stream(worker, stream, local, peer) {
            warn!(peer = %peer, error = %e, "failed to attach accepted connection");
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(channel) = lock(&self.channel).take() {
            channel.close();
        }
    }
}
