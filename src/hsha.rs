//! Half-sync/half-async servers.
//!
//! The loop thread stays async: it frames incoming bytes and ships each
//! decoded message to a worker pool. The user handler runs synchronously
//! on a worker and may block; its response is marshalled back onto the
//! connection's loop and sent only if the connection is still up.

use crate::codec::Codec;
use crate::config::NetConfig;
use crate::conn::{ConnRef, ConnState};
use crate::net::Addr;
use crate::reactor::event_loop::LoopPool;
use crate::server::TcpServer;
use crate::thread_pool::ThreadPool;
use crate::udp::UdpServer;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tracing::warn;

/// TCP server with framing on the loop and user work on a pool.
pub struct HshaServer {
    server: Arc<TcpServer>,
    workers: Arc<ThreadPool>,
}

impl HshaServer {
    pub fn bind(
        pool: Arc<dyn LoopPool>,
        host: &str,
        port: u16,
        config: &NetConfig,
    ) -> io::Result<Arc<HshaServer>> {
        let server = TcpServer::bind_with_config(pool, host, port, config)?;
        let workers = Arc::new(ThreadPool::new(config.worker_threads, 0)?);
        Ok(Arc::new(HshaServer { server, workers }))
    }

    pub fn local_addr(&self) -> Addr {
        self.server.local_addr()
    }

    /// Underlying TCP server, for installing state callbacks or a
    /// connection factory.
    pub fn server(&self) -> &Arc<TcpServer> {
        &self.server
    }

    /// Install the codec and the worker-side handler. Returning `None`
    /// sends no response for that frame.
    pub fn on_msg<C: Codec + 'static>(
        &self,
        codec: C,
        handler: impl Fn(&ConnRef, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) {
        let workers = Arc::clone(&self.workers);
        let handler = Arc::new(handler);
        self.server.on_conn_msg(codec, move |conn: &ConnRef, frame: &[u8]| {
            // Decouple the frame from the connection's input buffer
            // before it crosses threads.
            let frame = Bytes::copy_from_slice(frame);
            let conn = Arc::clone(conn);
            let handler = Arc::clone(&handler);
            let accepted = workers.submit(move || {
                let Some(response) = handler(&conn, &frame) else { return };
                let Some(base) = conn.loop_handle() else { return };
                let conn = Arc::clone(&conn);
                base.safe_call(move || {
                    if conn.state() != ConnState::Connected {
                        return;
                    }
                    if let Err(e) = conn.send_msg(&response) {
                        warn!(error = %e, "failed to encode response");
                    }
                });
            });
            if !accepted {
                warn!("worker pool rejected frame");
            }
        });
    }

    /// Stop the worker pool (draining queued work) and the listener.
    pub fn exit(self: &Arc<Self>) {
        self.workers.close();
        self.workers.join();
        self.server.stop();
    }
}

/// UDP counterpart: each datagram is a frame; the handler's response is
/// sent back to the datagram's origin.
pub struct UdpHshaServer {
    server: Arc<UdpServer>,
    workers: Arc<ThreadPool>,
}

impl UdpHshaServer {
    pub fn bind(
        pool: Arc<dyn LoopPool>,
        host: &str,
        port: u16,
        config: &NetConfig,
    ) -> io::Result<Arc<UdpHshaServer>> {
        let server = UdpServer::bind_with_config(pool, host, port, config)?;
        let workers = Arc::new(ThreadPool::new(config.worker_threads, 0)?);
        Ok(Arc::new(UdpHshaServer { server, workers }))
    }

    pub fn local_addr(&self) -> Addr {
        self.server.local_addr()
    }

    pub fn server(&self) -> &Arc<UdpServer> {
        &self.server
    }

    pub fn on_msg(
        &self,
        handler: impl Fn(&Arc<UdpServer>, &[u8], &Addr) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) {
        let workers = Arc::clone(&self.workers);
        let handler = Arc::new(handler);
        self.server.on_msg(move |server, datagram, peer| {
            let datagram = Bytes::copy_from_slice(datagram);
            let server = Arc::clone(server);
            let peer = *peer;
            let handler = Arc::clone(&handler);
            let accepted = workers.submit(move || {
                let Some(response) = handler(&server, &datagram, &peer) else { return };
                let reply_server = Arc::clone(&server);
                server.loop_handle().safe_call(move || {
                    if let Err(e) = reply_server.send_to(&peer, &response) {
                        warn!(peer = %peer, error = %e, "failed to send response");
                    }
                });
            });
            if !accepted {
                warn!("worker pool rejected datagram");
            }
        });
    }

    pub fn exit(self: &Arc<Self>) {
        self.workers.close();
        self.workers.join();
    }
}
