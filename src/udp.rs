//! UDP server and connected-socket client.
//!
//! Datagrams are stateless: no handshake, no framing codec (a datagram
//! is already a frame), no reconnect. The server reads each ready
//! datagram and hands `(server, bytes, peer)` to the user callback; a
//! `UdpConn` is a `connect()`-bound socket using plain send/recv.

use crate::config::NetConfig;
use crate::lock;
use crate::net::{self, Addr};
use crate::reactor::channel::{Channel, Sock};
use crate::reactor::event_loop::{EventLoop, LoopPool};
use mio::net::UdpSocket;
use std::io;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Callback for datagrams arriving at a [`UdpServer`].
pub type UdpServerCallback = Arc<dyn Fn(&Arc<UdpServer>, &[u8], &Addr) + Send + Sync>;
/// Callback for datagrams arriving at a [`UdpConn`].
pub type UdpConnCallback = Arc<dyn Fn(&Arc<UdpConn>, &[u8]) + Send + Sync>;

pub struct UdpServer {
    base: EventLoop,
    channel: Mutex<Option<Arc<Channel>>>,
    addr: Addr,
    msg_cb: Mutex<Option<UdpServerCallback>>,
    packet_size: usize,
}

impl UdpServer {
    pub fn bind(
        pool: Arc<dyn LoopPool>,
        host: &str,
        port: u16,
        reuse_port: bool,
    ) -> io::Result<Arc<UdpServer>> {
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
    ) -> io::Result<Arc<UdpServer>> {
        let addr = Addr::resolve(host, port);
        let socket = net::udp_bind(&addr, config.reuse_port)?;
        let bound: Addr = socket.local_addr()?.into();

        let base = pool.alloc_loop();
        let server = Arc::new(UdpServer {
            base: base.clone(),
            channel: Mutex::new(None),
            addr: bound,
            msg_cb: Mutex::new(None),
            packet_size: config.udp_packet_size,
        });

        let channel = base.add_channel(Sock::Datagram(UdpSocket::from_std(socket)));
        let weak = Arc::downgrade(&server);
        channel.set_read_handler(Box::new(move || {
            if let Some(server) = weak.upgrade() {
                server.handle_read();
            }
        }));
        if let Err(e) = channel.enable_read(true) {
            channel.close();
            return Err(e);
        }
        *lock(&server.channel) = Some(channel);

        info!(addr = %bound, "udp server listening");
        Ok(server)
    }

    pub fn local_addr(&self) -> Addr {
        self.addr
    }

    pub fn loop_handle(&self) -> &EventLoop {
        &self.base
    }

    /// Install the datagram callback.
    pub fn on_msg(&self, cb: impl Fn(&Arc<UdpServer>, &[u8], &Addr) + Send + Sync + 'static) {
        *lock(&self.msg_cb) = Some(Arc::new(cb));
    }

    /// Send one datagram to `peer`.
    pub fn send_to(&self, peer: &Addr, bytes: &[u8]) -> io::Result<usize> {
        match lock(&self.channel).clone() {
            Some(channel) => channel.send_to(bytes, peer.socket_addr()),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "server closed")),
        }
    }

    fn handle_read(self: &Arc<Self>) {
        let Some(channel) = lock(&self.channel).clone() else { return };
        let mut buf = vec![0u8; self.packet_size];
        loop {
            match channel.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    let cb = lock(&self.msg_cb).clone();
                    if let Some(cb) = cb {
                        cb(self, &buf[..n], &peer.into());
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "udp recv failed");
                    break;
                }
            }
        }
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        if let Some(channel) = lock(&self.channel).take() {
            channel.close();
        }
    }
}

/// A datagram socket bound to a single peer.
pub struct UdpConn {
    base: EventLoop,
    channel: Mutex<Option<Arc<Channel>>>,
    local: Addr,
    peer: Addr,
    msg_cb: Mutex<Option<UdpConnCallback>>,
    packet_size: usize,
}

impl UdpConn {
    pub fn connect(base: &EventLoop, host: &str, port: u16) -> io::Result<Arc<UdpConn>> {
        Self::connect_with_config(base, host, port, &NetConfig::default())
    }

    pub fn connect_with_config(
        base: &EventLoop,
        host: &str,
        port: u16,
        config: &NetConfig,
    ) -> io::Result<Arc<UdpConn>> {
        let peer = Addr::resolve(host, port);
        let socket = net::udp_connect(&peer)?;
        let local: Addr = socket.local_addr()?.into();

        let conn = Arc::new(UdpConn {
            base: base.clone(),
            channel: Mutex::new(None),
            local,
            peer,
            msg_cb: Mutex::new(None),
            packet_size: config.udp_packet_size,
        });

        let channel = base.add_channel(Sock::Datagram(UdpSocket::from_std(socket)));
        let weak = Arc::downgrade(&conn);
        channel.set_read_handler(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read();
            }
        }));
        if let Err(e) = channel.enable_read(true) {
            channel.close();
            return Err(e);
        }
        *lock(&conn.channel) = Some(channel);
        Ok(conn)
    }

    pub fn local_addr(&self) -> Addr {
        self.local
    }

    pub fn peer_addr(&self) -> Addr {
        self.peer
    }

    pub fn loop_handle(&self) -> &EventLoop {
        &self.base
    }

    pub fn on_msg(&self, cb: impl Fn(&Arc<UdpConn>, &[u8]) + Send + Sync + 'static) {
        *lock(&self.msg_cb) = Some(Arc::new(cb));
    }

    /// Send one datagram to the bound peer.
    pub fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        match lock(&self.channel).clone() {
            Some(channel) => channel.dgram_send(bytes),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed")),
        }
    }

    /// Close on the owning loop.
    pub fn close(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.base.safe_call(move || {
            if let Some(channel) = lock(&conn.channel).take() {
                channel.close();
            }
        });
    }

    fn handle_read(self: &Arc<Self>) {
        let Some(channel) = lock(&self.channel).clone() else { return };
        let mut buf = vec![0u8; self.packet_size];
        loop {
            match channel.dgram_recv(&mut buf) {
                Ok(n) => {
                    let cb = lock(&self.msg_cb).clone();
                    if let Some(cb) = cb {
                        cb(self, &buf[..n]);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "udp recv failed");
                    break;
                }
            }
        }
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        if let Some(channel) = lock(&self.channel).take() {
            channel.close();
        }
    }
}
