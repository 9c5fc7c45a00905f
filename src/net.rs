//! IPv4 addressing and socket construction.
//!
//! Sockets are always AF_INET, non-blocking and close-on-exec from the
//! moment they exist. `SO_REUSEADDR` is set on every bind; `SO_REUSEPORT`
//! is opt-in for kernel-level load balancing across listeners.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::Mutex;
use tracing::warn;

/// Serializes blocking DNS lookups. Resolver state is not reliably
/// thread-safe on every libc this crate runs against.
static DNS_LOCK: Mutex<()> = Mutex::new(());

/// An IPv4 `host:port` value with a validity flag.
///
/// Construction never fails; a failed parse or DNS lookup yields an
/// invalid address that formats as `invalid_ip:0` and refuses to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr {
    addr: SocketAddrV4,
    valid: bool,
}

impl Addr {
    /// Bind-any address (`0.0.0.0:port`).
    pub fn any(port: u16) -> Self {
        Self {
            addr: SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port),
            valid: true,
        }
    }

    /// Resolve `host` to an IPv4 address. A dotted-quad string is parsed
    /// directly; anything else goes through a blocking DNS lookup. An
    /// empty host means bind-any.
    pub fn resolve(host: &str, port: u16) -> Self {
        if host.is_empty() {
            return Self::any(port);
        }
        if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
            return Self {
                addr: SocketAddrV4::new(ip, port),
                valid: true,
            };
        }
        let _guard = DNS_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        match (host, port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.find_map(|a| match a {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            }) {
                Some(v4) => Self { addr: v4, valid: true },
                None => {
                    warn!(host, "no IPv4 address for host");
                    Self::invalid()
                }
            },
            Err(e) => {
                warn!(host, error = %e, "DNS lookup failed");
                Self::invalid()
            }
        }
    }

    fn invalid() -> Self {
        Self {
            addr: SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
            valid: false,
        }
    }

    /// IP part as a string.
    pub fn ip(&self) -> String {
        if self.valid {
            self.addr.ip().to_string()
        } else {
            "invalid_ip".to_string()
        }
    }

    /// Port in host byte order.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// IP as a host-order integer; 0 when invalid.
    pub fn ip_u32(&self) -> u32 {
        if self.valid {
            u32::from(*self.addr.ip())
        } else {
            0
        }
    }

    /// Whether the address resolved to a usable IPv4 endpoint.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Underlying socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.addr)
    }
}

impl From<SocketAddrV4> for Addr {
    fn from(addr: SocketAddrV4) -> Self {
        Self { addr, valid: true }
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self { addr: v4, valid: true },
            SocketAddr::V6(_) => Self::invalid(),
        }
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.valid {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "invalid_ip:0")
        }
    }
}

fn invalid_addr_err(addr: &Addr) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid address: {addr}"),
    )
}

/// Build a non-blocking TCP listener with `SO_REUSEADDR` (and optionally
/// `SO_REUSEPORT`) already set.
pub(crate) fn tcp_listener(
    addr: &Addr,
    backlog: i32,
    reuse_port: bool,
) -> io::Result<std::net::TcpListener> {
    if !addr.is_valid() {
        return Err(invalid_addr_err(addr));
    }
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr.socket_addr()))?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Start a non-blocking TCP connect, optionally bound to a local IP.
/// `EINPROGRESS` is the expected outcome; the handshake completes when the
/// socket reports writable with no pending error.
pub(crate) fn tcp_connect(dest: &Addr, local_ip: &str) -> io::Result<std::net::TcpStream> {
    if !dest.is_valid() {
        return Err(invalid_addr_err(dest));
    }
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if !local_ip.is_empty() {
        let local = Addr::resolve(local_ip, 0);
        if !local.is_valid() {
            return Err(invalid_addr_err(&local));
        }
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(local.socket_addr()))?;
    }
    match socket.connect(&SockAddr::from(dest.socket_addr())) {
        Ok(()) => {}
        Err(ref e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

/// Build a non-blocking UDP socket bound to `addr`.
pub(crate) fn udp_bind(addr: &Addr, reuse_port: bool) -> io::Result<std::net::UdpSocket> {
    if !addr.is_valid() {
        return Err(invalid_addr_err(addr));
    }
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr.socket_addr()))?;
    Ok(socket.into())
}

/// Build a non-blocking UDP socket `connect()`-bound to `dest`, so plain
/// read/write reach exactly one peer.
pub(crate) fn udp_connect(dest: &Addr) -> io::Result<std::net::UdpSocket> {
    if !dest.is_valid() {
        return Err(invalid_addr_err(dest));
    }
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.connect(&SockAddr::from(dest.socket_addr()))?;
    Ok(socket.into())
}
