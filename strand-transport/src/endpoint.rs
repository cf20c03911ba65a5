//! Bindable endpoint descriptors.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Handle-type hint for inherited file descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FdKind {
    /// The handle is a listening socket.
    Socket,
    /// The handle is a pipe.
    Pipe,
}

/// A bindable network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// IP address and port. Port 0 asks the kernel to pick one; the bound
    /// endpoint reported back carries the assigned port.
    Ip(SocketAddr),
    /// Filesystem path of a Unix domain socket.
    Unix(PathBuf),
    /// Inherited file handle with a hint about what it is.
    Fd { fd: i32, kind: FdKind },
}

impl Endpoint {
    /// Short tag used in error messages and factory selection.
    pub fn kind(&self) -> &'static str {
        match self {
            Endpoint::Ip(_) => "ip",
            Endpoint::Unix(_) => "unix",
            Endpoint::Fd { .. } => "fd",
        }
    }

    /// True for wildcard IP addresses that expand to concrete bindings.
    pub fn is_unspecified(&self) -> bool {
        matches!(self, Endpoint::Ip(addr) if addr.ip().is_unspecified())
    }

    /// Same endpoint rebased onto a concrete IP address, keeping the port.
    ///
    /// Non-IP endpoints are returned unchanged.
    pub fn with_ip(&self, ip: IpAddr) -> Endpoint {
        match self {
            Endpoint::Ip(addr) => Endpoint::Ip(SocketAddr::new(ip, addr.port())),
            other => other.clone(),
        }
    }

    /// Same endpoint with the kernel-assigned port filled in.
    pub fn with_port(&self, port: u16) -> Endpoint {
        match self {
            Endpoint::Ip(addr) => Endpoint::Ip(SocketAddr::new(addr.ip(), port)),
            other => other.clone(),
        }
    }

    /// Display form with an `http`/`https` scheme, e.g. `https://127.0.0.1:443`.
    pub fn display_name(&self, tls: bool) -> String {
        let scheme = if tls { "https" } else { "http" };
        match self {
            Endpoint::Ip(addr) => format!("{scheme}://{addr}"),
            Endpoint::Unix(path) => format!("{scheme}://unix:{}", path.display()),
            Endpoint::Fd { fd, .. } => format!("{scheme}://<file handle {fd}>"),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{addr}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Fd { fd, .. } => write!(f, "fd:{fd}"),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Ip(addr)
    }
}
