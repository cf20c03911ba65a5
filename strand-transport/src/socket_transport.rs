//! Default socket transport: TCP, Unix domain sockets, inherited handles.

use std::io;
use std::path::PathBuf;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::connection::AcceptedConnection;
use crate::endpoint::{Endpoint, FdKind};
use crate::error::BindError;
use crate::listener::{Listener, ListenerFactory};
use crate::socket::{SocketConnection, SocketConnectionOptions};
use crate::BoxFuture;

/// Transport-level configuration shared by every endpoint this factory
/// binds.
#[derive(Debug, Clone)]
pub struct SocketTransportOptions {
    /// Listen backlog handed to the kernel.
    pub backlog: i32,
    /// Disable Nagle on accepted TCP connections.
    pub no_delay: bool,
    /// Accept-loop parallelism the listeners report.
    pub max_accepts: usize,
    /// Per-connection pipe sizing and receive behavior.
    pub connection: SocketConnectionOptions,
}

impl Default for SocketTransportOptions {
    fn default() -> Self {
        Self {
            backlog: 512,
            no_delay: true,
            max_accepts: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            connection: SocketConnectionOptions::default(),
        }
    }
}

/// Stream factory over the operating system's sockets.
#[derive(Default)]
pub struct SocketTransportFactory {
    options: SocketTransportOptions,
}

impl SocketTransportFactory {
    pub fn new(options: SocketTransportOptions) -> Self {
        Self { options }
    }
}

impl ListenerFactory for SocketTransportFactory {
    fn can_bind(&self, endpoint: &Endpoint) -> bool {
        match endpoint {
            Endpoint::Ip(_) | Endpoint::Unix(_) => true,
            Endpoint::Fd { kind, .. } => *kind == FdKind::Socket,
        }
    }

    fn bind(
        &self,
        endpoint: Endpoint,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Box<dyn Listener>, BindError>> {
        Box::pin(async move {
            let listener = SocketListener::bind(endpoint, self.options.clone())?;
            Ok(Box::new(listener) as Box<dyn Listener>)
        })
    }
}

enum ListenSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// A bound TCP or Unix socket listener.
pub struct SocketListener {
    socket: ListenSocket,
    endpoint: Endpoint,
    /// Set on unbind; pending accepts resolve to `None`.
    unbound: CancellationToken,
    options: SocketTransportOptions,
    /// Socket file removed on drop, for Unix endpoints we created.
    unlink_on_drop: Option<PathBuf>,
}

impl SocketListener {
    fn bind(endpoint: Endpoint, options: SocketTransportOptions) -> Result<Self, BindError> {
        match endpoint {
            Endpoint::Ip(addr) => {
                let domain = Domain::for_address(addr);
                let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
                socket.set_nonblocking(true)?;
                #[cfg(unix)]
                socket.set_reuse_address(true)?;
                if addr.is_ipv6() {
                    // Wildcard binds are expanded per address family by the
                    // caller; keep the v6 socket to its own family.
                    let _ = socket.set_only_v6(true);
                }
                socket.bind(&addr.into())?;
                socket.listen(options.backlog)?;
                let listener = TcpListener::from_std(socket.into())?;
                let local = listener.local_addr()?;
                Ok(Self {
                    socket: ListenSocket::Tcp(listener),
                    endpoint: Endpoint::Ip(local),
                    unbound: CancellationToken::new(),
                    options,
                    unlink_on_drop: None,
                })
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                // A stale socket file from a previous run blocks the bind.
                if path.exists() {
                    let _ = std::fs::remove_file(&path);
                }
                let listener = UnixListener::bind(&path)?;
                Ok(Self {
                    socket: ListenSocket::Unix(listener),
                    endpoint: Endpoint::Unix(path.clone()),
                    unbound: CancellationToken::new(),
                    options,
                    unlink_on_drop: Some(path),
                })
            }
            #[cfg(unix)]
            Endpoint::Fd {
                fd,
                kind: FdKind::Socket,
            } => {
                use std::os::unix::io::FromRawFd;
                let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
                std_listener.set_nonblocking(true)?;
                let listener = TcpListener::from_std(std_listener)?;
                Ok(Self {
                    socket: ListenSocket::Tcp(listener),
                    endpoint: Endpoint::Fd {
                        fd,
                        kind: FdKind::Socket,
                    },
                    unbound: CancellationToken::new(),
                    options,
                    unlink_on_drop: None,
                })
            }
            other => Err(BindError::UnsupportedEndpoint(other.to_string())),
        }
    }

    async fn accept_raw(&self) -> io::Result<Box<dyn AcceptedConnection>> {
        match &self.socket {
            ListenSocket::Tcp(listener) => {
                let (stream, _remote) = listener.accept().await?;
                if self.options.no_delay {
                    let _ = stream.set_nodelay(true);
                }
                let connection = SocketConnection::new(stream, &self.options.connection);
                connection.start(false);
                Ok(Box::new(connection))
            }
            #[cfg(unix)]
            ListenSocket::Unix(listener) => {
                let (stream, _remote) = listener.accept().await?;
                let connection = SocketConnection::new(stream, &self.options.connection);
                connection.start(false);
                Ok(Box::new(connection))
            }
        }
    }

    /// Accept errors a dead connection in the backlog can produce; retried
    /// rather than surfaced.
    fn is_transient_accept_error(error: &io::Error) -> bool {
        matches!(
            error.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::Interrupted
        )
    }
}

impl Listener for SocketListener {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<Option<Box<dyn AcceptedConnection>>>> {
        Box::pin(async move {
            loop {
                let accepted = tokio::select! {
                    _ = self.unbound.cancelled() => return Ok(None),
                    accepted = self.accept_raw() => accepted,
                };
                match accepted {
                    Ok(connection) => return Ok(Some(connection)),
                    Err(error) if Self::is_transient_accept_error(&error) => continue,
                    Err(error) => return Err(error),
                }
            }
        })
    }

    fn unbind(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.unbound.cancel();
        })
    }

    fn dispose(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.unbound.cancel();
        })
    }

    fn max_accepts(&self) -> usize {
        self.options.max_accepts
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if let Some(path) = self.unlink_on_drop.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_bind_assigns_kernel_port() {
        let factory = SocketTransportFactory::default();
        let endpoint: Endpoint = "127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into();
        let listener = factory
            .bind(endpoint, CancellationToken::new())
            .await
            .unwrap();
        match listener.endpoint() {
            Endpoint::Ip(addr) => assert_ne!(addr.port(), 0),
            other => panic!("unexpected endpoint: {other}"),
        }
    }

    #[tokio::test]
    async fn test_accept_returns_started_connection() {
        let factory = SocketTransportFactory::default();
        let endpoint: Endpoint = "127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into();
        let listener = factory
            .bind(endpoint, CancellationToken::new())
            .await
            .unwrap();
        let Endpoint::Ip(addr) = listener.endpoint() else {
            panic!("expected ip endpoint");
        };

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let connection = accepted.unwrap().expect("listener is bound");

        client.write_all(b"hi").await.unwrap();
        let transport = connection.transport();
        let result = transport.input.read().await.unwrap();
        assert_eq!(result.to_bytes(), bytes::Bytes::from_static(b"hi"));
        transport.input.advance(result.len());
        connection.dispose().await;
    }

    #[tokio::test]
    async fn test_unbind_resolves_pending_accept_with_none() {
        let factory = SocketTransportFactory::default();
        let endpoint: Endpoint = "127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into();
        let listener = factory
            .bind(endpoint, CancellationToken::new())
            .await
            .unwrap();

        let pending = listener.accept();
        listener.unbind().await;
        assert!(pending.await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_unlinks_stale_socket_file() {
        let path = std::env::temp_dir().join(format!("strand-test-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        std::fs::write(&path, b"").unwrap();

        let factory = SocketTransportFactory::default();
        let listener = factory
            .bind(Endpoint::Unix(path.clone()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(listener.endpoint(), Endpoint::Unix(path.clone()));
        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_can_bind_rejects_pipe_handles() {
        let factory = SocketTransportFactory::default();
        assert!(!factory.can_bind(&Endpoint::Fd {
            fd: 3,
            kind: FdKind::Pipe
        }));
        assert!(factory.can_bind(&Endpoint::Fd {
            fd: 3,
            kind: FdKind::Socket
        }));
    }
}
