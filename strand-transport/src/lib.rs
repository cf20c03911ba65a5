//! Strand - per-endpoint connection transport and lifecycle engine
//!
//! Strand accepts inbound connections on listening endpoints, wraps each one
//! into a duplex byte pipeline backed by application middleware, and drives
//! the connection's full lifetime: receive loop, send loop, graceful
//! shutdown, abortive teardown, and coordinated drain on endpoint stop.
//!
//! - [`TransportManager`] binds endpoints through pluggable factories and
//!   runs the stop protocol.
//! - [`ListenOptions`] carries per-endpoint configuration and the middleware
//!   chain.
//! - [`SocketConnection`] drives one accepted socket's receive and send
//!   loops over a [`pipe`] pair.
//!
//! Strand does not parse HTTP and does not perform TLS handshakes; it is a
//! byte-pipe factory with a lifecycle.

pub mod connection;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod features;
pub mod listener;
pub mod manager;
pub mod options;
pub mod pipe;
pub mod socket;
pub mod socket_transport;
pub mod transport_manager;

// Re-export main components
pub use connection::{AcceptedConnection, ConnectionDelegate, MiddlewareFactory, ServerConnection};
pub use dispatcher::ConnectionDispatcher;
pub use endpoint::{Endpoint, FdKind};
pub use error::{BindError, ConnectionError, Result};
pub use features::{ConnectionComplete, Features};
pub use listener::{
    GenericListener, Listener, ListenerFactory, MultiplexedListener, MultiplexedListenerFactory,
};
pub use manager::ConnectionManager;
pub use options::{
    ListenOptions, Protocols, TlsConfig, TlsConnectionCallback, TlsConnectionCallbackOptions,
    TlsConnectionContext,
};
pub use pipe::{DuplexPipe, FlushResult, PipeOptions, PipeReader, PipeWriter, ReadResult};
pub use socket::{RawSocket, SocketConnection, SocketConnectionOptions};
pub use socket_transport::{SocketListener, SocketTransportFactory, SocketTransportOptions};
pub use transport_manager::TransportManager;

/// Boxed future used across the trait-object seams.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Boxed error for middleware and callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
