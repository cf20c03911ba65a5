//! Per-endpoint configuration and middleware chain builder.

use std::any::Any;
use std::net::IpAddr;
use std::sync::Arc;

use crate::connection::{AcceptedConnection, ConnectionDelegate, MiddlewareFactory};
use crate::endpoint::Endpoint;
use crate::{BoxError, BoxFuture};

/// Enabled application protocols for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocols {
    pub h1: bool,
    pub h2: bool,
    pub h3: bool,
}

impl Protocols {
    pub const ALL: Self = Self {
        h1: true,
        h2: true,
        h3: true,
    };
    pub const H1: Self = Self {
        h1: true,
        h2: false,
        h3: false,
    };
    pub const H2: Self = Self {
        h1: false,
        h2: true,
        h3: false,
    };
    pub const H3: Self = Self {
        h1: false,
        h2: false,
        h3: true,
    };

    /// ALPN identifiers for the stream protocols in preference order.
    pub fn alpn(&self) -> Vec<Vec<u8>> {
        let mut protocols = Vec::new();
        if self.h2 {
            protocols.push(b"h2".to_vec());
        }
        if self.h1 {
            protocols.push(b"http/1.1".to_vec());
        }
        protocols
    }
}

impl Default for Protocols {
    fn default() -> Self {
        Self::ALL
    }
}

/// ALPN identifier of HTTP/3, the only protocol a multiplexed bind speaks.
pub const H3_ALPN: &[u8] = b"h3";

/// Client-hello view handed to a TLS handshake callback.
pub struct TlsConnectionContext {
    /// SNI host name, when the client sent one.
    pub server_name: Option<String>,
    /// ALPN protocols offered by the client.
    pub alpn_protocols: Vec<Vec<u8>>,
    /// User state slot.
    pub state: Option<Box<dyn Any + Send>>,
    /// Handle of the connection being handshaken.
    pub connection: Arc<dyn AcceptedConnection>,
}

/// Resolves the server options to finish a handshake with.
pub type TlsConnectionCallback = Arc<
    dyn Fn(TlsConnectionContext) -> BoxFuture<'static, Result<Arc<rustls::ServerConfig>, BoxError>>
        + Send
        + Sync,
>;

/// TLS configuration an endpoint carries. The engine never drives a
/// handshake itself; this is handed opaquely to transports.
#[derive(Clone)]
pub enum TlsConfig {
    /// Fixed server options for every handshake.
    Static {
        config: Arc<rustls::ServerConfig>,
        /// ALPN override; defaults to what the protocol set implies.
        alpn: Option<Vec<Vec<u8>>>,
    },
    /// Per-connection handshake callback.
    Callback {
        on_connection: TlsConnectionCallback,
        /// Opaque state passed through to the transport.
        on_connection_state: Option<Arc<dyn Any + Send + Sync>>,
    },
}

/// TLS options published into a multiplexed transport's feature bag at bind
/// time.
#[derive(Clone)]
pub struct TlsConnectionCallbackOptions {
    pub application_protocols: Vec<Vec<u8>>,
    pub on_connection: TlsConnectionCallback,
    pub on_connection_state: Option<Arc<dyn Any + Send + Sync>>,
}

/// Per-endpoint configuration: protocols, TLS, accept parallelism, Alt-Svc
/// policy, reload fingerprint, and the middleware chains.
///
/// The middleware lists are append-only while configuring and frozen at
/// bind; [`build`](Self::build) composes whatever has been registered by
/// then.
#[derive(Clone)]
pub struct ListenOptions {
    endpoint: Endpoint,
    protocols: Protocols,
    protocols_explicitly_set: bool,
    tls: Option<TlsConfig>,
    max_accepts: usize,
    disable_alt_svc: bool,
    fingerprint: Option<Arc<str>>,
    middleware: Vec<MiddlewareFactory>,
    multiplexed_middleware: Vec<MiddlewareFactory>,
}

impl ListenOptions {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            protocols: Protocols::default(),
            protocols_explicitly_set: false,
            tls: None,
            max_accepts: default_max_accepts(),
            disable_alt_svc: false,
            fingerprint: None,
            middleware: Vec::new(),
            multiplexed_middleware: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn protocols(&self) -> Protocols {
        self.protocols
    }

    /// True once a caller picked protocols rather than inheriting defaults.
    pub fn protocols_explicitly_set(&self) -> bool {
        self.protocols_explicitly_set
    }

    pub fn set_protocols(&mut self, protocols: Protocols) -> &mut Self {
        self.protocols = protocols;
        self.protocols_explicitly_set = true;
        self
    }

    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    pub fn set_tls(&mut self, tls: TlsConfig) -> &mut Self {
        self.tls = Some(tls);
        self
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// `https` iff TLS is configured.
    pub fn scheme(&self) -> &'static str {
        if self.is_tls() {
            "https"
        } else {
            "http"
        }
    }

    pub fn max_accepts(&self) -> usize {
        self.max_accepts
    }

    pub fn set_max_accepts(&mut self, max_accepts: usize) -> &mut Self {
        self.max_accepts = max_accepts.max(1);
        self
    }

    pub fn disable_alt_svc(&self) -> bool {
        self.disable_alt_svc
    }

    pub fn set_disable_alt_svc(&mut self, disable: bool) -> &mut Self {
        self.disable_alt_svc = disable;
        self
    }

    /// Opaque equality key matched against reloaded configuration.
    pub fn fingerprint(&self) -> Option<&Arc<str>> {
        self.fingerprint.as_ref()
    }

    pub fn set_fingerprint(&mut self, fingerprint: impl Into<Arc<str>>) -> &mut Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Appends middleware for stream connections.
    pub fn use_middleware<F>(&mut self, factory: F) -> &mut Self
    where
        F: Fn(ConnectionDelegate) -> ConnectionDelegate + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(factory));
        self
    }

    /// Appends middleware for multiplexed connections.
    pub fn use_multiplexed_middleware<F>(&mut self, factory: F) -> &mut Self
    where
        F: Fn(ConnectionDelegate) -> ConnectionDelegate + Send + Sync + 'static,
    {
        self.multiplexed_middleware.push(Arc::new(factory));
        self
    }

    /// Composes the stream chain. The fold runs right to left so the first
    /// registered middleware wraps the whole rest of the chain.
    pub fn build(&self) -> ConnectionDelegate {
        compose(&self.middleware)
    }

    /// Composes the multiplexed chain.
    pub fn build_multiplexed(&self) -> ConnectionDelegate {
        compose(&self.multiplexed_middleware)
    }

    /// Independent copy rebased onto a concrete IP address, used to expand
    /// wildcard binds without re-running user configuration. Middleware
    /// lists are copied by value and the explicit-protocols flag carries
    /// over without being re-triggered.
    pub fn clone_for_ip(&self, ip: IpAddr) -> ListenOptions {
        let mut cloned = self.clone();
        cloned.endpoint = self.endpoint.with_ip(ip);
        cloned
    }
}

fn compose(factories: &[MiddlewareFactory]) -> ConnectionDelegate {
    // The terminal delegate completes immediately.
    let mut delegate: ConnectionDelegate = Arc::new(|_connection| Box::pin(async { Ok(()) }));
    for factory in factories.iter().rev() {
        delegate = factory(delegate);
    }
    delegate
}

fn default_max_accepts() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ServerConnection;
    use crate::endpoint::FdKind;
    use crate::features::Features;
    use crate::pipe::{self, DuplexPipe, PipeOptions};
    use crate::error::ConnectionError;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    fn ip_options(addr: &str) -> ListenOptions {
        ListenOptions::new(addr.parse::<std::net::SocketAddr>().unwrap().into())
    }

    struct StubConnection {
        transport: DuplexPipe,
        features: Features,
        closed: CancellationToken,
    }

    impl StubConnection {
        fn boxed() -> Box<dyn AcceptedConnection> {
            let (transport, _application) =
                pipe::pair(PipeOptions::default(), PipeOptions::default());
            Box::new(Self {
                transport,
                features: Features::new(),
                closed: CancellationToken::new(),
            })
        }
    }

    impl AcceptedConnection for StubConnection {
        fn local_endpoint(&self) -> Option<Endpoint> {
            None
        }
        fn remote_endpoint(&self) -> Option<Endpoint> {
            None
        }
        fn transport(&self) -> DuplexPipe {
            self.transport.clone()
        }
        fn features(&self) -> &Features {
            &self.features
        }
        fn closed(&self) -> CancellationToken {
            self.closed.clone()
        }
        fn abort(&self, _reason: ConnectionError) {}
        fn dispose(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    #[test]
    fn test_defaults() {
        let options = ip_options("127.0.0.1:0");
        assert_eq!(options.protocols(), Protocols::ALL);
        assert!(!options.protocols_explicitly_set());
        assert!(!options.is_tls());
        assert_eq!(options.scheme(), "http");
        assert!(options.max_accepts() >= 1);
        assert!(!options.disable_alt_svc());
    }

    #[test]
    fn test_set_protocols_raises_explicit_flag() {
        let mut options = ip_options("127.0.0.1:0");
        options.set_protocols(Protocols::H1);
        assert!(options.protocols_explicitly_set());
        assert_eq!(options.protocols(), Protocols::H1);
    }

    #[tokio::test]
    async fn test_build_composes_right_to_left() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut options = ip_options("127.0.0.1:0");

        for tag in ["outer", "inner"] {
            let order = order.clone();
            options.use_middleware(move |next| {
                let order = order.clone();
                Arc::new(move |connection| {
                    let order = order.clone();
                    let next = next.clone();
                    Box::pin(async move {
                        order.lock().push(format!("{tag}:before"));
                        let result = next(connection).await;
                        order.lock().push(format!("{tag}:after"));
                        result
                    })
                })
            });
        }

        let delegate = options.build();
        let connection = ServerConnection::new(0, StubConnection::boxed());
        delegate(connection).await.unwrap();

        assert_eq!(
            *order.lock(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_completes_immediately() {
        let options = ip_options("127.0.0.1:0");
        let delegate = options.build();
        let connection = ServerConnection::new(0, StubConnection::boxed());
        delegate(connection).await.unwrap();
    }

    #[test]
    fn test_clone_for_ip_preserves_configuration() {
        let mut options = ip_options("[::]:0");
        options.set_protocols(Protocols::H1);
        options.set_tls(TlsConfig::Callback {
            on_connection: Arc::new(|_context| {
                Box::pin(async { Err::<_, BoxError>("unused".into()) })
            }),
            on_connection_state: None,
        });
        options.set_disable_alt_svc(true);
        options.set_fingerprint("endpoint-a");
        options.use_middleware(|next| next);

        let cloned = options.clone_for_ip(std::net::IpAddr::from([127, 0, 0, 1]));
        assert_eq!(cloned.endpoint().to_string(), "127.0.0.1:0");
        assert_eq!(cloned.protocols(), Protocols::H1);
        assert!(cloned.protocols_explicitly_set());
        assert!(cloned.is_tls());
        assert!(cloned.disable_alt_svc());
        assert_eq!(cloned.fingerprint(), options.fingerprint());
        assert_eq!(cloned.middleware.len(), 1);

        // The flag carried over; an unset original stays unset.
        let unset = ip_options("[::]:0");
        let unset_clone = unset.clone_for_ip(std::net::IpAddr::from([127, 0, 0, 1]));
        assert!(!unset_clone.protocols_explicitly_set());
    }

    #[test]
    fn test_clone_for_ip_leaves_non_ip_endpoint_alone() {
        let options = ListenOptions::new(Endpoint::Fd {
            fd: 5,
            kind: FdKind::Socket,
        });
        let cloned = options.clone_for_ip(std::net::IpAddr::from([127, 0, 0, 1]));
        assert_eq!(cloned.endpoint(), options.endpoint());
    }

    #[test]
    fn test_alpn_reflects_protocol_set() {
        assert_eq!(
            Protocols::ALL.alpn(),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
        assert_eq!(Protocols::H1.alpn(), vec![b"http/1.1".to_vec()]);
        assert!(Protocols::H3.alpn().is_empty());
    }
}
