//! Registry of active endpoints: bind and stop orchestration.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::ConnectionDelegate;
use crate::dispatcher::ConnectionDispatcher;
use crate::endpoint::Endpoint;
use crate::error::BindError;
use crate::features::Features;
use crate::listener::{GenericListener, ListenerFactory, MultiplexedListenerFactory};
use crate::manager::ConnectionManager;
use crate::options::{
    ListenOptions, TlsConfig, TlsConnectionCallback, TlsConnectionCallbackOptions, H3_ALPN,
};

/// One bound endpoint: its listener, the running accept loop, and the set of
/// live connections to drain on stop.
struct ActiveTransport {
    listener: Arc<GenericListener>,
    accept_loop: JoinHandle<()>,
    manager: Arc<ConnectionManager>,
    fingerprint: Option<Arc<str>>,
    endpoint: Endpoint,
}

/// Binds endpoints through registered factories and coordinates the
/// unbind / drain / abort / dispose stop protocol.
pub struct TransportManager {
    factories: Vec<Arc<dyn ListenerFactory>>,
    multiplexed_factories: Vec<Arc<dyn MultiplexedListenerFactory>>,
    transports: tokio::sync::Mutex<Vec<ActiveTransport>>,
}

impl TransportManager {
    pub fn new(
        factories: Vec<Arc<dyn ListenerFactory>>,
        multiplexed_factories: Vec<Arc<dyn MultiplexedListenerFactory>>,
    ) -> Self {
        Self {
            factories,
            multiplexed_factories,
            transports: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Endpoints currently bound.
    pub async fn active_endpoints(&self) -> Vec<Endpoint> {
        self.transports
            .lock()
            .await
            .iter()
            .map(|transport| transport.endpoint.clone())
            .collect()
    }

    /// Binds a stream endpoint and returns its effective address.
    pub async fn bind(
        &self,
        options: &ListenOptions,
        cancel: &CancellationToken,
    ) -> Result<Endpoint, BindError> {
        if self.factories.is_empty() {
            return Err(BindError::NoFactories { kind: "stream" });
        }
        let endpoint = options.endpoint();
        let factory = self
            .factories
            .iter()
            .find(|factory| factory.can_bind(endpoint))
            .ok_or_else(|| BindError::NoFactory {
                kind: endpoint.kind(),
                endpoint: endpoint.to_string(),
            })?;

        let listener = factory.bind(endpoint.clone(), cancel.clone()).await?;
        let listener = Arc::new(GenericListener::Stream(listener));
        self.start_transport(listener, options, options.build())
            .await
    }

    /// Binds a multiplexed endpoint, publishing the TLS feature bag the
    /// transport finishes handshakes with.
    pub async fn bind_multiplexed(
        &self,
        options: &ListenOptions,
        cancel: &CancellationToken,
    ) -> Result<Endpoint, BindError> {
        if self.multiplexed_factories.is_empty() {
            return Err(BindError::NoFactories {
                kind: "multiplexed",
            });
        }
        let endpoint = options.endpoint();
        let factory = self
            .multiplexed_factories
            .iter()
            .find(|factory| factory.can_bind(endpoint))
            .ok_or_else(|| BindError::NoFactory {
                kind: endpoint.kind(),
                endpoint: endpoint.to_string(),
            })?;

        let features = tls_feature_bag(options);
        let listener = factory
            .bind(endpoint.clone(), features, cancel.clone())
            .await?;
        let listener = Arc::new(GenericListener::Multiplexed(listener));
        self.start_transport(listener, options, options.build_multiplexed())
            .await
    }

    async fn start_transport(
        &self,
        listener: Arc<GenericListener>,
        options: &ListenOptions,
        delegate: ConnectionDelegate,
    ) -> Result<Endpoint, BindError> {
        let manager = ConnectionManager::new();
        let dispatcher = ConnectionDispatcher::new(delegate, manager.clone());
        let parallelism = options
            .max_accepts()
            .min(listener.max_accepts())
            .max(1);
        let accept_loop = dispatcher.start(listener.clone(), parallelism);
        let endpoint = listener.endpoint();
        info!(endpoint = %endpoint.display_name(options.is_tls()), "listening");

        self.transports.lock().await.push(ActiveTransport {
            listener,
            accept_loop,
            manager,
            fingerprint: options.fingerprint().cloned(),
            endpoint: endpoint.clone(),
        });
        Ok(endpoint)
    }

    /// Stops every active endpoint: unbind, drain within `timeout`, abort
    /// stragglers, dispose listeners.
    pub async fn stop(&self, timeout: Duration, shutdown: &CancellationToken) {
        let transports = std::mem::take(&mut *self.transports.lock().await);
        stop_transports(transports, timeout, shutdown).await;
    }

    /// Stops only the endpoints whose fingerprint appears in `fingerprints`,
    /// leaving the others running. Used for configuration reload.
    pub async fn stop_endpoints(
        &self,
        fingerprints: &[Arc<str>],
        timeout: Duration,
        shutdown: &CancellationToken,
    ) {
        let stopped = {
            let mut transports = self.transports.lock().await;
            let (stopped, kept): (Vec<_>, Vec<_>) =
                transports.drain(..).partition(|transport| {
                    transport
                        .fingerprint
                        .as_ref()
                        .is_some_and(|fingerprint| fingerprints.contains(fingerprint))
                });
            *transports = kept;
            stopped
        };
        stop_transports(stopped, timeout, shutdown).await;
    }
}

fn tls_feature_bag(options: &ListenOptions) -> Arc<Features> {
    let features = Features::new();
    match options.tls() {
        Some(TlsConfig::Static { config, alpn }) => {
            let application_protocols = alpn
                .clone()
                .unwrap_or_else(|| vec![H3_ALPN.to_vec()]);
            let config = config.clone();
            let on_connection: TlsConnectionCallback = Arc::new(move |_context| {
                let config = config.clone();
                Box::pin(async move { Ok(config) })
            });
            features.set(Arc::new(TlsConnectionCallbackOptions {
                application_protocols,
                on_connection,
                on_connection_state: None,
            }));
        }
        Some(TlsConfig::Callback {
            on_connection,
            on_connection_state,
        }) => {
            features.set(Arc::new(TlsConnectionCallbackOptions {
                application_protocols: vec![H3_ALPN.to_vec()],
                on_connection: on_connection.clone(),
                on_connection_state: on_connection_state.clone(),
            }));
        }
        // An empty bag is only valid for in-memory test transports; real
        // multiplexed transports reject it at bind.
        None => {}
    }
    Arc::new(features)
}

async fn stop_transports(
    transports: Vec<ActiveTransport>,
    timeout: Duration,
    shutdown: &CancellationToken,
) {
    // Phase 1: unbind every listener and wait for its accept loop, so no new
    // connection can slip in while draining.
    let mut unbinding = Vec::with_capacity(transports.len());
    for transport in transports {
        let ActiveTransport {
            listener,
            accept_loop,
            manager,
            endpoint,
            ..
        } = transport;
        unbinding.push(tokio::spawn(async move {
            listener.unbind().await;
            let _ = accept_loop.await;
            (listener, manager, endpoint)
        }));
    }
    let mut drained = Vec::with_capacity(unbinding.len());
    for task in unbinding {
        if let Ok(parts) = task.await {
            drained.push(parts);
        }
    }

    // Phase 2: graceful drain, then abort whatever is left.
    let mut draining = Vec::with_capacity(drained.len());
    for (listener, manager, endpoint) in drained {
        let shutdown = shutdown.clone();
        draining.push(tokio::spawn(async move {
            if !manager.close_all_connections(timeout, &shutdown).await {
                warn!(%endpoint, "not all connections closed gracefully during shutdown");
                if !manager.abort_all_connections().await {
                    warn!(%endpoint, "not all connections aborted during shutdown");
                }
            }
            listener
        }));
    }
    let mut listeners = Vec::with_capacity(draining.len());
    for task in draining {
        if let Ok(listener) = task.await {
            listeners.push(listener);
        }
    }

    // Phase 3: dispose listeners.
    let mut disposing = Vec::with_capacity(listeners.len());
    for listener in listeners {
        disposing.push(tokio::spawn(async move { listener.dispose().await }));
    }
    for task in disposing {
        let _ = task.await;
    }
}
