//! Accept loop and per-connection execution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, Instrument};

use crate::connection::{ConnectionDelegate, ServerConnection};
use crate::listener::GenericListener;
use crate::manager::ConnectionManager;

/// Drives one endpoint's accept loop and executes accepted connections
/// against the composed delegate.
pub struct ConnectionDispatcher {
    delegate: ConnectionDelegate,
    manager: Arc<ConnectionManager>,
    /// Monotonic per-endpoint connection id source; ids are never reused.
    next_id: AtomicU64,
}

impl ConnectionDispatcher {
    pub fn new(delegate: ConnectionDelegate, manager: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self {
            delegate,
            manager,
            next_id: AtomicU64::new(0),
        })
    }

    /// Spawns `parallelism` accept consumers over the shared listener and
    /// returns a handle resolving once every consumer has exited.
    ///
    /// A consumer exits when the listener unbinds or on an unhandled accept
    /// error; the error is contained to that consumer and logged.
    pub fn start(
        self: Arc<Self>,
        listener: Arc<GenericListener>,
        parallelism: usize,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut consumers = Vec::with_capacity(parallelism.max(1));
            for _ in 0..parallelism.max(1) {
                let dispatcher = self.clone();
                let listener = listener.clone();
                consumers.push(tokio::spawn(async move {
                    dispatcher.accept_connections(listener).await;
                }));
            }
            for consumer in consumers {
                let _ = consumer.await;
            }
        })
    }

    async fn accept_connections(&self, listener: Arc<GenericListener>) {
        loop {
            match listener.accept().await {
                Ok(Some(accepted)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let connection = ServerConnection::new(id, accepted);
                    // Registered before the execution task can observe it.
                    self.manager.add(connection.clone());
                    tokio::spawn(execute(
                        connection,
                        self.delegate.clone(),
                        self.manager.clone(),
                    ));
                }
                Ok(None) => break,
                Err(error) => {
                    error!(%error, "unexpected error while accepting connections");
                    break;
                }
            }
        }
    }
}

/// Runs one connection to completion: delegate, then on-completed callbacks,
/// then removal from the manager, then disposal of the transport.
async fn execute(
    connection: Arc<ServerConnection>,
    delegate: ConnectionDelegate,
    manager: Arc<ConnectionManager>,
) {
    let span = info_span!("connection", ConnectionId = connection.id());
    async {
        debug!("connection started");
        if let Err(error) = delegate(connection.clone()).await {
            error!(%error, "unhandled exception while processing connection");
        }
        connection.run_completed_callbacks().await;
        manager.remove(connection.id());
        debug!("connection stopped");
    }
    .instrument(span)
    .await;
    connection.dispose().await;
    connection.signal_completed();
}
