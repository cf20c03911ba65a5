//! Per-endpoint set of live connections.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::connection::ServerConnection;
use crate::error::ConnectionError;

/// Maps connection ids to live connections for one endpoint.
///
/// Entries are added before the execution task can observe them and removed
/// only after that task completes, so a drain observer never sees a
/// connection that is both live and finished.
#[derive(Default)]
pub struct ConnectionManager {
    connections: DashMap<u64, Arc<ServerConnection>>,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn add(&self, connection: Arc<ServerConnection>) {
        self.connections.insert(connection.id(), connection);
    }

    pub(crate) fn remove(&self, id: u64) {
        self.connections.remove(&id);
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    fn snapshot(&self) -> Vec<Arc<ServerConnection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Asks every live connection to wind down and waits for their execution
    /// tasks. Returns true iff all of them completed before the timeout or
    /// the external shutdown token fired.
    pub async fn close_all_connections(
        &self,
        timeout: Duration,
        shutdown: &CancellationToken,
    ) -> bool {
        let connections = self.snapshot();
        for connection in &connections {
            connection.request_close();
        }
        tokio::select! {
            _ = tokio::time::sleep(timeout) => false,
            _ = shutdown.cancelled() => false,
            _ = wait_for_all(connections) => true,
        }
    }

    /// Aborts every surviving connection and waits for their execution
    /// tasks. Returns true iff all of them completed within the abort grace
    /// period.
    pub async fn abort_all_connections(&self) -> bool {
        let connections = self.snapshot();
        for connection in &connections {
            connection.abort(ConnectionError::Aborted(
                "the server is shutting down".to_string(),
            ));
        }
        tokio::select! {
            _ = tokio::time::sleep(ABORT_DRAIN_TIMEOUT) => false,
            _ = wait_for_all(connections) => true,
        }
    }
}

/// How long an aborted connection gets to run its teardown before the stop
/// protocol moves on.
const ABORT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

async fn wait_for_all(connections: Vec<Arc<ServerConnection>>) {
    for connection in connections {
        let mut completion = connection.completion();
        let _ = completion.wait_for(|done| *done).await;
    }
}
