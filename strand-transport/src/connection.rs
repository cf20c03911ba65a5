//! Connection contracts and the per-accept connection record.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::endpoint::Endpoint;
use crate::error::ConnectionError;
use crate::features::{CompleteCallback, CompleteState, ConnectionComplete, Features};
use crate::pipe::DuplexPipe;
use crate::{BoxError, BoxFuture};

/// The contract every transport's accepted connection satisfies.
///
/// A connection owns its byte pipeline; the engine only ever talks to it
/// through this surface.
pub trait AcceptedConnection: Send + Sync {
    /// Local endpoint, when known.
    fn local_endpoint(&self) -> Option<Endpoint>;

    /// Remote endpoint, when known.
    fn remote_endpoint(&self) -> Option<Endpoint>;

    /// Application-facing duplex pipe.
    fn transport(&self) -> DuplexPipe;

    /// Capability bag.
    fn features(&self) -> &Features;

    /// Signal raised exactly once, after the receive side has terminated.
    /// Anything observing it can assume no further bytes will arrive.
    fn closed(&self) -> CancellationToken;

    /// Tears the connection down with the given reason. Safe to call more
    /// than once; the first reason wins.
    fn abort(&self, reason: ConnectionError);

    /// Completes the transport pipes and waits for the connection's tasks to
    /// finish. Called once, after the connection delegate has returned.
    fn dispose(&self) -> BoxFuture<'_, ()>;
}

/// The composed handler a connection is executed against.
pub type ConnectionDelegate =
    Arc<dyn Fn(Arc<ServerConnection>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// One layer of the middleware chain: wraps the next delegate and returns
/// the composed one.
pub type MiddlewareFactory = Arc<dyn Fn(ConnectionDelegate) -> ConnectionDelegate + Send + Sync>;

/// Per-accepted-connection record: endpoint-unique id, the raw transport
/// connection, the close-requested signal used by graceful drain, and the
/// completion signal the connection manager waits on.
pub struct ServerConnection {
    id: u64,
    inner: Box<dyn AcceptedConnection>,
    complete: Arc<ConnectionComplete>,
    close_requested: CancellationToken,
    done: watch::Sender<bool>,
}

impl ServerConnection {
    pub(crate) fn new(id: u64, inner: Box<dyn AcceptedConnection>) -> Arc<Self> {
        let complete = Arc::new(ConnectionComplete::new());
        inner.features().set(complete.clone());
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            id,
            inner,
            complete,
            close_requested: CancellationToken::new(),
            done,
        })
    }

    /// Endpoint-unique, never-reused connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner.local_endpoint()
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.inner.remote_endpoint()
    }

    /// Application-facing duplex pipe.
    pub fn transport(&self) -> DuplexPipe {
        self.inner.transport()
    }

    pub fn features(&self) -> &Features {
        self.inner.features()
    }

    /// See [`AcceptedConnection::closed`].
    pub fn closed(&self) -> CancellationToken {
        self.inner.closed()
    }

    /// Raised when the server asks this connection to wind down gracefully.
    /// Unlike [`closed`](Self::closed) the pipes are still live; a handler
    /// observing it should finish its work and return.
    pub fn close_requested(&self) -> CancellationToken {
        self.close_requested.clone()
    }

    pub fn abort(&self, reason: ConnectionError) {
        self.inner.abort(reason);
    }

    /// Registers a callback to run after the delegate returns; shorthand for
    /// going through the [`ConnectionComplete`] feature.
    pub fn on_completed(&self, state: CompleteState, callback: CompleteCallback) {
        self.complete.on_completed(state, callback);
    }

    pub(crate) fn request_close(&self) {
        self.close_requested.cancel();
    }

    /// Receiver resolving once the execution task has fully finished.
    pub(crate) fn completion(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    pub(crate) fn signal_completed(&self) {
        let _ = self.done.send(true);
    }

    pub(crate) async fn dispose(&self) {
        self.inner.dispose().await;
    }

    /// Runs registered on-completed callbacks in reverse registration order.
    /// A failing callback is logged and does not stop the rest.
    pub(crate) async fn run_completed_callbacks(&self) {
        for (callback, state) in self.complete.take().into_iter().rev() {
            if let Err(error) = callback(state).await {
                error!(%error, "an error occurred running an on-completed callback");
            }
        }
    }
}
