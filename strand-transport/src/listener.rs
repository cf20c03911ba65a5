//! Listener contracts and the uniform accept surface.
//!
//! Transports plug in through two factory shapes: stream factories produce
//! listeners yielding ordinary byte connections, multiplexed factories
//! produce listeners whose connections carry independent streams (QUIC
//! style) and receive a feature bag at bind time. [`GenericListener`] folds
//! both into the single surface the dispatcher consumes.

use std::io;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::connection::AcceptedConnection;
use crate::endpoint::Endpoint;
use crate::error::BindError;
use crate::features::Features;
use crate::BoxFuture;

/// Produces stream listeners for endpoints it supports.
pub trait ListenerFactory: Send + Sync {
    /// Optional selector. Factories that do not override it are assumed to
    /// support any endpoint.
    fn can_bind(&self, _endpoint: &Endpoint) -> bool {
        true
    }

    /// Binds the endpoint and returns a listener reporting its effective
    /// endpoint (kernel-assigned port filled in).
    fn bind(
        &self,
        endpoint: Endpoint,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Box<dyn Listener>, BindError>>;
}

/// A bound entity producing accepted connections.
///
/// `accept` takes `&self` so up to `max_accepts` consumers can block on one
/// listener; a connection is only materialized per successful accept.
pub trait Listener: Send + Sync {
    /// Effective endpoint after bind.
    fn endpoint(&self) -> Endpoint;

    /// Next accepted connection, or `None` once the listener is unbound.
    fn accept(&self) -> BoxFuture<'_, io::Result<Option<Box<dyn AcceptedConnection>>>>;

    /// Stops accepting; pending and future accepts resolve to `None`.
    fn unbind(&self) -> BoxFuture<'_, ()>;

    /// Releases listener resources. Called after unbind and drain.
    fn dispose(&self) -> BoxFuture<'_, ()>;

    /// Accept-loop parallelism hint.
    fn max_accepts(&self) -> usize {
        1
    }
}

/// Produces multiplexed listeners. The feature bag carries TLS callback
/// options; an empty bag is only valid for in-memory test transports.
pub trait MultiplexedListenerFactory: Send + Sync {
    /// Optional selector, as for [`ListenerFactory::can_bind`].
    fn can_bind(&self, _endpoint: &Endpoint) -> bool {
        true
    }

    fn bind(
        &self,
        endpoint: Endpoint,
        features: Arc<Features>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Box<dyn MultiplexedListener>, BindError>>;
}

/// A bound multiplexed listener. Connections surface through the same base
/// shape as stream connections; their streams are the transport's business.
pub trait MultiplexedListener: Send + Sync {
    fn endpoint(&self) -> Endpoint;

    fn accept(&self) -> BoxFuture<'_, io::Result<Option<Box<dyn AcceptedConnection>>>>;

    fn unbind(&self) -> BoxFuture<'_, ()>;

    fn dispose(&self) -> BoxFuture<'_, ()>;

    fn max_accepts(&self) -> usize {
        1
    }
}

/// Uniform async accept surface over both listener shapes.
pub enum GenericListener {
    Stream(Box<dyn Listener>),
    Multiplexed(Box<dyn MultiplexedListener>),
}

impl GenericListener {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            GenericListener::Stream(listener) => listener.endpoint(),
            GenericListener::Multiplexed(listener) => listener.endpoint(),
        }
    }

    pub async fn accept(&self) -> io::Result<Option<Box<dyn AcceptedConnection>>> {
        match self {
            GenericListener::Stream(listener) => listener.accept().await,
            GenericListener::Multiplexed(listener) => listener.accept().await,
        }
    }

    pub async fn unbind(&self) {
        match self {
            GenericListener::Stream(listener) => listener.unbind().await,
            GenericListener::Multiplexed(listener) => listener.unbind().await,
        }
    }

    pub async fn dispose(&self) {
        match self {
            GenericListener::Stream(listener) => listener.dispose().await,
            GenericListener::Multiplexed(listener) => listener.dispose().await,
        }
    }

    pub fn max_accepts(&self) -> usize {
        match self {
            GenericListener::Stream(listener) => listener.max_accepts(),
            GenericListener::Multiplexed(listener) => listener.max_accepts(),
        }
    }
}
