//! Fault injection for the accept path.

use std::io;

use tokio_util::sync::CancellationToken;

use strand_transport::{
    AcceptedConnection, BindError, BoxFuture, Endpoint, Listener, ListenerFactory,
};

/// Factory whose listeners fail every accept with the same error. Each
/// accept consumer observes the failure independently, which is the point.
pub struct FaultyListenerFactory {
    message: &'static str,
    max_accepts: usize,
}

impl FaultyListenerFactory {
    pub fn new(message: &'static str, max_accepts: usize) -> Self {
        Self {
            message,
            max_accepts,
        }
    }
}

impl ListenerFactory for FaultyListenerFactory {
    fn bind(
        &self,
        endpoint: Endpoint,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Box<dyn Listener>, BindError>> {
        Box::pin(async move {
            Ok(Box::new(FaultyListener {
                endpoint,
                message: self.message,
                max_accepts: self.max_accepts,
            }) as Box<dyn Listener>)
        })
    }
}

struct FaultyListener {
    endpoint: Endpoint,
    message: &'static str,
    max_accepts: usize,
}

impl Listener for FaultyListener {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<Option<Box<dyn AcceptedConnection>>>> {
        Box::pin(async move { Err(io::Error::other(self.message)) })
    }

    fn unbind(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn dispose(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn max_accepts(&self) -> usize {
        self.max_accepts
    }
}
