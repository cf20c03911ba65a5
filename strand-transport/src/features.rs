//! Per-connection capability bag.
//!
//! Capabilities are published by whoever produces the connection and looked
//! up by middleware by type. There is no inheritance involved; a capability
//! is just a shared value keyed by its `TypeId`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{BoxError, BoxFuture};

/// Heterogeneous capability map attached to every connection.
#[derive(Default)]
pub struct Features {
    map: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a capability, replacing any previous instance of the same
    /// type.
    pub fn set<T: Send + Sync + 'static>(&self, value: Arc<T>) {
        self.map.lock().insert(TypeId::of::<T>(), value);
    }

    /// Looks a capability up by type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.map
            .lock()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.lock().contains_key(&TypeId::of::<T>())
    }
}

/// User state handed back to an on-completed callback.
pub type CompleteState = Box<dyn Any + Send>;

/// Callback registered through [`ConnectionComplete`].
pub type CompleteCallback =
    Box<dyn FnOnce(CompleteState) -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// Lets middleware register callbacks that run once, after the connection
/// delegate returns and before the connection leaves its manager, in reverse
/// registration order.
#[derive(Default)]
pub struct ConnectionComplete {
    callbacks: Mutex<Vec<(CompleteCallback, CompleteState)>>,
}

impl ConnectionComplete {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a `(callback, state)` pair.
    pub fn on_completed(&self, state: CompleteState, callback: CompleteCallback) {
        self.callbacks.lock().push((callback, state));
    }

    /// Drains the registered pairs in registration order.
    pub(crate) fn take(&self) -> Vec<(CompleteCallback, CompleteState)> {
        std::mem::take(&mut *self.callbacks.lock())
    }
}
