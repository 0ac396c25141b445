//! # Method Handler Registry
//!
//! Maps fully qualified method names to the handler answering them.
//!
//! Registering a handler for a method that already has one replaces it and logs a
//! warning, so handlers can be hot-swapped on a running server.
use super::handler::MethodHandler;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No handler registered for method '{0}'")]
    NotFound(String),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
}

impl HandlerRegistry {
    /// Registers `handler` for `method`, replacing (and returning) any previous one.
    pub fn set(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Option<Arc<dyn MethodHandler>> {
        let method = method.into();
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.clone(), handler);

        if previous.is_some() {
            tracing::warn!(%method, "replacing existing method handler");
        }
        previous
    }

    pub fn dispatch(&self, method: &str) -> Result<Arc<dyn MethodHandler>, RegistryError> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(method.to_string()))
    }

    /// Returns whether a handler was removed.
    pub fn remove(&self, method: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(method)
            .is_some()
    }

    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Methods with a registered handler, sorted by name.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        methods.sort();
        methods
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}
