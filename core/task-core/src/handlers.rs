//! Typed handler registry: maps a task `name` to an async function.
//! Populated at startup with three reference handlers (`heartbeat`, `echo`,
//! `sha256`); an unknown name produces [`HandlerError::UnknownTask`] rather
//! than a dynamic import failure.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::HandlerError;

/// A boxed future resolving to a handler's outcome.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// A task handler: takes the decoded JSON payload, runs to completion or
/// failure. Boxed so the registry can hold a heterogeneous set of handler
/// bodies behind one function-pointer shape.
pub type HandlerFn = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Name → handler map, consulted once per message during handler
/// execution in the worker pipeline.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `name` with the given handler body. Re-registering a name
    /// replaces the previous entry.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handlers
            .insert(name.to_string(), Arc::new(move |payload| Box::pin(handler(payload))));
    }

    /// Look up and invoke the handler for `name`. `HandlerError::UnknownTask`
    /// if no handler is registered.
    pub async fn dispatch(&self, name: &str, payload: Value) -> Result<(), HandlerError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| HandlerError::UnknownTask(name.to_string()))?
            .clone();
        handler(payload).await
    }

    /// Populate with three reference handlers: `heartbeat` (no-op
    /// liveness probe), `echo` (accepts any payload), `sha256` (hashes a
    /// `"text"` field and returns via log; the store records
    /// success/failure, not a return value, so the digest is emitted
    /// through tracing for now).
    pub fn with_reference_handlers() -> Self {
        let mut registry = Self::new();
        registry.register("heartbeat", handle_heartbeat);
        registry.register("echo", handle_echo);
        registry.register("sha256", handle_sha256);
        registry
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_heartbeat(_payload: Value) -> Result<(), HandlerError> {
    tracing::debug!("heartbeat");
    Ok(())
}

async fn handle_echo(payload: Value) -> Result<(), HandlerError> {
    tracing::info!(?payload, "echo");
    Ok(())
}

async fn handle_sha256(payload: Value) -> Result<(), HandlerError> {
    let data = payload
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let digest = hex::encode(hasher.finalize());
    tracing::info!(digest = %digest, "sha256");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let registry = HandlerRegistry::with_reference_handlers();
        let result = registry.dispatch("echo", json!({"msg": "hi"})).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unknown_name_is_a_typed_error() {
        let registry = HandlerRegistry::with_reference_handlers();
        let err = registry.dispatch("nonexistent", json!({})).await.unwrap_err();
        assert!(matches!(err, HandlerError::UnknownTask(name) if name == "nonexistent"));
    }

    #[tokio::test]
    async fn custom_handler_can_fail() {
        let mut registry = HandlerRegistry::new();
        registry.register("always_fails", |_payload| async move {
            Err(HandlerError::Failed("boom".into()))
        });
        let err = registry.dispatch("always_fails", json!({})).await.unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
    }

    #[tokio::test]
    async fn sha256_handler_hashes_text_field() {
        let registry = HandlerRegistry::with_reference_handlers();
        let result = registry.dispatch("sha256", json!({"text": "hello"})).await;
        assert!(result.is_ok());
    }
}
