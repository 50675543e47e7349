//! Handler contract: a resolved, registered function invoked as
//! `(context, payload) -> Success | Retry | Fatal`, modeling the source's
//! exceptions-as-control-flow as an explicit sum type instead.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::HandlerError;

/// Context passed to every handler invocation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub occurrence_id: i64,
    pub task_id: i64,
    pub name: String,
    pub scheduled_for: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// The result of one handler invocation.
pub enum HandlerOutcome {
    Success(serde_json::Value),
    Retry(String),
    Fatal(String),
}

/// A handler implementation, resolved by string identifier from the
/// registry. Implementors run one occurrence's worth of business logic and
/// return an explicit outcome rather than throwing.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: TaskContext, payload: serde_json::Value) -> HandlerOutcome;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerOutcome> + Send,
{
    async fn call(&self, ctx: TaskContext, payload: serde_json::Value) -> HandlerOutcome {
        (self)(ctx, payload).await
    }
}

/// Process-wide map from handler identifier to implementation. Registration
/// is expected to happen once at process start; a duplicate registration is
/// a programming error and panics, mirroring the registry convention this is
/// grounded on.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            panic!("handler already registered: {name}");
        }
        self.handlers.insert(name, Box::new(handler));
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn resolve(&self, name: &str) -> Result<&dyn Handler, HandlerError> {
        self.handlers
            .get(name)
            .map(|h| h.as_ref())
            .ok_or_else(|| HandlerError::Unresolved(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TaskContext {
        TaskContext {
            occurrence_id: 1,
            task_id: 1,
            name: "test".to_string(),
            scheduled_for: Utc::now(),
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn registered_handler_resolves_and_runs() {
        let mut registry = HandlerRegistry::new();
        registry.register("noop", |_ctx: TaskContext, _payload: serde_json::Value| async {
            HandlerOutcome::Success(serde_json::json!({"ok": true}))
        });
        let handler = registry.resolve("noop").expect("registered");
        match handler.call(ctx(), serde_json::json!({})).await {
            HandlerOutcome::Success(value) => assert_eq!(value, serde_json::json!({"ok": true})),
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn unresolved_handler_is_an_error() {
        let registry = HandlerRegistry::new();
        assert!(registry.resolve("missing").is_err());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut registry = HandlerRegistry::new();
        registry.register("dup", |_ctx: TaskContext, _payload: serde_json::Value| async {
            HandlerOutcome::Success(serde_json::Value::Null)
        });
        registry.register("dup", |_ctx: TaskContext, _payload: serde_json::Value| async {
            HandlerOutcome::Success(serde_json::Value::Null)
        });
    }

    #[test]
    fn registry_has_and_len() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        registry.register("a", |_ctx: TaskContext, _payload: serde_json::Value| async {
            HandlerOutcome::Fatal("x".to_string())
        });
        assert!(registry.has("a"));
        assert_eq!(registry.len(), 1);
    }
}
