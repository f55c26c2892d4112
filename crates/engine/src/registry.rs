//! Handler registry.
//!
//! Handlers are the single capability the engine calls out to. The registry
//! is populated at startup and read-only afterwards; unknown task types are
//! accepted at job creation and fail at execution time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chronos_core::JobId;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Failure reported by a handler.
///
/// The message is what error classification and retryability inspect, so
/// handlers should phrase permanent failures with the non-retryable markers
/// ("validation", "invalid", ...).
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub stack: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Read-only view of the job handed to a handler.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub job_id: JobId,
    pub job_seq: i64,
    pub job_name: String,
    pub task_type: String,
    /// 0 for the first attempt.
    pub attempt: u32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub payload: JsonValue,
}

/// A registered task capability.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: HandlerContext) -> Result<JsonValue, HandlerError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, HandlerError>> + Send,
{
    async fn run(&self, ctx: HandlerContext) -> Result<JsonValue, HandlerError> {
        (self.f)(ctx).await
    }
}

/// Map from `task_type` to handler. Per worker, write-once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.insert(task_type.into(), Arc::new(handler));
    }

    /// Register a plain async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<String>, f: F)
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, HandlerError>> + Send + 'static,
    {
        self.handlers.insert(task_type.into(), Arc::new(FnHandler { f }));
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
