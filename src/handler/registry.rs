//! Handler registry for dispatching requests by method name.
//!
//! The registry is filled while the server is being built and frozen behind
//! an `Arc` once the consume loop starts; lookups never take a lock.
//!
//! # Example
//!
//! ```ignore
//! use synapse_rpc::handler::{HandlerRegistry, RequestContext};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register("echo", |data: serde_json::Value, _ctx: RequestContext| async move {
//!     Ok(data)
//! });
//!
//! assert!(registry.contains("echo"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use super::RequestContext;
use crate::codec::JsonCodec;
use crate::error::{Result, RpcError};

/// Error text returned to callers of unregistered methods.
pub const METHOD_NOT_FOUND: &str = "method not found";

/// Encoded reply body produced by a handler.
pub type HandlerOutput = Result<Bytes>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request with its decoded JSON body.
    fn call(&self, body: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerOutput>;
}

/// Wrapper that converts the body to `T` and encodes the handler's result.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, body: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerOutput> {
        let parsed: T = match serde_json::from_value(body) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(RpcError::Json(e)) }),
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let result = fut.await?;
            Ok(JsonCodec::encode_lossy(&result))
        })
    }
}

/// Body returned when no handler is registered for a method.
pub fn method_not_found_payload() -> Bytes {
    error_payload(METHOD_NOT_FOUND)
}

/// Structured error body: `{"rpc_error": message}`.
pub fn error_payload(message: &str) -> Bytes {
    JsonCodec::encode_lossy(&json!({ "rpc_error": message }))
}

/// Registry mapping method names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a typed method handler.
    ///
    /// Registering the same name twice replaces the earlier handler.
    pub fn register<F, T, R, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.register_handler(name, Arc::new(TypedHandler::new(handler)));
    }

    /// Register a pre-built handler object.
    pub fn register_handler(&mut self, name: &str, handler: Arc<dyn Handler>) {
        if self.handlers.insert(name.to_string(), handler).is_some() {
            tracing::warn!("Replacing RPC handler for method {}", name);
        }
    }

    /// Get a handler by method name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    /// Whether a handler is registered for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
