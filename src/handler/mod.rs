//! Handler module - request handling and dispatch.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps method names to handlers
//! - [`RequestContext`] - request metadata passed to every handler
//!
//! # Example
//!
//! ```ignore
//! use synapse_rpc::handler::{HandlerRegistry, RequestContext};
//! use serde_json::Value;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! // Echo the decoded body back.
//! registry.register("echo", |body: Value, _ctx: RequestContext| async move { Ok(body) });
//!
//! // Typed arguments and result.
//! registry.register("add", |args: (i64, i64), _ctx| async move { Ok(args.0 + args.1) });
//! ```

mod context;
mod registry;

pub use context::RequestContext;
pub use registry::{
    error_payload, method_not_found_payload, BoxFuture, Handler, HandlerOutput, HandlerRegistry,
    TypedHandler, METHOD_NOT_FOUND,
};
