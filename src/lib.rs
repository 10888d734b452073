//! # synapse-rpc
//!
//! Asynchronous RPC dispatch over a topic-exchange message broker.
//!
//! A server exposes named methods. Callers publish requests to the system
//! exchange under `server.{app}`; the server consumes them from its queue,
//! runs the matching handler and publishes a correlated reply under
//! `client.{replyTo}.{appId}`.
//!
//! ## Architecture
//!
//! - **Queue binding**: declares `{system}_{app}_server` and binds it
//! - **Dispatcher**: one consume loop, one task per request, bounded by a semaphore
//! - **Reply publisher**: builds the reply envelope; a single task publishes it
//! - **Broker**: [`Connection`] / [`BrokerChannel`] traits, with [`MemoryBroker`]
//!   as an in-process implementation
//!
//! ## Example
//!
//! ```ignore
//! use synapse_rpc::{MemoryBroker, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = MemoryBroker::new();
//!     broker.declare_exchange("shop");
//!
//!     let server = Server::builder("shop", "orders")
//!         .handle("echo", |data: serde_json::Value, _ctx| async move { Ok(data) })
//!         .start(&broker)
//!         .await
//!         .unwrap();
//!
//!     server.wait_for_shutdown().await.unwrap();
//! }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod ident;
pub mod publisher;
pub mod server;
pub mod topology;

pub use broker::{BrokerChannel, Connection, MemoryBroker};
pub use config::{ServerConfig, TopologyPolicy};
pub use envelope::{Delivery, Envelope};
pub use error::{Result, RpcError};
pub use handler::RequestContext;
pub use server::{Server, ServerBuilder};
