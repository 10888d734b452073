//! Broker module - the message broker collaborator seen by the server.
//!
//! The server only needs a handful of operations from the broker, captured
//! by two traits:
//!
//! - [`Connection`] - opens channels
//! - [`BrokerChannel`] - declares and binds queues, consumes, publishes, acks
//!
//! [`MemoryBroker`] implements both in-process with topic-exchange routing.
//! Adapters for a real broker client implement the same traits.
//!
//! # Example
//!
//! ```ignore
//! use synapse_rpc::broker::{Connection, MemoryBroker, QueueOptions};
//!
//! let broker = MemoryBroker::new();
//! broker.declare_exchange("shop");
//!
//! let channel = broker.open_channel(10, "client").await?;
//! channel.declare_queue("shop_web_client", QueueOptions::default()).await?;
//! channel.bind_queue("shop_web_client", "shop", "client.web.#").await?;
//! let mut replies = channel.consume("shop_web_client", "web-1", Default::default()).await?;
//! ```

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::{Delivery, Envelope};
use crate::error::Result;

pub use memory::{BrokerEvent, MemoryBroker, MemoryChannel};

/// Options applied when declaring a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,
    /// Restrict the queue to the declaring connection.
    pub exclusive: bool,
}

/// Options applied when registering a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeOptions {
    /// Broker considers messages acknowledged as soon as they are delivered.
    pub auto_ack: bool,
    /// Only this consumer may read from the queue.
    pub exclusive: bool,
    /// Do not deliver messages published on this connection.
    pub no_local: bool,
}

/// Options applied when publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    /// Return the message if it cannot be routed to any queue.
    pub mandatory: bool,
    /// Return the message if no consumer can take it immediately.
    pub immediate: bool,
}

/// Stream of deliveries for one consumer.
///
/// Ends when the broker side of the consumer is torn down.
#[derive(Debug)]
pub struct DeliveryStream {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryStream {
    /// Wrap a receiver fed by a broker adapter.
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { rx }
    }

    /// Wait for the next delivery. Returns `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// A broker connection able to open channels.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a channel with the given prefetch (QoS) count.
    ///
    /// `purpose` labels the channel in broker-side diagnostics.
    async fn open_channel(&self, prefetch: u16, purpose: &str) -> Result<Arc<dyn BrokerChannel>>;
}

/// A broker channel.
///
/// Implementations must accept `publish` calls from several tasks; the
/// server additionally funnels its replies through a single publisher task.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue, creating it if needed.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    /// Bind a queue to an exchange with a routing pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Start consuming from a queue.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream>;

    /// Publish an envelope to an exchange.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        envelope: Envelope,
    ) -> Result<()>;

    /// Acknowledge a delivery (or every delivery up to it when `multiple`).
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;
}
