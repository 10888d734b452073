//! Consume loop and per-request processing.
//!
//! The loop pulls deliveries one at a time and spawns a task for each, after
//! taking a permit from the concurrency semaphore. Each task:
//!
//! 1. decodes the body (garbage becomes `null`)
//! 2. looks the method up and runs its handler, isolated in its own task
//! 3. publishes the reply
//! 4. acks the delivery, whether or not the publish succeeded

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Semaphore;

use super::reply::ReplyPublisher;
use crate::broker::{BrokerChannel, DeliveryStream};
use crate::codec::JsonCodec;
use crate::envelope::{Delivery, Envelope};
use crate::handler::{
    error_payload, method_not_found_payload, Handler, HandlerRegistry, RequestContext,
};

/// Shared state of the consume loop and its request tasks.
pub(crate) struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    channel: Arc<dyn BrokerChannel>,
    replies: ReplyPublisher,
    app_name: Arc<str>,
    debug: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<HandlerRegistry>,
        channel: Arc<dyn BrokerChannel>,
        replies: ReplyPublisher,
        app_name: &str,
        debug: bool,
    ) -> Self {
        Self {
            registry,
            channel,
            replies,
            app_name: Arc::from(app_name),
            debug,
        }
    }

    /// Consume until the delivery stream closes, then wait for in-flight
    /// requests to finish.
    pub(crate) async fn run(
        self: Arc<Self>,
        mut deliveries: DeliveryStream,
        semaphore: Arc<Semaphore>,
        limit: u32,
    ) {
        while let Some(delivery) = deliveries.next().await {
            // Waiting here is the backpressure: unacked messages stay with
            // the broker until a slot frees up.
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };

            let dispatcher = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                dispatcher.handle_delivery(delivery).await;
            });
        }

        tracing::debug!("RPC delivery stream closed for {}", self.app_name);
        let _ = semaphore.acquire_many(limit).await;
    }

    /// Process one delivery end to end.
    pub(crate) async fn handle_delivery(&self, delivery: Delivery) {
        let Delivery {
            delivery_tag,
            envelope,
            ..
        } = delivery;
        let envelope = Arc::new(envelope);

        let body = self.process(envelope.clone()).await;

        // Failure is already logged by the reply publisher.
        let _ = self.replies.send(&envelope, body.clone()).await;

        if self.debug {
            tracing::debug!(
                "RPC Return: ({}){}@{}->{} {}",
                envelope.message_id,
                envelope.kind,
                self.app_name,
                envelope.reply_to,
                String::from_utf8_lossy(&body)
            );
        }

        if let Err(e) = self.channel.ack(delivery_tag, false).await {
            tracing::error!(
                "Failed to ack RPC request {} (tag {}): {}",
                envelope.message_id,
                delivery_tag,
                e
            );
        }
    }

    /// Compute the reply body for a request.
    pub(crate) async fn process(&self, envelope: Arc<Envelope>) -> Bytes {
        let query = JsonCodec::decode_lossy(&envelope.body);

        if self.debug {
            tracing::debug!(
                "RPC Receive: ({}){}->{}@{} {}",
                envelope.message_id,
                envelope.reply_to,
                envelope.kind,
                self.app_name,
                query
            );
        }

        match self.registry.get(&envelope.kind) {
            Some(handler) => {
                let ctx = RequestContext::new(envelope, self.app_name.clone());
                invoke(handler, query, ctx).await
            }
            None => method_not_found_payload(),
        }
    }
}

/// Run a handler in its own task so a panic stays with this request.
///
/// Errors and panics become `{"rpc_error": ...}` reply bodies.
async fn invoke(handler: Arc<dyn Handler>, query: Value, ctx: RequestContext) -> Bytes {
    let message_id = ctx.message_id().to_string();
    let method = ctx.method().to_string();

    match tokio::spawn(async move { handler.call(query, ctx).await }).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            tracing::warn!("RPC handler {} failed for {}: {}", method, message_id, e);
            error_payload(&e.to_string())
        }
        Err(e) if e.is_panic() => {
            tracing::error!("RPC handler {} panicked for {}", method, message_id);
            error_payload("handler panicked")
        }
        Err(e) => {
            tracing::error!("RPC handler {} aborted for {}: {}", method, message_id, e);
            error_payload("handler aborted")
        }
    }
}
