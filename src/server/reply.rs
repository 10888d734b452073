//! Reply construction and publishing.
//!
//! A reply goes to the system exchange under `client.{replyTo}.{appId}` of
//! the request and carries:
//!
//! - `app_id` / `reply_to` of this server
//! - a fresh 20-character `message_id`
//! - the request's `type`, unchanged
//! - the request's `message_id` as `correlation_id`

use std::sync::Arc;

use bytes::Bytes;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::ident::{IdGenerator, MESSAGE_ID_LEN};
use crate::publisher::{OutboundReply, PublisherHandle};
use crate::topology::reply_routing_key;

/// Builds correlated replies and hands them to the publisher task.
#[derive(Clone)]
pub struct ReplyPublisher {
    exchange: String,
    app_id: String,
    app_name: String,
    ids: Arc<dyn IdGenerator>,
    publisher: PublisherHandle,
}

impl ReplyPublisher {
    /// Create a reply publisher for one server instance.
    pub fn new(
        exchange: impl Into<String>,
        app_id: impl Into<String>,
        app_name: impl Into<String>,
        ids: Arc<dyn IdGenerator>,
        publisher: PublisherHandle,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            app_id: app_id.into(),
            app_name: app_name.into(),
            ids,
            publisher,
        }
    }

    /// Build the reply to `request` carrying `body`.
    pub fn build(&self, request: &Envelope, body: Bytes) -> OutboundReply {
        OutboundReply {
            exchange: self.exchange.clone(),
            routing_key: reply_routing_key(&request.reply_to, &request.app_id),
            envelope: Envelope {
                app_id: self.app_id.clone(),
                message_id: self.ids.generate(MESSAGE_ID_LEN),
                reply_to: self.app_name.clone(),
                kind: request.kind.clone(),
                correlation_id: Some(request.message_id.clone()),
                body,
            },
        }
    }

    /// Publish the reply to `request`. One attempt; failures are logged
    /// and returned, never retried.
    pub async fn send(&self, request: &Envelope, body: Bytes) -> Result<()> {
        let reply = self.build(request, body);
        let routing_key = reply.routing_key.clone();

        self.publisher.publish(reply).await.map_err(|e| {
            tracing::error!(
                "Failed to reply RPC request {} via {}: {}",
                request.message_id,
                routing_key,
                e
            );
            e
        })
    }
}
