//! Message envelope - the wire-level request/reply record.
//!
//! An [`Envelope`] carries the broker message properties the RPC protocol
//! relies on plus the JSON body. Requests and replies share the same shape;
//! only replies carry a `correlation_id`.

use bytes::Bytes;

/// A single request or reply message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Identifier of the sending application instance.
    pub app_id: String,
    /// Sender-generated unique id. Becomes the reply's correlation id.
    pub message_id: String,
    /// Application name that should receive the next hop.
    pub reply_to: String,
    /// Method name (the broker `type` property). Echoed unchanged on replies.
    pub kind: String,
    /// Request's `message_id`, set on replies only.
    pub correlation_id: Option<String>,
    /// JSON payload bytes.
    pub body: Bytes,
}

impl Envelope {
    /// Create a request envelope.
    pub fn request(
        app_id: impl Into<String>,
        message_id: impl Into<String>,
        reply_to: impl Into<String>,
        kind: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            message_id: message_id.into(),
            reply_to: reply_to.into(),
            kind: kind.into(),
            correlation_id: None,
            body: body.into(),
        }
    }
}

/// A message handed out by the broker to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    /// The message itself.
    pub envelope: Envelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_constructor() {
        let env = Envelope::request("A1", "abc123", "clientA", "echo", &b"{}"[..]);

        assert_eq!(env.app_id, "A1");
        assert_eq!(env.message_id, "abc123");
        assert_eq!(env.reply_to, "clientA");
        assert_eq!(env.kind, "echo");
        assert_eq!(&env.body[..], b"{}");
        assert_eq!(env.correlation_id, None);
    }
}
