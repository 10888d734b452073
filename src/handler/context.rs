//! Request context for handlers.
//!
//! Carries the metadata of the request being served: who sent it, where
//! the reply goes, and which method was invoked.
//!
//! # Example
//!
//! ```ignore
//! async fn whoami(_: serde_json::Value, ctx: RequestContext) -> Result<String> {
//!     Ok(format!("{} asked {} for {}", ctx.app_id(), ctx.local_app(), ctx.method()))
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;

use crate::envelope::Envelope;

/// Context passed to request handlers.
///
/// `RequestContext` is `Clone` and cheap to move into spawned tasks.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The request as received.
    envelope: Arc<Envelope>,
    /// Name of the application serving the request.
    local_app: Arc<str>,
}

impl RequestContext {
    /// Create a new request context.
    pub fn new(envelope: Arc<Envelope>, local_app: Arc<str>) -> Self {
        Self {
            envelope,
            local_app,
        }
    }

    /// Sender's message id; the reply carries it as correlation id.
    #[inline]
    pub fn message_id(&self) -> &str {
        &self.envelope.message_id
    }

    /// Application name of the caller.
    #[inline]
    pub fn reply_to(&self) -> &str {
        &self.envelope.reply_to
    }

    /// Application instance id of the caller.
    #[inline]
    pub fn app_id(&self) -> &str {
        &self.envelope.app_id
    }

    /// Method name being invoked.
    #[inline]
    pub fn method(&self) -> &str {
        &self.envelope.kind
    }

    /// Raw request body as received.
    #[inline]
    pub fn raw_body(&self) -> &Bytes {
        &self.envelope.body
    }

    /// Name of the application serving the request.
    #[inline]
    pub fn local_app(&self) -> &str {
        &self.local_app
    }

    /// Full request envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        let env = Envelope::request("A1", "abc123", "clientA", "echo", &b"{\"x\":1}"[..]);
        RequestContext::new(Arc::new(env), Arc::from("orders"))
    }

    #[test]
    fn test_context_accessors() {
        let ctx = ctx();
        assert_eq!(ctx.message_id(), "abc123");
        assert_eq!(ctx.reply_to(), "clientA");
        assert_eq!(ctx.app_id(), "A1");
        assert_eq!(ctx.method(), "echo");
        assert_eq!(&ctx.raw_body()[..], b"{\"x\":1}");
        assert_eq!(ctx.local_app(), "orders");
    }

    #[test]
    fn test_context_is_clone() {
        let ctx = ctx();
        let ctx2 = ctx.clone();

        assert_eq!(ctx.message_id(), ctx2.message_id());
        assert_eq!(ctx.envelope(), ctx2.envelope());
    }
}
