//! Inbound queue declaration and binding.

use crate::broker::{BrokerChannel, QueueOptions};
use crate::error::{Result, RpcError};
use crate::topology::{server_queue_name, server_routing_key};

/// Options of the inbound RPC queue: durable, auto-delete, shared.
pub const SERVER_QUEUE_OPTIONS: QueueOptions = QueueOptions {
    durable: true,
    auto_delete: true,
    exclusive: false,
};

/// Declare `{system}_{app}_server` and bind it to the system exchange
/// with `server.{app}`.
///
/// Each failure is logged. The bind is attempted even if the declare
/// failed; the first error is returned so the caller can apply its
/// topology policy.
pub async fn bind_server_queue(
    channel: &dyn BrokerChannel,
    system: &str,
    app: &str,
) -> Result<String> {
    let queue = server_queue_name(system, app);
    let mut first_error: Option<RpcError> = None;

    if let Err(e) = channel.declare_queue(&queue, SERVER_QUEUE_OPTIONS).await {
        tracing::error!("Failed to declare RPC queue {}: {}", queue, e);
        first_error = Some(RpcError::Topology(format!("declare {}: {}", queue, e)));
    }

    let routing_key = server_routing_key(app);
    if let Err(e) = channel.bind_queue(&queue, system, &routing_key).await {
        tracing::error!(
            "Failed to bind RPC queue {} to exchange {} with {}: {}",
            queue,
            system,
            routing_key,
            e
        );
        if first_error.is_none() {
            first_error = Some(RpcError::Topology(format!("bind {}: {}", queue, e)));
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(queue),
    }
}
