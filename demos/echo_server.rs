//! Echo Server - request/response over the in-memory broker.
//!
//! This example demonstrates:
//! - Building a server with the fluent builder
//! - Registering untyped and typed handlers
//! - Calling it the way a remote client would: a reply queue bound to
//!   `client.{app}.{id}` and requests published to `server.{app}`
//!
//! Run with `RUST_LOG=debug cargo run --example echo_server` to see the
//! per-request diagnostics.

use serde::{Deserialize, Serialize};
use serde_json::json;
use synapse_rpc::broker::{ConsumeOptions, PublishOptions, QueueOptions};
use synapse_rpc::{Connection, Envelope, MemoryBroker, RequestContext, Server};
use tracing_subscriber::EnvFilter;

/// Input structure for the add method.
#[derive(Deserialize, Debug)]
struct AddInput {
    a: i64,
    b: i64,
}

/// Output structure for the add method.
#[derive(Serialize, Debug)]
struct AddOutput {
    sum: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let broker = MemoryBroker::new();
    broker.declare_exchange("demo");

    let server = Server::builder("demo", "calc")
        .debug(true)
        .handle("echo", |data: serde_json::Value, _ctx: RequestContext| async move {
            Ok(data)
        })
        .handle("add", |input: AddInput, _ctx: RequestContext| async move {
            Ok(AddOutput {
                sum: input.a + input.b,
            })
        })
        .start(&broker)
        .await?;

    // Caller side.
    let channel = broker.open_channel(10, "RpcClient").await?;
    channel
        .declare_queue("demo_cli_client", QueueOptions::default())
        .await?;
    channel
        .bind_queue("demo_cli_client", "demo", "client.cli.C1")
        .await?;
    let mut replies = channel
        .consume(
            "demo_cli_client",
            "demo.cli.client",
            ConsumeOptions {
                auto_ack: true,
                ..ConsumeOptions::default()
            },
        )
        .await?;

    let requests = [
        ("echo", json!({"hello": "world"})),
        ("add", json!({"a": 2, "b": 40})),
        ("missing", json!(null)),
    ];
    for (i, (method, body)) in requests.iter().enumerate() {
        let request = Envelope::request(
            "C1",
            format!("req-{}", i),
            "cli",
            *method,
            serde_json::to_vec(body)?,
        );
        channel
            .publish("demo", "server.calc", PublishOptions::default(), request)
            .await?;
    }

    for _ in 0..requests.len() {
        if let Some(reply) = replies.next().await {
            println!(
                "{} ({}) -> {}",
                reply.envelope.kind,
                reply.envelope.correlation_id.unwrap_or_default(),
                String::from_utf8_lossy(&reply.envelope.body)
            );
        }
    }

    broker.close();
    server.wait_for_shutdown().await?;
    Ok(())
}
