//! Integration tests for synapse-rpc.
//!
//! Each test runs a real server on a `MemoryBroker` and plays the remote
//! caller: it owns a reply queue bound to `client.{app}.{id}` and publishes
//! requests to `server.{app}`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use synapse_rpc::broker::{
    BrokerEvent, ConsumeOptions, DeliveryStream, PublishOptions, QueueOptions,
};
use synapse_rpc::{
    BrokerChannel, Connection, Delivery, Envelope, MemoryBroker, RequestContext, RpcError, Server,
};
use tokio::sync::Notify;

const SYS: &str = "sys";
const APP: &str = "calc";
const TIMEOUT: Duration = Duration::from_secs(2);

/// The calling side of the protocol.
struct Caller {
    channel: Arc<dyn BrokerChannel>,
    replies: DeliveryStream,
    name: String,
    app_id: String,
}

impl Caller {
    async fn new(broker: &MemoryBroker, name: &str, app_id: &str) -> Self {
        let channel = broker.open_channel(10, "RpcClient").await.unwrap();
        let queue = format!("{}_{}_client", SYS, name);
        channel
            .declare_queue(&queue, QueueOptions::default())
            .await
            .unwrap();
        channel
            .bind_queue(&queue, SYS, &format!("client.{}.{}", name, app_id))
            .await
            .unwrap();
        let options = ConsumeOptions {
            auto_ack: true,
            ..ConsumeOptions::default()
        };
        let replies = channel
            .consume(&queue, &format!("{}.{}.client", SYS, name), options)
            .await
            .unwrap();

        Self {
            channel,
            replies,
            name: name.to_string(),
            app_id: app_id.to_string(),
        }
    }

    async fn send_raw(&self, kind: &str, message_id: &str, body: &[u8]) {
        let request = Envelope::request(
            self.app_id.clone(),
            message_id,
            self.name.clone(),
            kind,
            body.to_vec(),
        );
        self.channel
            .publish(SYS, &format!("server.{}", APP), PublishOptions::default(), request)
            .await
            .unwrap();
    }

    async fn send(&self, kind: &str, message_id: &str, body: Value) {
        self.send_raw(kind, message_id, &serde_json::to_vec(&body).unwrap())
            .await;
    }

    async fn reply(&mut self) -> Delivery {
        tokio::time::timeout(TIMEOUT, self.replies.next())
            .await
            .expect("timed out waiting for reply")
            .expect("reply stream closed")
    }

    async fn call(&mut self, kind: &str, message_id: &str, body: Value) -> Delivery {
        self.send(kind, message_id, body).await;
        self.reply().await
    }
}

fn body(delivery: &Delivery) -> Value {
    serde_json::from_slice(&delivery.envelope.body).unwrap()
}

fn broker() -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.declare_exchange(SYS);
    broker
}

async fn echo_server(broker: &MemoryBroker) -> Server {
    Server::builder(SYS, APP)
        .app_id("S1")
        .handle("echo", |data: Value, _ctx| async move { Ok(data) })
        .start(broker)
        .await
        .unwrap()
}

async fn wait_for_acks(broker: &MemoryBroker, count: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while broker.acked_tags().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for acks");
}

#[tokio::test]
async fn test_echo_round_trip() {
    let broker = broker();
    let _server = echo_server(&broker).await;
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    let reply = caller.call("echo", "abc123", json!({"x": 1})).await;

    assert_eq!(reply.routing_key, "client.clientA.A1");
    assert_eq!(reply.exchange, SYS);
    assert_eq!(reply.envelope.kind, "echo");
    assert_eq!(reply.envelope.correlation_id.as_deref(), Some("abc123"));
    assert_eq!(reply.envelope.app_id, "S1");
    assert_eq!(reply.envelope.reply_to, APP);
    assert_eq!(reply.envelope.message_id.len(), 20);
    assert_ne!(reply.envelope.message_id, "abc123");
    assert_eq!(body(&reply), json!({"x": 1}));
}

#[tokio::test]
async fn test_unknown_method() {
    let broker = broker();
    let _server = echo_server(&broker).await;
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    let reply = caller.call("unknown_method", "m1", json!({})).await;

    assert_eq!(reply.envelope.kind, "unknown_method");
    assert_eq!(reply.envelope.correlation_id.as_deref(), Some("m1"));
    assert_eq!(body(&reply), json!({"rpc_error": "method not found"}));
}

#[tokio::test]
async fn test_malformed_body_does_not_stop_dispatch() {
    let broker = broker();
    let _server = echo_server(&broker).await;
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    caller.send_raw("echo", "bad", b"{{{ not json").await;
    let first = caller.reply().await;
    assert_eq!(first.envelope.correlation_id.as_deref(), Some("bad"));
    assert_eq!(body(&first), Value::Null);

    let second = caller.call("echo", "good", json!({"ok": true})).await;
    assert_eq!(second.envelope.correlation_id.as_deref(), Some("good"));
    assert_eq!(body(&second), json!({"ok": true}));
}

#[tokio::test]
async fn test_reply_routed_to_each_callers_own_queue() {
    let broker = broker();
    let _server = echo_server(&broker).await;
    let mut alice = Caller::new(&broker, "alice", "A1").await;
    let mut bob = Caller::new(&broker, "bob", "B7").await;

    alice.send("echo", "from-alice", json!("a")).await;
    bob.send("echo", "from-bob", json!("b")).await;

    let a = alice.reply().await;
    let b = bob.reply().await;
    assert_eq!(a.routing_key, "client.alice.A1");
    assert_eq!(a.envelope.correlation_id.as_deref(), Some("from-alice"));
    assert_eq!(b.routing_key, "client.bob.B7");
    assert_eq!(b.envelope.correlation_id.as_deref(), Some("from-bob"));
}

#[tokio::test]
async fn test_concurrent_requests_keep_their_correlation() {
    let broker = broker();
    let _server = Server::builder(SYS, APP)
        .handle("slow_echo", |data: Value, _ctx| async move {
            // Later requests finish first.
            let n = data["n"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(50 - n)).await;
            Ok(data)
        })
        .start(&broker)
        .await
        .unwrap();
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    for n in 0..50u64 {
        caller
            .send("slow_echo", &format!("req-{}", n), json!({"n": n}))
            .await;
    }

    let mut seen = HashMap::new();
    for _ in 0..50 {
        let reply = caller.reply().await;
        let correlation = reply.envelope.correlation_id.clone().unwrap();
        let n = body(&reply)["n"].as_u64().unwrap();
        assert_eq!(correlation, format!("req-{}", n));
        assert!(seen.insert(correlation, reply.envelope.message_id).is_none());
    }

    assert_eq!(seen.len(), 50);
    let reply_ids: HashSet<&String> = seen.values().collect();
    assert_eq!(reply_ids.len(), 50);
}

#[tokio::test]
async fn test_ack_follows_reply_publish() {
    let broker = broker();
    let _server = echo_server(&broker).await;
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    caller.call("echo", "m1", json!(1)).await;
    wait_for_acks(&broker, 1).await;

    let events = broker.events();
    let kinds: Vec<&str> = events
        .iter()
        .map(|event| match event {
            BrokerEvent::Published { routing_key, .. } if routing_key.starts_with("server.") => {
                "request"
            }
            BrokerEvent::Published { .. } => "reply",
            BrokerEvent::Acked { .. } => "ack",
        })
        .collect();
    assert_eq!(kinds, vec!["request", "reply", "ack"]);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_every_request_acked_exactly_once() {
    let broker = broker();
    let _server = echo_server(&broker).await;
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    for i in 0..20 {
        caller.send("echo", &format!("m{}", i), json!(i)).await;
    }
    for _ in 0..20 {
        caller.reply().await;
    }
    wait_for_acks(&broker, 20).await;

    // The caller consumes with auto-ack, so only server acks are journaled.
    let tags = broker.acked_tags();
    let unique: HashSet<u64> = tags.iter().copied().collect();
    assert_eq!(tags.len(), 20);
    assert_eq!(unique.len(), 20);
}

#[tokio::test]
async fn test_publish_failure_still_acks() {
    let broker = broker();
    broker.reject_publishes("client.#");
    let _server = echo_server(&broker).await;
    let caller = Caller::new(&broker, "clientA", "A1").await;

    caller.send("echo", "lost", json!({})).await;
    wait_for_acks(&broker, 1).await;

    assert!(broker.published("client.#").is_empty());
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_handler_error_becomes_rpc_error() {
    let broker = broker();
    let _server = Server::builder(SYS, APP)
        .handle("divide", |args: (f64, f64), _ctx| async move {
            if args.1 == 0.0 {
                return Err(RpcError::handler("division by zero"));
            }
            Ok(args.0 / args.1)
        })
        .start(&broker)
        .await
        .unwrap();
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    let ok = caller.call("divide", "d1", json!([9.0, 3.0])).await;
    assert_eq!(body(&ok), json!(3.0));

    let err = caller.call("divide", "d2", json!([1.0, 0.0])).await;
    assert_eq!(err.envelope.correlation_id.as_deref(), Some("d2"));
    assert_eq!(body(&err), json!({"rpc_error": "division by zero"}));

    let bad_args = caller.call("divide", "d3", json!("nope")).await;
    let message = body(&bad_args)["rpc_error"].as_str().unwrap().to_string();
    assert!(message.starts_with("JSON error"));
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let broker = broker();
    let _server = Server::builder(SYS, APP)
        .handle("explode", |_: Value, _ctx| async move {
            if true {
                panic!("handler blew up");
            }
            Ok(())
        })
        .handle("echo", |data: Value, _ctx| async move { Ok(data) })
        .start(&broker)
        .await
        .unwrap();
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    let boom = caller.call("explode", "p1", json!({})).await;
    assert_eq!(body(&boom), json!({"rpc_error": "handler panicked"}));

    let next = caller.call("echo", "p2", json!("still alive")).await;
    assert_eq!(body(&next), json!("still alive"));
    wait_for_acks(&broker, 2).await;
}

#[tokio::test]
async fn test_slow_handler_does_not_block_intake() {
    let broker = broker();
    let gate = Arc::new(Notify::new());
    let handler_gate = gate.clone();

    let _server = Server::builder(SYS, APP)
        .handle("wait", move |_: Value, _ctx| {
            let gate = handler_gate.clone();
            async move {
                gate.notified().await;
                Ok("released")
            }
        })
        .handle("echo", |data: Value, _ctx| async move { Ok(data) })
        .start(&broker)
        .await
        .unwrap();
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    caller.send("wait", "slow", json!(null)).await;
    let fast = caller.call("echo", "fast", json!(1)).await;
    assert_eq!(fast.envelope.correlation_id.as_deref(), Some("fast"));

    gate.notify_one();
    let slow = caller.reply().await;
    assert_eq!(slow.envelope.correlation_id.as_deref(), Some("slow"));
    assert_eq!(body(&slow), json!("released"));
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let broker = broker();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (c, p) = (current.clone(), peak.clone());

    let _server = Server::builder(SYS, APP)
        .max_concurrent_handlers(2)
        .handle("work", move |data: Value, _ctx| {
            let (current, peak) = (c.clone(), p.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(data)
            }
        })
        .start(&broker)
        .await
        .unwrap();
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    for i in 0..10 {
        caller.send("work", &format!("w{}", i), json!(i)).await;
    }
    for _ in 0..10 {
        caller.reply().await;
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_handler_sees_request_metadata() {
    let broker = broker();
    let _server = Server::builder(SYS, APP)
        .handle("whoami", |_: Value, ctx: RequestContext| async move {
            Ok(json!({
                "message_id": ctx.message_id(),
                "reply_to": ctx.reply_to(),
                "app_id": ctx.app_id(),
                "method": ctx.method(),
                "local_app": ctx.local_app(),
            }))
        })
        .start(&broker)
        .await
        .unwrap();
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    let reply = caller.call("whoami", "w1", json!({})).await;
    assert_eq!(
        body(&reply),
        json!({
            "message_id": "w1",
            "reply_to": "clientA",
            "app_id": "A1",
            "method": "whoami",
            "local_app": APP,
        })
    );
}

#[tokio::test]
async fn test_instances_share_the_queue() {
    let broker = broker();
    let _first = Server::builder(SYS, APP)
        .app_id("S1")
        .handle("echo", |data: Value, _ctx| async move { Ok(data) })
        .start(&broker)
        .await
        .unwrap();
    let _second = Server::builder(SYS, APP)
        .app_id("S2")
        .handle("echo", |data: Value, _ctx| async move { Ok(data) })
        .start(&broker)
        .await
        .unwrap();
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    let mut served_by = HashSet::new();
    for i in 0..4 {
        let reply = caller.call("echo", &format!("m{}", i), json!(i)).await;
        served_by.insert(reply.envelope.app_id);
    }

    assert_eq!(
        served_by,
        HashSet::from(["S1".to_string(), "S2".to_string()])
    );
}

#[tokio::test]
async fn test_requests_queued_before_start_are_served() {
    let broker = broker();
    let channel = broker.open_channel(1, "setup").await.unwrap();
    channel
        .declare_queue(
            "sys_calc_server",
            synapse_rpc::server::SERVER_QUEUE_OPTIONS,
        )
        .await
        .unwrap();
    channel
        .bind_queue("sys_calc_server", SYS, "server.calc")
        .await
        .unwrap();
    let mut caller = Caller::new(&broker, "clientA", "A1").await;
    caller.send("echo", "early", json!("queued")).await;
    assert_eq!(broker.queue_depth("sys_calc_server"), Some(1));

    let _server = echo_server(&broker).await;

    let reply = caller.reply().await;
    assert_eq!(reply.envelope.correlation_id.as_deref(), Some("early"));
    assert_eq!(body(&reply), json!("queued"));
}

#[tokio::test]
async fn test_shutdown_after_in_flight_requests_finish() {
    let broker = broker();
    let server = echo_server(&broker).await;
    let mut caller = Caller::new(&broker, "clientA", "A1").await;

    caller.call("echo", "m1", json!(1)).await;
    wait_for_acks(&broker, 1).await;
    assert_eq!(server.in_flight(), 0);

    broker.close();
    tokio::time::timeout(TIMEOUT, server.wait_for_shutdown())
        .await
        .expect("server did not shut down")
        .unwrap();
}
