//! Server builder and runtime loop.
//!
//! The [`ServerBuilder`] provides a fluent API for configuring handlers
//! and building the server. [`ServerBuilder::start`] then:
//! 1. Opens a channel with the configured prefetch
//! 2. Declares and binds `{system}_{app}_server`
//! 3. Spawns the reply publisher task
//! 4. Registers the consumer and spawns the consume loop
//!
//! # Example
//!
//! ```ignore
//! use synapse_rpc::{MemoryBroker, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!     broker.declare_exchange("shop");
//!
//!     let server = Server::builder("shop", "orders")
//!         .handle("echo", |data: serde_json::Value, _ctx| async move { Ok(data) })
//!         .start(&broker)
//!         .await?;
//!
//!     server.wait_for_shutdown().await?;
//!     Ok(())
//! }
//! ```

mod binding;
mod dispatcher;
mod reply;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

use crate::broker::{ConsumeOptions, Connection};
use crate::config::{ServerConfig, TopologyPolicy};
use crate::error::{Result, RpcError};
use crate::handler::{Handler, HandlerRegistry, RequestContext};
use crate::ident::{IdGenerator, RandomIdGenerator};
use crate::publisher::spawn_publisher_task;
use crate::topology::consumer_tag;

pub use binding::{bind_server_queue, SERVER_QUEUE_OPTIONS};
pub use reply::ReplyPublisher;

use dispatcher::Dispatcher;

/// Channel purpose label used when opening the server channel.
pub const SERVER_CHANNEL_PURPOSE: &str = "RpcServer";

/// Builder for configuring and starting an RPC server.
pub struct ServerBuilder {
    config: ServerConfig,
    registry: HandlerRegistry,
    ids: Arc<dyn IdGenerator>,
}

impl ServerBuilder {
    /// Create a builder for `app` within `system`.
    pub fn new(system: impl Into<String>, app: impl Into<String>) -> Self {
        Self::from_config(ServerConfig::new(system, app))
    }

    /// Create a builder from a loaded configuration.
    pub fn from_config(config: ServerConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            ids: Arc::new(RandomIdGenerator),
        }
    }

    /// Register a method handler.
    ///
    /// The handler receives the request body converted to `T` and returns
    /// a value that becomes the reply body.
    pub fn handle<F, T, R, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.registry.register(method, handler);
        self
    }

    /// Register a pre-built handler object.
    pub fn handler(mut self, method: &str, handler: Arc<dyn Handler>) -> Self {
        self.registry.register_handler(method, handler);
        self
    }

    /// Set the instance id. Defaults to a random 20-character id.
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.config.app_id = app_id.into();
        self
    }

    /// Log every request and reply at debug level.
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Set the maximum number of concurrent handlers.
    ///
    /// When this limit is reached, intake pauses until a handler finishes.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the broker prefetch (QoS) for the server channel.
    ///
    /// Default: 20
    pub fn prefetch_count(mut self, prefetch: u16) -> Self {
        self.config.prefetch_count = prefetch;
        self
    }

    /// Choose how queue declare/bind/consume failures are handled.
    ///
    /// Default: [`TopologyPolicy::FailSoft`]
    pub fn topology_policy(mut self, policy: TopologyPolicy) -> Self {
        self.config.topology_policy = policy;
        self
    }

    /// Set the maximum replies waiting to be published.
    ///
    /// Default: 1024
    pub fn max_pending_replies(mut self, limit: usize) -> Self {
        self.config.publisher.max_pending = limit;
        self
    }

    /// Set how long a reply waits for publish backpressure to clear.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.publisher.backpressure_timeout_ms =
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Replace the generator used for reply message ids.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Current configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build and start the server on `connection`.
    ///
    /// # Errors
    ///
    /// Invalid configuration and channel-open failures are always returned.
    /// Topology failures are returned only under [`TopologyPolicy::FailFast`].
    pub async fn start<C>(self, connection: &C) -> Result<Server>
    where
        C: Connection + ?Sized,
    {
        Server::start(self.config, self.registry, self.ids, connection).await
    }
}

/// A running RPC server.
///
/// Use `wait_for_shutdown()` to block until the delivery stream closes.
pub struct Server {
    config: ServerConfig,
    registry: Arc<HandlerRegistry>,
    queue_name: String,
    consumer_tag: String,
    semaphore: Arc<Semaphore>,
    consuming: bool,
    /// Fires once the consume loop has drained.
    shutdown_rx: oneshot::Receiver<()>,
    /// Held while no consume loop runs, so shutdown never fires.
    _idle_tx: Option<oneshot::Sender<()>>,
    _publisher_task: JoinHandle<()>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder(system: impl Into<String>, app: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(system, app)
    }

    async fn start<C>(
        config: ServerConfig,
        registry: HandlerRegistry,
        ids: Arc<dyn IdGenerator>,
        connection: &C,
    ) -> Result<Self>
    where
        C: Connection + ?Sized,
    {
        config.validate()?;
        let limit = u32::try_from(config.max_concurrent_handlers)
            .map_err(|_| RpcError::Config("max_concurrent_handlers too large".to_string()))?;

        // 1. Channel
        let channel = connection
            .open_channel(config.prefetch_count, SERVER_CHANNEL_PURPOSE)
            .await?;

        // 2. Inbound queue
        let queue_name = match bind_server_queue(
            channel.as_ref(),
            &config.sys_name,
            &config.app_name,
        )
        .await
        {
            Ok(queue) => queue,
            Err(e) if config.topology_policy == TopologyPolicy::FailFast => return Err(e),
            Err(_) => crate::topology::server_queue_name(&config.sys_name, &config.app_name),
        };

        // 3. Reply publisher
        let (publisher, publisher_task) =
            spawn_publisher_task(channel.clone(), config.publisher.clone());
        let replies = ReplyPublisher::new(
            config.sys_name.clone(),
            config.app_id.clone(),
            config.app_name.clone(),
            ids,
            publisher,
        );

        // 4. Consumer
        let consumer_tag = consumer_tag(&config.sys_name, &config.app_name, &config.app_id);
        let options = ConsumeOptions {
            auto_ack: false,
            exclusive: false,
            no_local: false,
        };
        let registry = Arc::new(registry);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_handlers));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let (consuming, idle_tx) = match channel.consume(&queue_name, &consumer_tag, options).await
        {
            Ok(deliveries) => {
                let dispatcher = Arc::new(Dispatcher::new(
                    registry.clone(),
                    channel,
                    replies,
                    &config.app_name,
                    config.debug,
                ));
                let loop_semaphore = semaphore.clone();

                tokio::spawn(async move {
                    dispatcher.run(deliveries, loop_semaphore, limit).await;
                    let _ = shutdown_tx.send(());
                });
                (true, None)
            }
            Err(e) => {
                tracing::error!(
                    "Failed to register RPC server consumer {} on {}: {}",
                    consumer_tag,
                    queue_name,
                    e
                );
                if config.topology_policy == TopologyPolicy::FailFast {
                    return Err(RpcError::Topology(format!("consume {}: {}", queue_name, e)));
                }
                (false, Some(shutdown_tx))
            }
        };

        tracing::debug!(
            "RPC server {} listening on {} as {} ({} methods)",
            config.app_name,
            queue_name,
            consumer_tag,
            registry.len()
        );

        Ok(Server {
            config,
            registry,
            queue_name,
            consumer_tag,
            semaphore,
            consuming,
            shutdown_rx,
            _idle_tx: idle_tx,
            _publisher_task: publisher_task,
        })
    }

    /// Name of the inbound queue.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Consumer tag of this instance.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Instance id stamped on replies.
    pub fn app_id(&self) -> &str {
        &self.config.app_id
    }

    /// Application name stamped on replies.
    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        self.registry.methods()
    }

    /// Whether the consume loop was started.
    ///
    /// `false` means the consumer could not be registered and the server,
    /// under the fail-soft policy, is up but deaf.
    pub fn is_consuming(&self) -> bool {
        self.consuming
    }

    /// Requests currently being handled.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent_handlers - self.semaphore.available_permits()
    }

    /// Wait until the delivery stream closes and in-flight requests finish.
    ///
    /// A server that is not consuming never shuts down on its own.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        let _ = self.shutdown_rx.await;
        Ok(())
    }
}
