//! Server configuration.
//!
//! [`ServerConfig`] can be built in code, through [`ServerBuilder`](crate::ServerBuilder),
//! or loaded from JSON. Every field has a default, so a document only needs
//! the names:
//!
//! ```
//! use synapse_rpc::config::{ServerConfig, TopologyPolicy};
//!
//! let config = ServerConfig::from_json_str(
//!     r#"{"sys_name": "shop", "app_name": "orders", "topology_policy": "fail_fast"}"#,
//! ).unwrap();
//!
//! assert_eq!(config.topology_policy, TopologyPolicy::FailFast);
//! assert_eq!(config.app_id.len(), 20);
//! ```

use serde::Deserialize;

use crate::error::{Result, RpcError};
use crate::ident::{random_string, MESSAGE_ID_LEN};
use crate::publisher::PublisherConfig;

/// Default maximum concurrent handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Default prefetch (QoS) for the server channel.
pub const DEFAULT_PREFETCH_COUNT: u16 = 20;

/// What to do when the inbound queue cannot be declared, bound or consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyPolicy {
    /// Log the failure and keep the server object alive. It will not
    /// receive requests.
    #[default]
    FailSoft,
    /// Return the failure from `Server::start`.
    FailFast,
}

/// Configuration for one RPC server instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// System name; also the topic exchange.
    pub sys_name: String,
    /// Application name requests are addressed to.
    pub app_name: String,
    /// Unique id of this instance.
    pub app_id: String,
    /// Log every request and reply at debug level.
    pub debug: bool,
    /// Maximum handlers running at once.
    pub max_concurrent_handlers: usize,
    /// Unacknowledged deliveries the broker may push to this server.
    pub prefetch_count: u16,
    /// Reaction to queue declare/bind/consume failures.
    pub topology_policy: TopologyPolicy,
    /// Reply publisher tuning.
    pub publisher: PublisherConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sys_name: String::new(),
            app_name: String::new(),
            app_id: random_string(MESSAGE_ID_LEN),
            debug: false,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            topology_policy: TopologyPolicy::default(),
            publisher: PublisherConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a configuration for `app` within `system`.
    pub fn new(system: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            sys_name: system.into(),
            app_name: app.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON document and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check names and limits.
    ///
    /// Names end up inside routing keys, so topic metacharacters are refused.
    pub fn validate(&self) -> Result<()> {
        check_name("sys_name", &self.sys_name)?;
        check_name("app_name", &self.app_name)?;
        check_name("app_id", &self.app_id)?;

        if self.max_concurrent_handlers == 0 {
            return Err(RpcError::Config(
                "max_concurrent_handlers must be at least 1".to_string(),
            ));
        }
        if u32::try_from(self.max_concurrent_handlers).is_err() {
            return Err(RpcError::Config(
                "max_concurrent_handlers must fit in 32 bits".to_string(),
            ));
        }
        if self.publisher.max_pending == 0 {
            return Err(RpcError::Config(
                "publisher.max_pending must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(RpcError::Config(format!("{} must not be empty", field)));
    }
    if value.contains(&['.', '*', '#'][..]) {
        return Err(RpcError::Config(format!(
            "{} '{}' must not contain '.', '*' or '#'",
            field, value
        )));
    }
    Ok(())
}
