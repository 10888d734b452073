//! Broker naming conventions for the RPC protocol.
//!
//! The system name doubles as the topic exchange for both directions:
//!
//! | Item                | Format                              |
//! |---------------------|-------------------------------------|
//! | inbound queue       | `{system}_{app}_server`             |
//! | inbound binding key | `server.{app}`                      |
//! | consumer tag        | `{system}.{app}.server.{instanceId}`|
//! | reply routing key   | `client.{replyTo}.{appId}`          |
//!
//! # Example
//!
//! ```
//! use synapse_rpc::topology;
//!
//! assert_eq!(topology::server_queue_name("shop", "orders"), "shop_orders_server");
//! assert_eq!(topology::reply_routing_key("web", "Xy12"), "client.web.Xy12");
//! assert!(topology::topic_matches("server.*", "server.orders"));
//! ```

/// Name of an application's durable inbound RPC queue.
pub fn server_queue_name(system: &str, app: &str) -> String {
    format!("{}_{}_server", system, app)
}

/// Binding key routing requests for `app` into its inbound queue.
pub fn server_routing_key(app: &str) -> String {
    format!("server.{}", app)
}

/// Consumer tag identifying one server instance.
pub fn consumer_tag(system: &str, app: &str, instance_id: &str) -> String {
    format!("{}.{}.server.{}", system, app, instance_id)
}

/// Routing key for a reply to the given request sender.
pub fn reply_routing_key(reply_to: &str, app_id: &str) -> String {
    format!("client.{}.{}", reply_to, app_id)
}

/// Topic-exchange pattern match.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) if word == "*" || word == k => match_words(rest, key_rest),
            _ => false,
        },
    }
}
