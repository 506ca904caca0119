//! MQTT v5 transport
//!
//! Maps the durable streaming model onto an MQTT v5 broker:
//!
//! - the session client id is the MQTT client id, with `clean_start = false`
//!   and a session expiry so the broker keeps subscriptions and queued
//!   messages across reconnects,
//! - shared-queue subscriptions become `$share/<topic>.workers/<topic>`,
//! - keep-alive is derived from the ping interval and tolerated missed pings.
//!
//! The module separates pure functions from I/O:
//!
//! - [`options`] - option, URL and topic filter construction
//! - [`message_handler`] - event loop event classification
//! - [`connection`] - the connection handle and its event loop pump
//!
//! # Usage
//!
//! ```rust,no_run
//! use resilient_pubsub::config::ClientConfig;
//! use resilient_pubsub::StreamingClient;
//!
//! # tokio_test::block_on(async {
//! let mut config = ClientConfig::default();
//! config.transport.url = "mqtt://localhost:1883".to_string();
//!
//! let client = StreamingClient::mqtt(&config);
//! client.connected().await?;
//! client.publish("orders", "hello").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod message_handler;
pub mod options;

pub use connection::MqttTransport;
pub use message_handler::{route_mqtt_event, EventRoute};
pub use options::{configure_mqtt_options, topic_filter};
