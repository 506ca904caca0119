//! Resilient publish/subscribe client
//!
//! A client facade over a durable streaming transport that keeps one logical
//! session alive across transport failures.
//!
//! # Overview
//!
//! - Connection lifecycle with fixed-delay, optionally bounded reconnects
//! - Per-attempt readiness signal callers can await
//! - Subscription registry that is replayed onto every new connection
//! - Durable, replay-all-available subscriptions with optional queue groups
//! - Transparent JSON encoding with raw-bytes fallback
//! - In-memory durable broker and an MQTT v5 transport
//!
//! # Quick Start
//!
//! ```rust
//! use resilient_pubsub::config::ClientConfig;
//! use resilient_pubsub::transport::memory::MemoryBroker;
//! use resilient_pubsub::{Payload, StreamingClient};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let broker = MemoryBroker::new();
//! let client = StreamingClient::new(&ClientConfig::default(), Arc::new(broker));
//! client.connected().await?;
//!
//! client
//!     .subscribe("orders", |message: Payload| {
//!         if let Some(document) = message.as_document() {
//!             println!("order {}", document["id"]);
//!         }
//!     })
//!     .await?;
//! client.publish("orders", json!({"id": 42})).await?;
//!
//! client.close().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod testing;
pub mod transport;

pub use client::StreamingClient;
pub use codec::Payload;
pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, ClientResult};
pub use lifecycle::{
    ClientEvent, ConnectionState, DeliveryMode, MaxReconnectAttempts, ReadinessSignal,
    SessionSnapshot,
};
pub use transport::{SessionIdentity, Transport, TransportError};
