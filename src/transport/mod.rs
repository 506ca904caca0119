//! Transport abstraction for durable publish/subscribe sessions
//!
//! The lifecycle supervisor only ever talks to a transport through these
//! traits, which keeps the reconnection logic independent of the wire
//! protocol and lets tests swap in the in-memory broker.
//!
//! A transport hands out one [`Connection`] per `open` call together with the
//! receiving end of that connection's lifecycle event channel. A connection
//! is never reused after it reports loss or closure; the supervisor opens a
//! fresh one instead.

use crate::config::TransportSection;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod mqtt;

/// Identity presented on every (re)connect; fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    pub cluster_id: String,
    pub client_id: String,
}

/// Lifecycle events reported by a connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The session is established and ready for operations
    Connected,
    /// Transport-level failure (before or after the session was established)
    Error(TransportError),
    /// The session was lost and will not recover on this connection
    ConnectionLost(TransportError),
    /// The connection finished closing
    Closed,
}

/// Errors reported by transport implementations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("Invalid transport URL: {0}")]
    InvalidUrl(String),
    #[error("Connection closed")]
    Closed,
}

/// Per-subscription options understood by durable transports
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    /// Replay every message still held for the topic, not only new ones
    pub deliver_all_available: bool,
    /// Name under which the transport persists the delivery cursor
    pub durable_name: Option<String>,
}

/// A freshly opened connection and its event stream
pub struct OpenedConnection {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// One message handed to a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Position used to acknowledge the message back to the transport
    pub sequence: u64,
    pub payload: Bytes,
}

/// A transport-level subscription: message stream plus its handle
pub struct TransportSubscription {
    pub messages: mpsc::UnboundedReceiver<InboundMessage>,
    pub handle: Arc<dyn SubscriptionHandle>,
}

/// Factory for connections (the transport library entry point)
pub trait Transport: Send + Sync + 'static {
    /// Open a new connection for `identity`
    ///
    /// Establishment is asynchronous: success or failure is reported on the
    /// returned event stream. An `Err` here means the connection could not
    /// even be attempted (for example a malformed broker URL).
    fn open(
        &self,
        identity: &SessionIdentity,
        options: &TransportSection,
    ) -> Result<OpenedConnection, TransportError>;
}

/// A live transport session
#[async_trait]
pub trait Connection: Send + Sync {
    /// Create a subscription, optionally as a member of `queue_group`
    async fn subscribe(
        &self,
        topic: &str,
        queue_group: Option<&str>,
        options: &SubscriptionOptions,
    ) -> Result<TransportSubscription, TransportError>;

    /// Publish bytes; resolves once the transport acknowledges the message
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Start closing; completion is reported as [`TransportEvent::Closed`]
    async fn close(&self);
}

/// Handle used to acknowledge deliveries and tear a transport subscription down
#[async_trait]
pub trait SubscriptionHandle: Send + Sync {
    /// Mark message `sequence` as consumed
    ///
    /// Durable transports only move the subscription's cursor past messages
    /// that were acknowledged; anything unacknowledged when the connection
    /// goes away is delivered again to the next subscription on the cursor.
    fn acknowledge(&self, sequence: u64);

    async fn unsubscribe(&self) -> Result<(), TransportError>;
}
