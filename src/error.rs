//! Error types surfaced to callers of the streaming client
//!
//! Connection-level failures are never raised from arbitrary calls: they
//! reach callers through the readiness signal and the `close`/`end`
//! notifications. Only per-call failures (`publish`, `subscribe`,
//! `unsubscribe`) are returned directly from the call that caused them.

use crate::lifecycle::ConnectionState;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect: {0}")]
    ConnectFailed(#[source] TransportError),

    #[error("Connection attempt was superseded before it completed")]
    AttemptAbandoned,

    #[error("No subscribers for {topic}")]
    NotSubscribed { topic: String },

    #[error("Failed to publish to {topic}")]
    PublishFailed {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to subscribe to {topic}")]
    SubscribeFailed {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to unsubscribe from {topic}")]
    UnsubscribeFailed {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },

    #[error("Client session has terminated")]
    SessionTerminated,
}

impl ClientError {
    pub fn not_subscribed<S: Into<String>>(topic: S) -> Self {
        Self::NotSubscribed {
            topic: topic.into(),
        }
    }

    pub fn publish_failed<S: Into<String>>(topic: S, source: TransportError) -> Self {
        Self::PublishFailed {
            topic: topic.into(),
            source,
        }
    }

    pub fn subscribe_failed<S: Into<String>>(topic: S, source: TransportError) -> Self {
        Self::SubscribeFailed {
            topic: topic.into(),
            source,
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
