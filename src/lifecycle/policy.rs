//! Reconnection policy: fixed delay, bounded or unbounded attempts
//!
//! The policy is a pure decision; the supervisor owns the counter and applies
//! the outcome.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Maximum number of reconnect attempts after a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxReconnectAttempts {
    /// Retry forever
    #[default]
    Unbounded,
    /// Give up after this many consecutive failed attempts
    Bounded(u32),
}

impl fmt::Display for MaxReconnectAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxReconnectAttempts::Unbounded => write!(f, "∞"),
            MaxReconnectAttempts::Bounded(max) => write!(f, "{max}"),
        }
    }
}

impl From<i64> for MaxReconnectAttempts {
    /// Negative values mean unbounded; anything above `u32::MAX` saturates
    fn from(value: i64) -> Self {
        if value < 0 {
            MaxReconnectAttempts::Unbounded
        } else {
            MaxReconnectAttempts::Bounded(u32::try_from(value).unwrap_or(u32::MAX))
        }
    }
}

impl Serialize for MaxReconnectAttempts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MaxReconnectAttempts::Unbounded => serializer.serialize_i64(-1),
            MaxReconnectAttempts::Bounded(max) => serializer.serialize_i64(i64::from(*max)),
        }
    }
}

impl<'de> Deserialize<'de> for MaxReconnectAttempts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(i64::deserialize(deserializer)?.into())
    }
}

/// Outcome of consulting the policy before a reconnect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry,
    Exhausted,
}

/// Fixed-delay reconnection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: MaxReconnectAttempts,
    /// Delay between a failure and the next attempt
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MaxReconnectAttempts::Unbounded,
            delay: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    /// Decide whether attempt number `attempt` (1-based) may run (pure function)
    pub fn decide(&self, attempt: u32) -> ReconnectDecision {
        match self.max_attempts {
            MaxReconnectAttempts::Unbounded => ReconnectDecision::Retry,
            MaxReconnectAttempts::Bounded(max) if attempt <= max => ReconnectDecision::Retry,
            MaxReconnectAttempts::Bounded(_) => ReconnectDecision::Exhausted,
        }
    }
}
