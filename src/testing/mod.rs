//! Testing utilities
//!
//! Helpers for exercising the client against the in-memory broker without
//! an external broker.

use crate::codec::Payload;
use crate::config::ClientConfig;
use crate::lifecycle::MaxReconnectAttempts;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Message handler that records every payload it receives
#[derive(Clone, Default)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<Payload>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler closure feeding this recorder
    pub fn handler(&self) -> impl Fn(Payload) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |payload| {
            seen.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(payload)
        }
    }

    /// Payloads received so far, in delivery order
    pub fn messages(&self) -> Vec<Payload> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` messages arrived; false on timeout
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.len() >= count).await
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Client configuration with a short reconnect delay for fast tests
pub fn fast_config(client_id: &str, max_reconnect_attempts: MaxReconnectAttempts) -> ClientConfig {
    ClientConfig {
        client_id: Some(client_id.to_string()),
        reconnect_delay_ms: 5,
        max_reconnect_attempts,
        ..ClientConfig::default()
    }
}
