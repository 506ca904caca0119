//! Connection state and transition logging

use std::fmt;
use tracing::{error, info, warn};

/// Lifecycle state of the logical session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state - a connection attempt is in flight
    Connecting,
    /// Session established and subscriptions restored
    Connected,
    /// Session lost; a reconnect is scheduled
    Disconnected(String),
    /// Reconnect attempt in flight (attempt count)
    Reconnecting(u32),
    /// Reconnect attempts exhausted - terminal
    Ended,
    /// Closed by the caller - terminal
    Closed,
}

impl ConnectionState {
    /// Terminal states never schedule further connection attempts
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Ended | ConnectionState::Closed)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Ended => write!(f, "ended"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Log a connection state transition
pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("Connected");
        }
        (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
            info!(attempt, "Reconnected");
        }
        (_, ConnectionState::Disconnected(reason)) => {
            warn!("Disconnected: {}", reason);
        }
        (_, ConnectionState::Ended) => {
            error!("No more reconnect attempts will be made");
        }
        (_, ConnectionState::Closed) => {
            info!("Connection closed");
        }
        _ => {
            tracing::debug!("Connection state: {} -> {}", from, to);
        }
    }
}
