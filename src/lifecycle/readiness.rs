//! Per-attempt readiness signal
//!
//! Each connection attempt gets its own signal. It resolves once when the
//! attempt connects, or rejects once when it fails; later events for the same
//! attempt cannot change the outcome. Callers that saw a rejection must ask
//! the client for the next attempt's signal.

use crate::error::{ClientError, ClientResult};
use crate::transport::TransportError;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use tokio::sync::watch;

/// Outcome of one connection attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Pending,
    Connected,
    Failed(TransportError),
}

/// Awaitable outcome of a single connection attempt
#[derive(Debug, Clone)]
pub struct ReadinessSignal {
    attempt: u64,
    outcome: watch::Receiver<AttemptOutcome>,
}

/// Write side of a [`ReadinessSignal`], held by the supervisor
#[derive(Debug)]
pub(crate) struct ReadinessResolver {
    outcome: watch::Sender<AttemptOutcome>,
}

impl ReadinessSignal {
    /// Create the signal for attempt number `attempt`
    pub(crate) fn channel(attempt: u64) -> (ReadinessResolver, ReadinessSignal) {
        let (tx, rx) = watch::channel(AttemptOutcome::Pending);
        (
            ReadinessResolver { outcome: tx },
            ReadinessSignal {
                attempt,
                outcome: rx,
            },
        )
    }

    /// Sequence number of the attempt this signal belongs to
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Current outcome without waiting
    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome.borrow().clone()
    }

    /// Wait for the attempt to connect or fail
    pub async fn wait(mut self) -> ClientResult<()> {
        let outcome = self
            .outcome
            .wait_for(|outcome| !matches!(outcome, AttemptOutcome::Pending))
            .await
            .map_err(|_| ClientError::AttemptAbandoned)?
            .clone();

        match outcome {
            AttemptOutcome::Connected => Ok(()),
            AttemptOutcome::Failed(error) => Err(ClientError::ConnectFailed(error)),
            AttemptOutcome::Pending => Err(ClientError::AttemptAbandoned),
        }
    }
}

impl IntoFuture for ReadinessSignal {
    type Output = ClientResult<()>;
    type IntoFuture = Pin<Box<dyn Future<Output = ClientResult<()>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl ReadinessResolver {
    /// Resolve successfully; returns false if the attempt was already settled
    pub(crate) fn resolve(&self) -> bool {
        self.settle(AttemptOutcome::Connected)
    }

    /// Reject with `error`; returns false if the attempt was already settled
    pub(crate) fn reject(&self, error: TransportError) -> bool {
        self.settle(AttemptOutcome::Failed(error))
    }

    fn settle(&self, outcome: AttemptOutcome) -> bool {
        self.outcome.send_if_modified(|current| {
            if matches!(current, AttemptOutcome::Pending) {
                *current = outcome;
                true
            } else {
                false
            }
        })
    }
}
