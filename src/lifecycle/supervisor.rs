//! Connection lifecycle supervisor
//!
//! The supervisor is the single control flow that owns the connection handle,
//! the subscription registry, the reconnect counter and the current attempt's
//! readiness resolver. It reacts to three inputs:
//!
//! - commands from the client facade,
//! - lifecycle events from the current connection (events from replaced
//!   connections are never seen: their receivers are dropped on replacement),
//! - reconnect timer ticks.
//!
//! State transitions:
//!
//! ```text
//! Connecting --connected--> Connected --lost/error--> Disconnected
//!     |                                                   |
//!     +--error--> (delay) --> Reconnecting(n) <--(delay)--+
//!                                  |   |
//!                     connected <--+   +--> Ended (attempts exhausted)
//!
//! any non-terminal state --close()--> Closed
//! ```

use super::policy::{ReconnectDecision, ReconnectPolicy};
use super::readiness::{ReadinessResolver, ReadinessSignal};
use super::registry::{
    SubscriptionIntent, SubscriptionRegistry, SubscriptionStatus, UnsubscribeError,
};
use super::state::{log_state_transition, ConnectionState};
use crate::config::TransportSection;
use crate::error::{ClientError, ClientResult};
use crate::transport::{Connection, SessionIdentity, Transport, TransportError, TransportEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn, Instrument};

/// Notifications emitted to observers of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The transport finished closing the current connection
    Close,
    /// Reconnect attempts are exhausted; the session is abandoned
    End,
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    /// Generation of the current connection handle (one per connect attempt)
    pub generation: u64,
    /// Reconnect attempts since the last successful connection
    pub reconnect_attempts: u32,
    pub subscriptions: Vec<SubscriptionStatus>,
}

pub(crate) enum Command {
    Subscribe {
        intent: SubscriptionIntent,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Channels the facade keeps to talk to and observe the supervisor
pub(crate) struct SupervisorHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub readiness: watch::Receiver<ReadinessSignal>,
    pub connection: watch::Receiver<Option<Arc<dyn Connection>>>,
    pub state: watch::Receiver<ConnectionState>,
    pub events: broadcast::Sender<ClientEvent>,
}

const EVENT_CHANNEL_CAPACITY: usize = 16;

pub(crate) struct Supervisor {
    identity: SessionIdentity,
    options: TransportSection,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    registry: SubscriptionRegistry,

    connection: Option<Arc<dyn Connection>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    generation: u64,
    attempt_connected: bool,
    resolver: Option<ReadinessResolver>,
    reconnect_attempts: u32,
    reconnect_pending: bool,

    commands: mpsc::UnboundedReceiver<Command>,
    timer_tx: mpsc::UnboundedSender<()>,
    timer_rx: mpsc::UnboundedReceiver<()>,
    readiness_tx: watch::Sender<ReadinessSignal>,
    connection_tx: watch::Sender<Option<Arc<dyn Connection>>>,
    state_tx: watch::Sender<ConnectionState>,
    notify_tx: broadcast::Sender<ClientEvent>,
}

impl Supervisor {
    /// Start the first connection attempt and spawn the supervisor task
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn(
        identity: SessionIdentity,
        options: TransportSection,
        policy: ReconnectPolicy,
        transport: Arc<dyn Transport>,
    ) -> SupervisorHandle {
        let span = tracing::info_span!(
            "streaming_client",
            cluster_id = %identity.cluster_id,
            client_id = %identity.client_id
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        // Placeholder for attempt 0; replaced by `connect` before anyone can see it
        let (_, placeholder) = ReadinessSignal::channel(0);
        let (readiness_tx, readiness_rx) = watch::channel(placeholder);
        let (connection_tx, connection_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (notify_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut supervisor = Supervisor {
            identity,
            options,
            transport,
            policy,
            registry: SubscriptionRegistry::new(),
            connection: None,
            events: None,
            generation: 0,
            attempt_connected: false,
            resolver: None,
            reconnect_attempts: 0,
            reconnect_pending: false,
            commands: commands_rx,
            timer_tx,
            timer_rx,
            readiness_tx,
            connection_tx,
            state_tx,
            notify_tx: notify_tx.clone(),
        };

        {
            let _entered = span.enter();
            supervisor.connect();
        }
        tokio::spawn(supervisor.run().instrument(span));

        SupervisorHandle {
            commands: commands_tx,
            readiness: readiness_rx,
            connection: connection_rx,
            state: state_rx,
            events: notify_tx,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(()) = self.timer_rx.recv() => self.reconnect(),
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_event(event).await,
                    None => self.events = None,
                },
            }
        }
        debug!("Supervisor stopped");
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let current = self.state();
        if current != next {
            log_state_transition(&current, &next);
            self.state_tx.send_replace(next);
        }
    }

    /// Open a new connection handle with a fresh readiness signal
    ///
    /// The previous handle (if any) is retired, never reused, and its live
    /// subscriptions are dropped without contacting the transport. The new
    /// handle is shared with publishers only once it reports `Connected`.
    fn connect(&mut self) {
        self.registry.detach_all();
        self.retire_connection();

        self.generation += 1;
        self.attempt_connected = false;
        let (resolver, signal) = ReadinessSignal::channel(self.generation);
        // Dropping the previous resolver abandons a still-pending attempt
        self.resolver = Some(resolver);
        self.readiness_tx.send_replace(signal);

        match self.transport.open(&self.identity, &self.options) {
            Ok(opened) => {
                debug!(generation = self.generation, "Opened connection");
                self.connection = Some(opened.connection);
                self.events = Some(opened.events);
            }
            Err(e) => self.on_error(e),
        }
    }

    fn retire_connection(&mut self) {
        self.events = None;
        self.connection_tx.send_replace(None);
        if let Some(stale) = self.connection.take() {
            tokio::spawn(async move { stale.close().await }.in_current_span());
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected().await,
            TransportEvent::Error(e) => self.on_error(e),
            TransportEvent::ConnectionLost(e) => self.on_connection_lost(e),
            TransportEvent::Closed => self.on_closed(),
        }
    }

    async fn on_connected(&mut self) {
        if self.attempt_connected {
            debug!("Ignoring repeated connect event for the same attempt");
            return;
        }
        if self.state().is_terminal() {
            return;
        }
        let Some(connection) = self.connection.clone() else {
            return;
        };

        self.attempt_connected = true;
        self.reconnect_attempts = 0;
        self.connection_tx.send_replace(Some(connection.clone()));
        if let Some(resolver) = &self.resolver {
            resolver.resolve();
        }
        self.set_state(ConnectionState::Connected);

        let report = self
            .registry
            .restore_all(connection.as_ref(), self.generation)
            .await;
        if report.restored > 0 || !report.failed.is_empty() {
            info!(
                restored = report.restored,
                failed = report.failed.len(),
                "Restored subscriptions"
            );
        }
    }

    fn on_error(&mut self, error: TransportError) {
        if self.state().is_terminal() {
            debug!("Ignoring transport error after session ended: {}", error);
            return;
        }

        if self.attempt_connected {
            // Post-connect errors still re-establish the session
            error!("Error: {}", error);
        } else {
            error!("Failed to connect: {}", error);
            if let Some(resolver) = &self.resolver {
                resolver.reject(error);
            }
        }
        self.schedule_reconnect();
    }

    fn on_connection_lost(&mut self, error: TransportError) {
        if self.state().is_terminal() {
            return;
        }

        if !self.attempt_connected {
            if let Some(resolver) = &self.resolver {
                resolver.reject(error.clone());
            }
        }
        self.registry.detach_all();
        self.connection_tx.send_replace(None);
        self.set_state(ConnectionState::Disconnected(error.to_string()));
        self.schedule_reconnect();
    }

    fn on_closed(&mut self) {
        debug!("Transport reported close");
        self.registry.detach_all();
        self.connection = None;
        self.connection_tx.send_replace(None);
        if !self.state().is_terminal() {
            self.set_state(ConnectionState::Closed);
        }
        let _ = self.notify_tx.send(ClientEvent::Close);
    }

    /// Arrange for `reconnect` to run after the configured delay
    ///
    /// At most one reconnect is pending at a time; further triggers while
    /// one is pending are coalesced.
    fn schedule_reconnect(&mut self) {
        if self.reconnect_pending {
            debug!("Reconnect already scheduled");
            return;
        }
        self.reconnect_pending = true;

        let timer = self.timer_tx.clone();
        let delay = self.policy.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer.send(());
        });
    }

    fn reconnect(&mut self) {
        self.reconnect_pending = false;

        let state = self.state();
        if state.is_terminal() {
            debug!("Dropping scheduled reconnect: session is {}", state);
            return;
        }

        let attempt = self.reconnect_attempts.saturating_add(1);
        match self.policy.decide(attempt) {
            ReconnectDecision::Retry => {
                self.reconnect_attempts = attempt;
                info!("Reconnecting ({}/{})", attempt, self.policy.max_attempts);
                self.set_state(ConnectionState::Reconnecting(attempt));
                self.connect();
            }
            ReconnectDecision::Exhausted => {
                self.registry.detach_all();
                self.retire_connection();
                self.set_state(ConnectionState::Ended);
                let _ = self.notify_tx.send(ClientEvent::End);
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { intent, reply } => {
                let _ = reply.send(self.subscribe(intent).await);
            }
            Command::Unsubscribe { topic, reply } => {
                let _ = reply.send(self.unsubscribe(&topic).await);
            }
            Command::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn subscribe(&mut self, intent: SubscriptionIntent) -> ClientResult<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(ClientError::NotConnected { state });
        }

        let topic = intent.topic.clone();
        if let Some(previous) = self.registry.register(intent) {
            // Still bound to the current connection: detach_all runs on every replacement
            if let Err(e) = previous.unsubscribe().await {
                warn!(topic = %topic, "Failed to release previous subscription: {}", e);
            }
        }

        match self.connection.clone() {
            Some(connection) if self.attempt_connected => self
                .registry
                .attach(&topic, connection.as_ref(), self.generation)
                .await
                .map_err(|e| ClientError::subscribe_failed(&topic, e)),
            _ => {
                debug!(topic = %topic, "Not connected; subscription will be restored on connect");
                Ok(())
            }
        }
    }

    async fn unsubscribe(&mut self, topic: &str) -> ClientResult<()> {
        self.registry
            .unsubscribe(topic)
            .await
            .map_err(|e| match e {
                UnsubscribeError::NotSubscribed => ClientError::not_subscribed(topic),
                UnsubscribeError::Transport(source) => ClientError::UnsubscribeFailed {
                    topic: topic.to_string(),
                    source,
                },
            })
    }

    async fn close(&mut self) {
        // Waiters on an attempt that never settled see it abandoned
        self.resolver = None;
        match self.connection.take() {
            Some(connection) => {
                self.registry.detach_all();
                self.connection_tx.send_replace(None);
                self.set_state(ConnectionState::Closed);
                // Completion arrives as a Closed event on the still-open event stream
                connection.close().await;
            }
            None => {
                warn!("Seems to be already closed");
                if !self.state().is_terminal() {
                    self.set_state(ConnectionState::Closed);
                }
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state(),
            generation: self.generation,
            reconnect_attempts: self.reconnect_attempts,
            subscriptions: self.registry.statuses(),
        }
    }

    async fn shutdown(&mut self) {
        self.registry.detach_all();
        if let Some(connection) = self.connection.take() {
            debug!("Client dropped; closing connection");
            connection.close().await;
        }
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
