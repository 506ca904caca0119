//! Streaming client facade
//!
//! [`StreamingClient`] is the only type most callers touch. It forwards
//! subscription changes to the lifecycle supervisor, publishes directly on the
//! current connection handle, and exposes the readiness signal plus the
//! `Close`/`End` notifications.

use crate::codec::{self, Payload};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::lifecycle::supervisor::{Command, Supervisor, SupervisorHandle};
use crate::lifecycle::{
    ClientEvent, ConnectionState, DeliveryMode, MessageHandler, ReadinessSignal, SessionSnapshot,
    SubscriptionIntent,
};
use crate::transport::mqtt::MqttTransport;
use crate::transport::{Connection, SessionIdentity, Transport};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

/// Resilient publish/subscribe client
///
/// Creating a client immediately starts the first connection attempt. The
/// session is kept alive across transport failures until [`close`] is called,
/// the reconnect budget runs out, or the client is dropped.
///
/// [`close`]: StreamingClient::close
pub struct StreamingClient {
    identity: SessionIdentity,
    commands: mpsc::UnboundedSender<Command>,
    readiness: watch::Receiver<ReadinessSignal>,
    connection: watch::Receiver<Option<Arc<dyn Connection>>>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
}

impl StreamingClient {
    /// Create a client over `transport` and start connecting
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let identity = config.session_identity();
        let SupervisorHandle {
            commands,
            readiness,
            connection,
            state,
            events,
        } = Supervisor::spawn(
            identity.clone(),
            config.transport.clone(),
            config.reconnect_policy(),
            transport,
        );

        Self {
            identity,
            commands,
            readiness,
            connection,
            state,
            events,
        }
    }

    /// Create a client that talks MQTT v5 to the broker in `config.transport.url`
    pub fn mqtt(config: &ClientConfig) -> Self {
        Self::new(config, Arc::new(MqttTransport::new()))
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Readiness signal of the current connection attempt
    ///
    /// The signal settles once. After a rejection, call this again to get
    /// the signal of the next attempt.
    pub fn connected(&self) -> ReadinessSignal {
        self.readiness.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every lifecycle state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to `Close` and `End` notifications
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Subscribe with exclusive delivery: this client sees every message
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> ClientResult<()>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.subscribe_with(topic, handler, DeliveryMode::Exclusive)
            .await
    }

    /// Subscribe with an explicit delivery mode
    ///
    /// A second subscription on the same topic replaces the first. The
    /// subscription survives reconnects.
    pub async fn subscribe_with<F>(
        &self,
        topic: &str,
        handler: F,
        mode: DeliveryMode,
    ) -> ClientResult<()>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);
        let intent = SubscriptionIntent::new(topic, handler, mode);
        self.request(|reply| Command::Subscribe { intent, reply })
            .await?
    }

    /// Subscribe and receive decoded messages on a channel instead of a callback
    pub async fn subscribe_channel(
        &self,
        topic: &str,
        mode: DeliveryMode,
    ) -> ClientResult<mpsc::UnboundedReceiver<Payload>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe_with(
            topic,
            move |payload| {
                let _ = tx.send(payload);
            },
            mode,
        )
        .await?;
        Ok(rx)
    }

    /// Remove the subscription for `topic`
    pub async fn unsubscribe(&self, topic: &str) -> ClientResult<()> {
        let topic = topic.to_string();
        self.request(|reply| Command::Unsubscribe { topic, reply })
            .await?
    }

    /// Publish on the current connection; resolves on transport acknowledgment
    pub async fn publish(&self, topic: &str, payload: impl Into<Payload>) -> ClientResult<()> {
        let connection = self.connection.borrow().clone();
        let Some(connection) = connection else {
            return Err(ClientError::NotConnected {
                state: self.state(),
            });
        };

        let bytes = codec::encode(&payload.into());
        debug!("[>> {} >>] {}", topic, codec::display_lossy(&bytes));
        connection
            .publish(topic, bytes)
            .await
            .map_err(|e| ClientError::publish_failed(topic, e))
    }

    /// Close the session
    ///
    /// Pending reconnects are cancelled. Closing an already closed client
    /// only logs a warning.
    pub async fn close(&self) {
        if self.request(|reply| Command::Close { reply }).await.is_err() {
            debug!("Supervisor already stopped; nothing to close");
        }
    }

    /// Current state, handle generation, reconnect counter and subscriptions
    pub async fn snapshot(&self) -> ClientResult<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> ClientResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ClientError::SessionTerminated)?;
        response.await.map_err(|_| ClientError::SessionTerminated)
    }
}
