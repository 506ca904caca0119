//! Subscription registry
//!
//! The registry is the source of truth for what must be subscribed. Each entry
//! pairs a reconnect-surviving [`SubscriptionIntent`] with the
//! [`LiveSubscription`] currently serving it, if any. Live subscriptions are
//! bound to the connection generation that created them and are thrown away
//! (never reused) when that connection goes away.

use crate::codec::{self, Payload};
use crate::transport::{
    Connection, InboundMessage, SubscriptionHandle, SubscriptionOptions, TransportError,
    TransportSubscription,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument};

/// Callback invoked once per delivered message
pub type MessageHandler = Arc<dyn Fn(Payload) + Send + Sync>;

/// How competing subscribers on the same topic share messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Every subscriber instance receives every message
    #[default]
    Exclusive,
    /// Subscribers on the topic form one queue group; each message goes to one member
    SharedQueue,
}

/// Reconnect-surviving record of "subscribe to this topic with this handler"
#[derive(Clone)]
pub struct SubscriptionIntent {
    pub topic: String,
    pub mode: DeliveryMode,
    handler: MessageHandler,
}

impl fmt::Debug for SubscriptionIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionIntent")
            .field("topic", &self.topic)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl SubscriptionIntent {
    pub fn new(topic: impl Into<String>, handler: MessageHandler, mode: DeliveryMode) -> Self {
        Self {
            topic: topic.into(),
            mode,
            handler,
        }
    }

    /// Durable name used so the transport can resume the cursor: `<topic>-durable`
    pub fn durable_name(&self) -> String {
        format!("{}-durable", self.topic)
    }

    /// Queue group for shared delivery: `<topic>.workers`
    pub fn queue_group(&self) -> Option<String> {
        match self.mode {
            DeliveryMode::SharedQueue => Some(format!("{}.workers", self.topic)),
            DeliveryMode::Exclusive => None,
        }
    }

    /// Always replay everything still available from the durable cursor
    pub fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            deliver_all_available: true,
            durable_name: Some(self.durable_name()),
        }
    }
}

/// Transport subscription bound to one connection generation
pub struct LiveSubscription {
    generation: u64,
    handle: Arc<dyn SubscriptionHandle>,
    delivery: JoinHandle<()>,
    /// Dropping this stops the delivery loop before its next message
    _stop: oneshot::Sender<()>,
}

impl LiveSubscription {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Tear the subscription down on the transport
    pub(crate) async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.handle.unsubscribe().await
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.delivery.abort();
    }
}

struct RegistryEntry {
    intent: SubscriptionIntent,
    live: Option<LiveSubscription>,
}

/// Status of one registered topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub topic: String,
    pub mode: DeliveryMode,
    /// Generation of the connection serving this topic, if attached
    pub live_generation: Option<u64>,
}

/// Result of a restoration pass
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: Vec<(String, TransportError)>,
}

/// Insertion-ordered registry of subscription intents
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Vec<RegistryEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.position(topic).is_some()
    }

    /// Registered topics in insertion order
    pub fn topics(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.intent.topic.clone()).collect()
    }

    /// Number of topics currently attached to a live subscription
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.live.is_some()).count()
    }

    pub fn statuses(&self) -> Vec<SubscriptionStatus> {
        self.entries
            .iter()
            .map(|entry| SubscriptionStatus {
                topic: entry.intent.topic.clone(),
                mode: entry.intent.mode,
                live_generation: entry.live.as_ref().map(LiveSubscription::generation),
            })
            .collect()
    }

    fn position(&self, topic: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.intent.topic == topic)
    }

    /// Record `intent`, replacing any previous intent for the same topic
    ///
    /// A live subscription that served the previous intent is handed back so
    /// the caller can tear it down on the connection it belongs to. A new
    /// topic is appended; a replaced one keeps its position.
    pub fn register(&mut self, intent: SubscriptionIntent) -> Option<LiveSubscription> {
        match self.position(&intent.topic) {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.intent = intent;
                entry.live.take()
            }
            None => {
                self.entries.push(RegistryEntry { intent, live: None });
                None
            }
        }
    }

    /// Create a live subscription for `topic` on `connection`
    pub async fn attach(
        &mut self,
        topic: &str,
        connection: &dyn Connection,
        generation: u64,
    ) -> Result<(), TransportError> {
        let index = self.position(topic).ok_or_else(|| {
            TransportError::SubscriptionFailed(format!("no intent registered for {topic}"))
        })?;
        let entry = &mut self.entries[index];
        // Whatever was attached before belongs to an older connection
        entry.live = None;

        let intent = &entry.intent;
        let queue_group = intent.queue_group();
        let subscription = connection
            .subscribe(
                &intent.topic,
                queue_group.as_deref(),
                &intent.subscription_options(),
            )
            .await?;

        entry.live = Some(spawn_live(intent, subscription, generation));
        info!(topic = %intent.topic, mode = ?intent.mode, generation, "Subscribed to {}", intent.topic);
        Ok(())
    }

    /// Tear down the live subscription for `topic` and remove its intent
    ///
    /// Fails without touching the registry when the topic is unknown, has no
    /// live subscription, or the transport refuses the unsubscribe.
    pub async fn unsubscribe(&mut self, topic: &str) -> Result<(), UnsubscribeError> {
        let index = self.position(topic).ok_or(UnsubscribeError::NotSubscribed)?;
        let live = self.entries[index]
            .live
            .as_ref()
            .ok_or(UnsubscribeError::NotSubscribed)?;

        live.unsubscribe().await.map_err(UnsubscribeError::Transport)?;
        self.entries.remove(index);
        info!(topic, "Unsubscribed from {}", topic);
        Ok(())
    }

    /// Drop every live subscription without contacting the transport
    ///
    /// Used when the connection that created them is gone; intents stay.
    pub fn detach_all(&mut self) -> usize {
        let mut detached = 0;
        for entry in &mut self.entries {
            if entry.live.take().is_some() {
                detached += 1;
            }
        }
        detached
    }

    /// Re-attach every registered intent to `connection`, in insertion order
    ///
    /// Intents are never dropped by this pass; a topic that fails to attach
    /// stays registered and is retried on the next restoration.
    pub async fn restore_all(&mut self, connection: &dyn Connection, generation: u64) -> RestoreReport {
        self.detach_all();

        let mut report = RestoreReport::default();
        for topic in self.topics() {
            match self.attach(&topic, connection, generation).await {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    error!(topic = %topic, "Failed to restore subscription: {}", e);
                    report.failed.push((topic, e));
                }
            }
        }
        report
    }
}

/// Why an unsubscribe request failed
#[derive(Debug)]
pub enum UnsubscribeError {
    NotSubscribed,
    Transport(TransportError),
}

fn spawn_live(
    intent: &SubscriptionIntent,
    subscription: TransportSubscription,
    generation: u64,
) -> LiveSubscription {
    let TransportSubscription { messages, handle } = subscription;
    let (stop, stopped) = oneshot::channel();
    let delivery = tokio::spawn(
        deliver(
            intent.topic.clone(),
            intent.handler.clone(),
            messages,
            handle.clone(),
            stopped,
        )
        .instrument(
            tracing::debug_span!("delivery", topic = %intent.topic, generation),
        ),
    );
    LiveSubscription {
        generation,
        handle,
        delivery,
        _stop: stop,
    }
}

/// Delivery loop: decode each message, hand it to the handler, then acknowledge it
///
/// A message is acknowledged only once the handler has returned (or panicked),
/// so anything still buffered when the subscription is dropped stays
/// unacknowledged and is redelivered on the next connection.
async fn deliver(
    topic: String,
    handler: MessageHandler,
    mut messages: mpsc::UnboundedReceiver<InboundMessage>,
    handle: Arc<dyn SubscriptionHandle>,
    mut stopped: oneshot::Receiver<()>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = &mut stopped => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        debug!("[<< {} <<] {}", topic, codec::display_lossy(&message.payload));
        let payload = codec::decode(&message.payload);
        if panic::catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
            error!(topic = %topic, "Message handler panicked; continuing with next message");
        }
        handle.acknowledge(message.sequence);
    }
    debug!(topic = %topic, "Delivery stream ended");
}
