//! MQTT v5 connection handle and event loop pump
//!
//! Each `open` creates a fresh `AsyncClient`/`EventLoop` pair. A pump task
//! polls the event loop, fans incoming publishes out to subscription routes
//! and reports lifecycle events to the supervisor. The pump stops at the
//! first connection error: recovery is the supervisor's job, which opens a
//! brand new connection rather than letting rumqttc redial underneath it.
//!
//! Publishes resolve on the broker's PubAck, not when rumqttc queues them.
//! Requests reach the wire in the order they were handed to the client, so
//! each outgoing publish is paired with the oldest waiting publisher and
//! settled when the acknowledgment for its packet id comes back.

use super::message_handler::{route_mqtt_event, EventRoute};
use super::options::{configure_mqtt_options, topic_filter, topic_matches};
use crate::config::TransportSection;
use crate::transport::{
    Connection, InboundMessage, OpenedConnection, SessionIdentity, SubscriptionHandle,
    SubscriptionOptions, Transport, TransportError, TransportEvent, TransportSubscription,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Capacity of the request channel between `AsyncClient` and `EventLoop`
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Time given to the event loop to flush the DISCONNECT packet on close
const DISCONNECT_FLUSH: Duration = Duration::from_millis(250);

/// Transport factory for MQTT v5 brokers
#[derive(Debug, Default, Clone)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for MqttTransport {
    fn open(
        &self,
        identity: &SessionIdentity,
        options: &TransportSection,
    ) -> Result<OpenedConnection, TransportError> {
        let mqtt_options = configure_mqtt_options(identity, options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let routes = Routes::default();
        let acks = PendingAcks::default();

        let pump = tokio::spawn(pump_events(
            event_loop,
            events_tx.clone(),
            routes.clone(),
            acks.clone(),
            shutdown_rx,
            options.connect_timeout(),
        ));
        debug!(url = %options.url, "Opened MQTT connection");

        Ok(OpenedConnection {
            connection: Arc::new(MqttConnection {
                client,
                routes,
                acks,
                publish_order: tokio::sync::Mutex::new(()),
                events: events_tx,
                shutdown: shutdown_tx,
                pump: Mutex::new(Some(pump)),
                closed: AtomicBool::new(false),
            }),
            events: events_rx,
        })
    }
}

struct Route {
    id: u64,
    filter: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

/// Subscription routes shared between the connection and its pump
#[derive(Clone, Default)]
struct Routes {
    inner: Arc<Mutex<Vec<Route>>>,
    next_id: Arc<AtomicU64>,
    next_sequence: Arc<AtomicU64>,
}

impl Routes {
    fn lock(&self) -> MutexGuard<'_, Vec<Route>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, filter: &str) -> (u64, mpsc::UnboundedReceiver<InboundMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, messages) = mpsc::unbounded_channel();
        self.lock().push(Route {
            id,
            filter: filter.to_string(),
            sender,
        });
        (id, messages)
    }

    fn remove(&self, id: u64) {
        self.lock().retain(|route| route.id != id);
    }

    /// Hand `payload` to every route whose filter matches `topic`
    fn dispatch(&self, topic: &str, payload: &Bytes) -> usize {
        let message = InboundMessage {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            payload: payload.clone(),
        };
        let mut routes = self.lock();
        // Receivers dropped by detached subscriptions are pruned here
        routes.retain(|route| !route.sender.is_closed());
        routes
            .iter()
            .filter(|route| topic_matches(&route.filter, topic))
            .filter(|route| route.sender.send(message.clone()).is_ok())
            .count()
    }
}

type AckSender = oneshot::Sender<Result<(), String>>;

#[derive(Default)]
struct AckState {
    /// Publishers whose request has not reached the wire yet, oldest first
    queued: VecDeque<AckSender>,
    /// Publishers waiting for a PubAck, by packet id
    in_flight: HashMap<u16, VecDeque<AckSender>>,
    /// Packet ids whose next `Outgoing::Publish` is a deferred resend already bound
    collided: HashSet<u16>,
    /// Set once the pump has stopped; nothing will be acknowledged after it
    ended: Option<String>,
}

/// Publishers waiting for broker acknowledgment, shared with the pump
#[derive(Clone, Default)]
struct PendingAcks {
    inner: Arc<Mutex<AckState>>,
}

impl PendingAcks {
    fn lock(&self) -> MutexGuard<'_, AckState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a publisher whose request is about to be handed to the client
    fn enqueue(&self) -> Result<oneshot::Receiver<Result<(), String>>, String> {
        let mut state = self.lock();
        if let Some(reason) = &state.ended {
            return Err(reason.clone());
        }
        let (tx, rx) = oneshot::channel();
        state.queued.push_back(tx);
        Ok(rx)
    }

    /// Forget the most recent publisher; its request never reached the client
    fn withdraw_last(&self) {
        self.lock().queued.pop_back();
    }

    fn bind(state: &mut AckState, packet_id: u16) {
        if let Some(tx) = state.queued.pop_front() {
            state.in_flight.entry(packet_id).or_default().push_back(tx);
        }
    }

    fn sent(&self, packet_id: u16) {
        let mut state = self.lock();
        if !state.collided.remove(&packet_id) {
            Self::bind(&mut state, packet_id);
        }
    }

    fn deferred(&self, packet_id: u16) {
        let mut state = self.lock();
        Self::bind(&mut state, packet_id);
        state.collided.insert(packet_id);
    }

    fn settle(&self, packet_id: u16, result: Result<(), String>) {
        let mut state = self.lock();
        let Some(waiting) = state.in_flight.get_mut(&packet_id) else {
            debug!(packet_id, "PubAck without a waiting publisher");
            return;
        };
        let tx = waiting.pop_front();
        if waiting.is_empty() {
            state.in_flight.remove(&packet_id);
        }
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }

    /// Fail every waiting publisher and refuse new ones
    fn fail_all(&self, reason: &str) {
        let mut state = self.lock();
        state.ended = Some(reason.to_string());
        state.collided.clear();
        let queued = std::mem::take(&mut state.queued);
        let in_flight = std::mem::take(&mut state.in_flight);
        for tx in queued.into_iter().chain(in_flight.into_values().flatten()) {
            let _ = tx.send(Err(reason.to_string()));
        }
    }
}

struct MqttConnection {
    client: AsyncClient,
    routes: Routes,
    acks: PendingAcks,
    /// Keeps ack registration and request submission in the same order
    publish_order: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MqttConnection {
    async fn subscribe(
        &self,
        topic: &str,
        queue_group: Option<&str>,
        options: &SubscriptionOptions,
    ) -> Result<TransportSubscription, TransportError> {
        let filter = topic_filter(topic, queue_group);
        debug!(
            topic,
            filter = %filter,
            durable = ?options.durable_name,
            "Subscribing on persistent session"
        );

        // Routes match on the plain topic; shared subscriptions deliver with it too
        let (id, messages) = self.routes.add(topic);
        if let Err(e) = self.client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            self.routes.remove(id);
            return Err(TransportError::SubscriptionFailed(format!(
                "Failed to subscribe to {filter}: {e}"
            )));
        }

        Ok(TransportSubscription {
            messages,
            handle: Arc::new(MqttSubscriptionHandle {
                client: self.client.clone(),
                routes: self.routes.clone(),
                id,
                filter,
            }),
        })
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let acknowledged = {
            let _order = self.publish_order.lock().await;
            let acknowledged = self
                .acks
                .enqueue()
                .map_err(|reason| TransportError::PublishFailed(format!("{topic}: {reason}")))?;
            if let Err(e) = self
                .client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                self.acks.withdraw_last();
                return Err(TransportError::PublishFailed(format!("{topic}: {e}")));
            }
            acknowledged
        };

        match acknowledged.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(TransportError::PublishFailed(format!("{topic}: {reason}"))),
            Err(_) => Err(TransportError::PublishFailed(format!(
                "{topic}: connection dropped before acknowledgment"
            ))),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect request not delivered: {}", e);
        }
        self.shutdown.send_replace(true);

        let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!("MQTT pump task ended abnormally: {}", e);
            }
        }
        let _ = self.events.send(TransportEvent::Closed);
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        // Cannot disconnect gracefully here; just stop polling
        let pump = self.pump.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pump) = pump {
            pump.abort();
        }
    }
}

struct MqttSubscriptionHandle {
    client: AsyncClient,
    routes: Routes,
    id: u64,
    filter: String,
}

#[async_trait]
impl SubscriptionHandle for MqttSubscriptionHandle {
    // rumqttc acknowledges QoS 1 deliveries itself
    fn acknowledge(&self, _sequence: u64) {}

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.routes.remove(self.id);
        self.client
            .unsubscribe(self.filter.clone())
            .await
            .map_err(|e| {
                TransportError::SubscriptionFailed(format!(
                    "Failed to unsubscribe from {}: {e}",
                    self.filter
                ))
            })
    }
}

/// Poll the event loop until shutdown or the first connection error
///
/// Publishers still waiting for an acknowledgment when the pump stops are
/// failed, since this connection will never deliver their PubAck.
async fn pump_events(
    event_loop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    routes: Routes,
    acks: PendingAcks,
    shutdown: watch::Receiver<bool>,
    connect_timeout: Duration,
) {
    let reason = poll_until_stopped(
        event_loop,
        &events,
        &routes,
        &acks,
        shutdown,
        connect_timeout,
    )
    .await;
    acks.fail_all(&reason);
}

/// Returns why polling stopped
async fn poll_until_stopped(
    mut event_loop: EventLoop,
    events: &mpsc::UnboundedSender<TransportEvent>,
    routes: &Routes,
    acks: &PendingAcks,
    mut shutdown: watch::Receiver<bool>,
    connect_timeout: Duration,
) -> String {
    let deadline = Instant::now() + connect_timeout;
    let mut connected = false;

    loop {
        let polled = tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                let _ = tokio::time::timeout(DISCONNECT_FLUSH, event_loop.poll()).await;
                debug!("MQTT pump stopped");
                return "connection closed".to_string();
            }
            _ = tokio::time::sleep_until(deadline), if !connected => {
                let message = format!("no ConnAck within {}ms", connect_timeout.as_millis());
                let _ = events.send(TransportEvent::Error(TransportError::ConnectionFailed(
                    message.clone(),
                )));
                return message;
            }
            polled = event_loop.poll() => polled,
        };

        let event = match polled {
            Ok(event) => event,
            Err(e) => {
                let reason = e.to_string();
                let reported = if connected {
                    TransportEvent::ConnectionLost(TransportError::ConnectionLost(reason.clone()))
                } else {
                    TransportEvent::Error(TransportError::ConnectionFailed(reason.clone()))
                };
                let _ = events.send(reported);
                return reason;
            }
        };

        match route_mqtt_event(&event) {
            EventRoute::ConnectionAcknowledged => {
                if !connected {
                    connected = true;
                    let _ = events.send(TransportEvent::Connected);
                }
            }
            EventRoute::MessageReceived { topic, payload } => {
                if routes.dispatch(&topic, &payload) == 0 {
                    debug!(topic = %topic, "No route for incoming message");
                }
            }
            EventRoute::Disconnected(reason) => {
                let reason = format!("broker disconnected: {reason}");
                let _ = events.send(TransportEvent::ConnectionLost(
                    TransportError::ConnectionLost(reason.clone()),
                ));
                return reason;
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                rejected,
            } => {
                if rejected > 0 {
                    error!(packet_id, rejected, "Broker rejected subscription");
                } else {
                    debug!(packet_id, "Subscription confirmed");
                }
            }
            EventRoute::PublishSent { packet_id } => acks.sent(packet_id),
            EventRoute::PublishDeferred { packet_id } => {
                debug!(packet_id, "Publish waiting for packet id to free up");
                acks.deferred(packet_id);
            }
            EventRoute::PublishAcknowledged {
                packet_id,
                rejection,
            } => match rejection {
                None => acks.settle(packet_id, Ok(())),
                Some(reason) => {
                    warn!(packet_id, reason = %reason, "Broker rejected publish");
                    acks.settle(packet_id, Err(format!("broker rejected publish: {reason}")));
                }
            },
            EventRoute::InfrastructureEvent(description) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", description);
            }
            EventRoute::OutgoingEvent => {}
        }
    }
}
