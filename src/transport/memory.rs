//! In-process durable broker
//!
//! `MemoryBroker` behaves like a small durable streaming cluster: every topic
//! keeps its full message log, durable subscriptions persist their cursor
//! under `(topic, owner, durable name)` across connections, and queue groups
//! share one cursor and split deliveries round-robin. A cursor only moves
//! past messages that were acknowledged, so whatever was still in flight when
//! a connection went away is delivered again. It also exposes fault
//! injection so reconnection behavior can be exercised without a network.

use super::{
    Connection, InboundMessage, OpenedConnection, SessionIdentity, SubscriptionHandle,
    SubscriptionOptions, Transport, TransportError, TransportEvent, TransportSubscription,
};
use crate::config::TransportSection;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Shared handle to an in-memory cluster; clones see the same state
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<Bytes>>,
    cursors: HashMap<CursorKey, DurableCursor>,
    subscribers: Vec<Subscriber>,
    connections: HashMap<u64, mpsc::UnboundedSender<TransportEvent>>,
    round_robin: HashMap<CursorKey, usize>,
    next_id: u64,
    opened: u64,
    refuse_next: u32,
    reject_publishes: u32,
    reject_unsubscribes: u32,
    offline: bool,
    stall: bool,
    /// Event streams of attempts that will never hear back
    stalled: Vec<mpsc::UnboundedSender<TransportEvent>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    topic: String,
    owner: String,
    durable: Option<String>,
}

/// Acknowledgment state of one durable cursor
#[derive(Debug, Default)]
struct DurableCursor {
    /// Lowest log index not yet acknowledged
    floor: usize,
    /// Acknowledged indices above `floor`
    acked: BTreeSet<usize>,
}

impl DurableCursor {
    fn starting_at(floor: usize) -> Self {
        Self {
            floor,
            acked: BTreeSet::new(),
        }
    }

    fn acknowledge(&mut self, index: usize) {
        if index < self.floor {
            return;
        }
        self.acked.insert(index);
        while self.acked.remove(&self.floor) {
            self.floor += 1;
        }
    }

    /// Indices still owed to the cursor's subscribers
    fn pending(&self, log_len: usize) -> Vec<usize> {
        (self.floor..log_len)
            .filter(|index| !self.acked.contains(index))
            .collect()
    }
}

enum Cursor {
    /// Position kept in `BrokerState::cursors`
    Shared(CursorKey),
    /// Non-durable exclusive subscriber, always caught up
    Private,
}

struct Subscriber {
    id: u64,
    connection_id: u64,
    topic: String,
    group: bool,
    cursor: Cursor,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

impl Subscriber {
    fn uses(&self, key: &CursorKey) -> bool {
        matches!(&self.cursor, Cursor::Shared(k) if k == key)
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_alive(&self, connection_id: u64) -> bool {
        self.connections.contains_key(&connection_id)
    }

    fn log_len(&self, topic: &str) -> usize {
        self.logs.get(topic).map_or(0, Vec::len)
    }

    /// Drop every subscriber owned by `connection_id`; durable cursors survive
    fn detach_connection(&mut self, connection_id: u64) {
        self.subscribers
            .retain(|subscriber| subscriber.connection_id != connection_id);
        self.forget_idle_ephemeral_cursors();
    }

    fn forget_idle_ephemeral_cursors(&mut self) {
        let subscribers = &self.subscribers;
        self.cursors
            .retain(|key, _| key.durable.is_some() || subscribers.iter().any(|s| s.uses(key)));
    }

    fn append(&mut self, topic: &str, payload: Bytes) {
        let log = self.logs.entry(topic.to_string()).or_default();
        log.push(payload.clone());
        let message = InboundMessage {
            sequence: (log.len() - 1) as u64,
            payload,
        };

        // Exclusive subscribers each get every message
        for subscriber in self
            .subscribers
            .iter()
            .filter(|s| s.topic == topic && !s.group)
        {
            let _ = subscriber.sender.send(message.clone());
        }

        // Queue groups get exactly one delivery per message
        let mut groups: Vec<CursorKey> = Vec::new();
        for subscriber in self.subscribers.iter().filter(|s| s.topic == topic && s.group) {
            if let Cursor::Shared(key) = &subscriber.cursor {
                if !groups.contains(key) {
                    groups.push(key.clone());
                }
            }
        }
        for key in groups {
            let members: Vec<usize> = self
                .subscribers
                .iter()
                .enumerate()
                .filter(|(_, s)| s.group && s.uses(&key) && !s.sender.is_closed())
                .map(|(index, _)| index)
                .collect();
            if members.is_empty() {
                continue;
            }
            let turn = self.round_robin.entry(key).or_insert(0);
            let chosen = members[*turn % members.len()];
            *turn = turn.wrapping_add(1);
            let _ = self.subscribers[chosen].sender.send(message.clone());
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_next_connections(&self, count: u32) {
        self.state().refuse_next = count;
    }

    /// Reject the next `count` publishes on otherwise healthy connections
    pub fn reject_next_publishes(&self, count: u32) {
        self.state().reject_publishes = count;
    }

    /// Fail the next `count` unsubscribe requests, leaving the subscriptions in place
    pub fn reject_next_unsubscribes(&self, count: u32) {
        self.state().reject_unsubscribes = count;
    }

    /// While offline every connection attempt fails
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// While stalled, new connection attempts never report an outcome
    pub fn stall_connections(&self, stall: bool) {
        self.state().stall = stall;
    }

    /// Sever every live connection, reporting `ConnectionLost` on each
    ///
    /// Returns the number of connections dropped.
    pub fn drop_connections(&self) -> usize {
        let mut state = self.state();
        let connections: Vec<_> = state.connections.drain().collect();
        for (connection_id, events) in &connections {
            state.detach_connection(*connection_id);
            let _ = events.send(TransportEvent::ConnectionLost(
                TransportError::ConnectionLost("connection dropped by cluster".to_string()),
            ));
        }
        debug!(count = connections.len(), "Dropped in-memory connections");
        connections.len()
    }

    /// Report a transport error on every live connection without dropping it
    pub fn inject_error(&self, message: &str) {
        let state = self.state();
        for events in state.connections.values() {
            let _ = events.send(TransportEvent::Error(TransportError::ConnectionFailed(
                message.to_string(),
            )));
        }
    }

    /// Total number of `open` calls seen
    pub fn opened_connections(&self) -> u64 {
        self.state().opened
    }

    pub fn active_connections(&self) -> usize {
        self.state().connections.len()
    }

    /// Number of active subscribers for `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state()
            .subscribers
            .iter()
            .filter(|s| s.topic == topic)
            .count()
    }

    /// Number of messages stored for `topic`
    pub fn message_count(&self, topic: &str) -> usize {
        self.state().log_len(topic)
    }
}

impl Transport for MemoryBroker {
    fn open(
        &self,
        identity: &SessionIdentity,
        _options: &TransportSection,
    ) -> Result<OpenedConnection, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.opened += 1;
        let connection_id = state.next_id();

        if state.offline || state.refuse_next > 0 {
            state.refuse_next = state.refuse_next.saturating_sub(1);
            let _ = events_tx.send(TransportEvent::Error(TransportError::ConnectionFailed(
                format!("cluster '{}' is unavailable", identity.cluster_id),
            )));
        } else if state.stall {
            state.stalled.push(events_tx);
        } else {
            let _ = events_tx.send(TransportEvent::Connected);
            state.connections.insert(connection_id, events_tx);
        }

        Ok(OpenedConnection {
            connection: Arc::new(MemoryConnection {
                id: connection_id,
                client_id: identity.client_id.clone(),
                broker: self.clone(),
            }),
            events: events_rx,
        })
    }
}

struct MemoryConnection {
    id: u64,
    client_id: String,
    broker: MemoryBroker,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn subscribe(
        &self,
        topic: &str,
        queue_group: Option<&str>,
        options: &SubscriptionOptions,
    ) -> Result<TransportSubscription, TransportError> {
        let mut state = self.broker.state();
        if !state.is_alive(self.id) {
            return Err(TransportError::SubscriptionFailed(
                "connection is not active".to_string(),
            ));
        }

        let log_len = state.log_len(topic);
        let default_start = if options.deliver_all_available { 0 } else { log_len };

        let (cursor, backlog): (Cursor, Vec<usize>) = match (queue_group, &options.durable_name) {
            (None, None) => (Cursor::Private, (default_start..log_len).collect()),
            (group, durable) => {
                let key = CursorKey {
                    topic: topic.to_string(),
                    owner: group.map_or_else(|| self.client_id.clone(), str::to_string),
                    durable: durable.clone(),
                };
                // Messages in flight to a live member stay with that member
                let shared_with_live = state.subscribers.iter().any(|s| s.uses(&key));
                let durable_cursor = state
                    .cursors
                    .entry(key.clone())
                    .or_insert_with(|| DurableCursor::starting_at(default_start));
                let backlog = if shared_with_live {
                    Vec::new()
                } else {
                    durable_cursor.pending(log_len)
                };
                (Cursor::Shared(key), backlog)
            }
        };

        let (sender, messages) = mpsc::unbounded_channel();
        if let Some(log) = state.logs.get(topic) {
            for index in backlog {
                let _ = sender.send(InboundMessage {
                    sequence: index as u64,
                    payload: log[index].clone(),
                });
            }
        }

        let acknowledges = match &cursor {
            Cursor::Shared(key) => Some(key.clone()),
            Cursor::Private => None,
        };
        let subscriber_id = state.next_id();
        state.subscribers.push(Subscriber {
            id: subscriber_id,
            connection_id: self.id,
            topic: topic.to_string(),
            group: queue_group.is_some(),
            cursor,
            sender,
        });

        Ok(TransportSubscription {
            messages,
            handle: Arc::new(MemorySubscriptionHandle {
                id: subscriber_id,
                cursor: acknowledges,
                broker: self.broker.clone(),
            }),
        })
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        if !state.is_alive(self.id) {
            return Err(TransportError::PublishFailed(
                "connection is not active".to_string(),
            ));
        }
        if state.reject_publishes > 0 {
            state.reject_publishes -= 1;
            return Err(TransportError::PublishFailed(format!(
                "cluster rejected message for {topic}"
            )));
        }
        state.append(topic, payload);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.broker.state();
        if let Some(events) = state.connections.remove(&self.id) {
            state.detach_connection(self.id);
            let _ = events.send(TransportEvent::Closed);
        }
    }
}

struct MemorySubscriptionHandle {
    id: u64,
    /// Cursor moved by acknowledgments; `None` for non-durable subscriptions
    cursor: Option<CursorKey>,
    broker: MemoryBroker,
}

#[async_trait]
impl SubscriptionHandle for MemorySubscriptionHandle {
    fn acknowledge(&self, sequence: u64) {
        let Some(key) = &self.cursor else {
            return;
        };
        // The cursor outlives the connection, so late acknowledgments still count
        if let Some(cursor) = self.broker.state().cursors.get_mut(key) {
            cursor.acknowledge(usize::try_from(sequence).unwrap_or(usize::MAX));
        }
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        let position = state
            .subscribers
            .iter()
            .position(|s| s.id == self.id)
            .ok_or_else(|| {
                TransportError::SubscriptionFailed("subscription is not active".to_string())
            })?;
        if state.reject_unsubscribes > 0 {
            state.reject_unsubscribes -= 1;
            return Err(TransportError::SubscriptionFailed(
                "cluster refused to unsubscribe".to_string(),
            ));
        }
        let subscriber = state.subscribers.remove(position);

        // Unsubscribing (unlike closing) releases the durable cursor once no
        // member is left on it.
        if let Cursor::Shared(key) = subscriber.cursor {
            if !state.subscribers.iter().any(|s| s.uses(&key)) {
                state.cursors.remove(&key);
                state.round_robin.remove(&key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(client_id: &str) -> SessionIdentity {
        SessionIdentity {
            cluster_id: "test-cluster".to_string(),
            client_id: client_id.to_string(),
        }
    }

    fn durable(name: &str) -> SubscriptionOptions {
        SubscriptionOptions {
            deliver_all_available: true,
            durable_name: Some(name.to_string()),
        }
    }

    fn connect(broker: &MemoryBroker, client_id: &str) -> Arc<dyn Connection> {
        broker
            .open(&identity(client_id), &TransportSection::default())
            .unwrap()
            .connection
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<InboundMessage>) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message.payload);
        }
        out
    }

    /// Drain and acknowledge everything currently buffered
    fn consume(subscription: &mut TransportSubscription) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(message) = subscription.messages.try_recv() {
            subscription.handle.acknowledge(message.sequence);
            out.push(message.payload);
        }
        out
    }

    #[test]
    fn test_cursor_floor_waits_for_gaps() {
        let mut cursor = DurableCursor::starting_at(0);
        cursor.acknowledge(1);
        assert_eq!(cursor.floor, 0);
        assert_eq!(cursor.pending(3), vec![0, 2]);

        cursor.acknowledge(0);
        assert_eq!(cursor.floor, 2);
        assert!(cursor.acked.is_empty());

        // Stale acknowledgments below the floor are ignored
        cursor.acknowledge(0);
        assert_eq!(cursor.pending(3), vec![2]);
    }

    #[tokio::test]
    async fn test_open_reports_connected() {
        let broker = MemoryBroker::new();
        let mut opened = broker
            .open(&identity("c1"), &TransportSection::default())
            .unwrap();

        assert_eq!(opened.events.recv().await, Some(TransportEvent::Connected));
        assert_eq!(broker.active_connections(), 1);
        assert_eq!(broker.opened_connections(), 1);
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        let broker = MemoryBroker::new();
        broker.refuse_next_connections(1);

        let mut refused = broker
            .open(&identity("c1"), &TransportSection::default())
            .unwrap();
        assert!(matches!(
            refused.events.recv().await,
            Some(TransportEvent::Error(_))
        ));
        assert!(refused
            .connection
            .publish("t", Bytes::from_static(b"x"))
            .await
            .is_err());

        let mut accepted = broker
            .open(&identity("c1"), &TransportSection::default())
            .unwrap();
        assert_eq!(accepted.events.recv().await, Some(TransportEvent::Connected));
    }

    #[tokio::test]
    async fn test_stalled_connection_reports_nothing() {
        let broker = MemoryBroker::new();
        broker.stall_connections(true);

        let mut stalled = broker
            .open(&identity("c1"), &TransportSection::default())
            .unwrap();
        assert!(matches!(
            stalled.events.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
        assert_eq!(broker.active_connections(), 0);

        broker.stall_connections(false);
        let mut accepted = broker
            .open(&identity("c1"), &TransportSection::default())
            .unwrap();
        assert_eq!(accepted.events.recv().await, Some(TransportEvent::Connected));
    }

    #[tokio::test]
    async fn test_replay_all_available_history() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker, "c1");

        connection.publish("t", Bytes::from_static(b"1")).await.unwrap();
        connection.publish("t", Bytes::from_static(b"2")).await.unwrap();

        let mut sub = connection.subscribe("t", None, &durable("t-durable")).await.unwrap();
        connection.publish("t", Bytes::from_static(b"3")).await.unwrap();

        assert_eq!(
            drain(&mut sub.messages),
            vec![
                Bytes::from_static(b"1"),
                Bytes::from_static(b"2"),
                Bytes::from_static(b"3")
            ]
        );
    }

    #[tokio::test]
    async fn test_non_replay_subscription_starts_at_end() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker, "c1");

        connection.publish("t", Bytes::from_static(b"old")).await.unwrap();
        let mut sub = connection
            .subscribe("t", None, &SubscriptionOptions::default())
            .await
            .unwrap();
        connection.publish("t", Bytes::from_static(b"new")).await.unwrap();

        assert_eq!(drain(&mut sub.messages), vec![Bytes::from_static(b"new")]);
    }

    #[tokio::test]
    async fn test_durable_cursor_survives_connection_loss() {
        let broker = MemoryBroker::new();
        let first = connect(&broker, "c1");
        let mut sub = first.subscribe("t", None, &durable("t-durable")).await.unwrap();
        first.publish("t", Bytes::from_static(b"seen")).await.unwrap();
        assert_eq!(consume(&mut sub).len(), 1);

        assert_eq!(broker.drop_connections(), 1);
        assert_eq!(broker.subscriber_count("t"), 0);

        // Published by someone else while we were away
        let other = connect(&broker, "c2");
        other.publish("t", Bytes::from_static(b"missed")).await.unwrap();

        let second = connect(&broker, "c1");
        let mut resumed = second.subscribe("t", None, &durable("t-durable")).await.unwrap();
        assert_eq!(
            drain(&mut resumed.messages),
            vec![Bytes::from_static(b"missed")]
        );
    }

    #[tokio::test]
    async fn test_unacknowledged_messages_are_redelivered_after_loss() {
        // Arrange
        let broker = MemoryBroker::new();
        let first = connect(&broker, "c1");
        let mut sub = first.subscribe("t", None, &durable("t-durable")).await.unwrap();
        for payload in [b"m1", b"m2", b"m3"] {
            first.publish("t", Bytes::from_static(payload)).await.unwrap();
        }

        // Act: only the first message is consumed before the connection drops
        let message = sub.messages.try_recv().unwrap();
        sub.handle.acknowledge(message.sequence);
        broker.drop_connections();

        let second = connect(&broker, "c1");
        let mut resumed = second.subscribe("t", None, &durable("t-durable")).await.unwrap();

        // Assert
        assert_eq!(
            drain(&mut resumed.messages),
            vec![Bytes::from_static(b"m2"), Bytes::from_static(b"m3")]
        );
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once_per_message() {
        let broker = MemoryBroker::new();
        let a = connect(&broker, "a");
        let b = connect(&broker, "b");

        let mut sub_a = a
            .subscribe("jobs", Some("jobs.workers"), &durable("jobs-durable"))
            .await
            .unwrap();
        let mut sub_b = b
            .subscribe("jobs", Some("jobs.workers"), &durable("jobs-durable"))
            .await
            .unwrap();

        for n in 0..4u8 {
            a.publish("jobs", Bytes::from(vec![n])).await.unwrap();
        }

        let got_a = drain(&mut sub_a.messages);
        let got_b = drain(&mut sub_b.messages);
        assert_eq!(got_a.len() + got_b.len(), 4);
        assert_eq!(got_a.len(), 2);
        assert_eq!(got_b.len(), 2);
    }

    #[tokio::test]
    async fn test_queue_group_skips_members_that_went_away() {
        let broker = MemoryBroker::new();
        let a = connect(&broker, "a");
        let b = connect(&broker, "b");
        let sub_a = a
            .subscribe("jobs", Some("jobs.workers"), &durable("jobs-durable"))
            .await
            .unwrap();
        let mut sub_b = b
            .subscribe("jobs", Some("jobs.workers"), &durable("jobs-durable"))
            .await
            .unwrap();
        drop(sub_a);

        for n in 0..3u8 {
            b.publish("jobs", Bytes::from(vec![n])).await.unwrap();
        }

        assert_eq!(drain(&mut sub_b.messages).len(), 3);
    }

    #[tokio::test]
    async fn test_exclusive_subscribers_each_receive_everything() {
        let broker = MemoryBroker::new();
        let a = connect(&broker, "a");
        let b = connect(&broker, "b");

        let mut sub_a = a.subscribe("news", None, &durable("news-durable")).await.unwrap();
        let mut sub_b = b.subscribe("news", None, &durable("news-durable")).await.unwrap();
        a.publish("news", Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(drain(&mut sub_a.messages).len(), 1);
        assert_eq!(drain(&mut sub_b.messages).len(), 1);
    }

    #[tokio::test]
    async fn test_close_reports_closed_and_blocks_publish() {
        let broker = MemoryBroker::new();
        let mut opened = broker
            .open(&identity("c1"), &TransportSection::default())
            .unwrap();
        assert_eq!(opened.events.recv().await, Some(TransportEvent::Connected));

        opened.connection.close().await;
        assert_eq!(opened.events.recv().await, Some(TransportEvent::Closed));
        assert_eq!(opened.events.recv().await, None);
        assert!(matches!(
            opened
                .connection
                .publish("t", Bytes::from_static(b"x"))
                .await,
            Err(TransportError::PublishFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_fails() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker, "c1");
        let sub = connection.subscribe("t", None, &durable("t-durable")).await.unwrap();

        assert!(sub.handle.unsubscribe().await.is_ok());
        assert_eq!(broker.subscriber_count("t"), 0);
        assert!(sub.handle.unsubscribe().await.is_err());
    }

    #[tokio::test]
    async fn test_rejected_publish_is_not_stored() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker, "c1");
        broker.reject_next_publishes(1);

        let rejected = connection.publish("t", Bytes::from_static(b"x")).await;
        assert!(matches!(rejected, Err(TransportError::PublishFailed(_))));
        assert_eq!(broker.message_count("t"), 0);

        connection.publish("t", Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(broker.message_count("t"), 1);
    }

    #[tokio::test]
    async fn test_rejected_unsubscribe_keeps_subscriber() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker, "c1");
        let sub = connection.subscribe("t", None, &durable("t-durable")).await.unwrap();
        broker.reject_next_unsubscribes(1);

        assert!(sub.handle.unsubscribe().await.is_err());
        assert_eq!(broker.subscriber_count("t"), 1);
        assert!(sub.handle.unsubscribe().await.is_ok());
    }
}
