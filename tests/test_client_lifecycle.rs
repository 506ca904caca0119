//! Connection lifecycle tests
//!
//! Drive the client against the in-memory broker and check the observable
//! lifecycle: readiness signals, reconnect scheduling, retry budgets and the
//! close/end notifications.

use resilient_pubsub::testing::wait_until;
use resilient_pubsub::transport::memory::MemoryBroker;
use resilient_pubsub::{
    ClientError, ClientEvent, ConnectionState, MaxReconnectAttempts, ReadinessSignal,
    StreamingClient,
};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

use test_helpers::{
    client_on, connected_client, next_event, wait_for_reconnect, STEP_TIMEOUT,
};

/// Readiness signal of the first attempt after `previous`
async fn next_attempt(client: &StreamingClient, previous: u64) -> ReadinessSignal {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    loop {
        let signal = client.connected();
        if signal.attempt() > previous {
            return signal;
        }
        assert!(tokio::time::Instant::now() < deadline, "no new attempt started");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn test_connected_is_idempotent_after_success() {
    // Arrange
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "idempotent").await;

    // Act
    let first = client.connected();
    let second = client.connected();

    // Assert
    assert!(first.await.is_ok());
    assert!(second.await.is_ok());
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(snapshot.generation, 1);
    assert_eq!(broker.opened_connections(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_initial_failure_rejects_signal_and_retries() {
    // Arrange
    let broker = MemoryBroker::new();
    broker.refuse_next_connections(1);
    let client = client_on(&broker, "initial-failure", MaxReconnectAttempts::Unbounded);

    // Act
    let first = client.connected();
    let first_attempt = first.attempt();
    let result = first.await;

    // Assert
    assert!(matches!(result, Err(ClientError::ConnectFailed(_))));
    let retry = next_attempt(&client, first_attempt).await;
    tokio::time::timeout(STEP_TIMEOUT, retry)
        .await
        .expect("retry should settle")
        .expect("retry should connect");
    assert_eq!(broker.opened_connections(), 2);
    assert_eq!(client.snapshot().await.unwrap().reconnect_attempts, 0);
}

#[tokio::test]
async fn test_reconnects_after_connection_lost() {
    // Arrange
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "reconnect").await;

    // Act
    assert_eq!(broker.drop_connections(), 1);

    // Assert
    wait_for_reconnect(&client, 1).await;
    assert_eq!(broker.opened_connections(), 2);
    assert_eq!(broker.active_connections(), 1);
    assert!(client.connected().await.is_ok());
}

#[tokio::test]
async fn test_post_connect_error_triggers_reconnect() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "post-connect-error").await;

    broker.inject_error("transient glitch");

    wait_for_reconnect(&client, 1).await;
    assert_eq!(broker.opened_connections(), 2);
    // The replaced connection is closed, not leaked
    assert!(wait_until(STEP_TIMEOUT, || broker.active_connections() == 1).await);
}

#[tokio::test]
async fn test_counter_resets_after_successful_reconnect() {
    // Arrange
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "counter-reset").await;

    // Act: two refused attempts, then success
    broker.refuse_next_connections(2);
    broker.drop_connections();
    wait_for_reconnect(&client, 1).await;

    // Assert
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(snapshot.generation, 4);
    assert_eq!(broker.opened_connections(), 4);

    // Act: the next outage starts counting from zero again
    broker.refuse_next_connections(1);
    broker.drop_connections();
    wait_for_reconnect(&client, 4).await;

    // Assert
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(broker.opened_connections(), 6);
}

#[tokio::test]
async fn test_bounded_retries_end_after_exact_budget() {
    // Arrange
    let broker = MemoryBroker::new();
    let client = client_on(&broker, "bounded", MaxReconnectAttempts::Bounded(2));
    client.connected().await.unwrap();
    let mut events = client.events();

    // Act
    broker.set_offline(true);
    broker.drop_connections();

    // Assert
    assert_eq!(next_event(&mut events).await, ClientEvent::End);
    assert_eq!(client.state(), ConnectionState::Ended);
    assert_eq!(broker.opened_connections(), 3);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.opened_connections(), 3, "no attempts after end");
}

#[tokio::test]
async fn test_zero_retry_budget_ends_on_first_loss() {
    let broker = MemoryBroker::new();
    let client = client_on(&broker, "zero-budget", MaxReconnectAttempts::Bounded(0));
    client.connected().await.unwrap();
    let mut events = client.events();

    broker.drop_connections();

    assert_eq!(next_event(&mut events).await, ClientEvent::End);
    assert_eq!(broker.opened_connections(), 1);
}

#[tokio::test]
async fn test_unbounded_retries_never_end() {
    // Arrange
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "unbounded").await;
    let mut events = client.events();

    // Act
    broker.set_offline(true);
    broker.drop_connections();

    // Assert
    assert!(wait_until(STEP_TIMEOUT, || broker.opened_connections() >= 20).await);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert!(!client.state().is_terminal());

    // The session recovers once the cluster is back
    broker.set_offline(false);
    let generation = client.snapshot().await.unwrap().generation;
    wait_for_reconnect(&client, generation.saturating_sub(1)).await;
    assert_eq!(client.snapshot().await.unwrap().reconnect_attempts, 0);
}

#[tokio::test]
async fn test_close_emits_close_notification() {
    // Arrange
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "close").await;
    let mut events = client.events();

    // Act
    client.close().await;

    // Assert
    assert_eq!(next_event(&mut events).await, ClientEvent::Close);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(broker.active_connections(), 0);
}

#[tokio::test]
async fn test_close_twice_is_a_noop() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "close-twice").await;
    let mut events = client.events();

    client.close().await;
    assert_eq!(next_event(&mut events).await, ClientEvent::Close);

    client.close().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_close_cancels_pending_reconnect() {
    // Arrange
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "close-pending").await;
    broker.set_offline(true);
    broker.drop_connections();
    assert!(wait_until(STEP_TIMEOUT, || client.state() != ConnectionState::Connected).await);

    // Act
    client.close().await;
    let opened = broker.opened_connections();
    broker.set_offline(false);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(broker.opened_connections(), opened);
    assert_eq!(broker.active_connections(), 0, "nothing reconnects after close");
}

#[tokio::test]
async fn test_operations_after_close() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "after-close").await;
    client.close().await;

    let publish = client.publish("t", "x").await;
    assert!(matches!(publish, Err(ClientError::NotConnected { .. })));

    let subscribe = client.subscribe("t", |_| {}).await;
    assert!(matches!(
        subscribe,
        Err(ClientError::NotConnected {
            state: ConnectionState::Closed
        })
    ));
}

#[tokio::test]
async fn test_dropping_client_closes_connection() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "dropped").await;
    assert_eq!(broker.active_connections(), 1);

    drop(client);

    assert!(wait_until(STEP_TIMEOUT, || broker.active_connections() == 0).await);
}

#[tokio::test]
async fn test_subscribe_while_disconnected_is_restored_on_connect() {
    // Arrange
    let broker = MemoryBroker::new();
    broker.set_offline(true);
    let client = client_on(&broker, "offline-subscribe", MaxReconnectAttempts::Unbounded);

    // Act
    client.subscribe("later", |_| {}).await.unwrap();
    broker.set_offline(false);

    // Assert
    assert!(wait_until(STEP_TIMEOUT, || broker.subscriber_count("later") == 1).await);
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.subscriptions.len(), 1);
    assert_eq!(snapshot.subscriptions[0].live_generation, Some(snapshot.generation));
}

#[tokio::test]
async fn test_close_abandons_attempt_still_connecting() {
    // Arrange
    let broker = MemoryBroker::new();
    broker.stall_connections(true);
    let client = client_on(&broker, "close-connecting", MaxReconnectAttempts::Unbounded);
    let waiting = client.connected();
    assert_eq!(client.state(), ConnectionState::Connecting);

    // Act
    client.close().await;

    // Assert
    let result = tokio::time::timeout(STEP_TIMEOUT, waiting)
        .await
        .expect("waiters should not hang after close");
    assert!(matches!(result, Err(ClientError::AttemptAbandoned)));
    assert!(matches!(
        client.connected().await,
        Err(ClientError::AttemptAbandoned)
    ));
    assert_eq!(client.state(), ConnectionState::Closed);
}
