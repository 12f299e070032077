mod common;

use std::time::Duration;

use common::{connect, wait_until};
use ridemesh::{RetryPolicy, RideMeshError, Topology};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn publish_survives_broker_restart() {
    let (broker, client) = connect(Topology::default()).await;

    client.publish("hello", "ping").await.unwrap();
    assert_eq!(broker.peek("hello"), vec![b"ping".to_vec()]);

    broker.kill();

    let err = client.publish("hello", "during outage").await.unwrap_err();
    assert!(
        matches!(err, RideMeshError::RetriesExhausted { attempts: 3, .. }),
        "unexpected error: {err}"
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    broker.restore();

    let budget = RetryPolicy::connection().total_delay();
    assert!(wait_until(budget, || client.is_connected()).await);

    client.publish("hello", "pong").await.unwrap();
    assert_eq!(broker.peek("hello"), vec![b"pong".to_vec()]);

    let stats = client.stats();
    assert_eq!(stats.generation, 2);
    assert_eq!(stats.reconnects, 1);
    assert!(stats.last_reconnect_at.is_some());
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn recovers_from_repeated_drops() {
    let (broker, client) = connect(Topology::default()).await;

    for round in 1..=4u64 {
        broker.kill();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        broker.restore();

        assert!(wait_until(RetryPolicy::connection().total_delay(), || {
            client.stats().generation == round + 1 && client.is_connected()
        })
        .await);
        client.publish("hello", format!("round {round}")).await.unwrap();
    }

    // Re-declaration never duplicates the queue.
    assert_eq!(broker.queue_names(), vec!["hello".to_string()]);
    assert_eq!(client.stats().reconnects, 4);
    assert_eq!(broker.open_connections(), 1);
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn failed_channel_open_during_reconnect_discards_the_connection() {
    let (broker, client) = connect(Topology::default()).await;

    broker.kill();
    // The broker accepts the next two dials but refuses their channels.
    broker.fail_next_channel_opens(2);
    broker.restore();

    assert!(wait_until(RetryPolicy::connection().total_delay(), || client.is_connected()).await);

    // Both half-built connections were closed; only the installed one is left.
    assert_eq!(broker.open_connections(), 1);
    let stats = client.stats();
    assert_eq!(stats.generation, 2);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(broker.connect_attempts(), 4);

    client.publish("hello", "on the third connection").await.unwrap();
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_keeps_trying_after_exhausting_attempts() {
    let (broker, client) = connect(Topology::default()).await;

    broker.kill();
    // Past the whole connection policy, into the cooldown.
    let policy = RetryPolicy::connection();
    tokio::time::sleep(policy.total_delay() + Duration::from_secs(1)).await;
    assert!(broker.connect_attempts() > u64::from(policy.max_attempts));
    assert!(!client.is_connected());

    broker.restore();
    assert!(wait_until(policy.total_delay() + Duration::from_secs(10), || client.is_connected()).await);
    client.publish("hello", "back").await.unwrap();
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn channel_is_reopened_on_live_connection() {
    let (broker, client) = connect(Topology::default()).await;

    broker.break_channels();
    assert!(wait_until(Duration::from_secs(5), || client.stats().channel_epoch == 2).await);

    client.publish("hello", "after channel error").await.unwrap();
    let stats = client.stats();
    assert_eq!(stats.generation, 1, "connection must not be replaced");
    assert_eq!(stats.reconnects, 0);
    assert_eq!(broker.connect_attempts(), 1);
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_publishes_during_channel_recreation() {
    let (broker, client) = connect(Topology::default()).await;

    // Reopening succeeds on the third attempt, after 1s + 2s of backoff.
    broker.fail_next_channel_opens(2);
    broker.break_channels();

    let mut publishers = Vec::new();
    for i in 0..16u64 {
        let client = client.clone();
        publishers.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250 * i)).await;
            client.publish("hello", format!("msg-{i}")).await
        }));
    }

    let results = tokio::time::timeout(Duration::from_secs(30), async {
        let mut results = Vec::new();
        for publisher in publishers {
            results.push(publisher.await.unwrap());
        }
        results
    })
    .await
    .expect("no publisher may deadlock");

    let mut succeeded = 0;
    for result in &results {
        match result {
            Ok(()) => succeeded += 1,
            Err(RideMeshError::RetriesExhausted { .. }) => {}
            Err(other) => panic!("unexpected publish error: {other}"),
        }
    }
    assert!(succeeded > 0);
    assert_eq!(broker.queue_depth("hello"), Some(succeeded));
    assert_eq!(client.stats().generation, 1);
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_channel_retries_wait_for_connection_recovery() {
    let (broker, client) = connect(Topology::default()).await;

    let channel_policy = RetryPolicy::channel();
    broker.fail_next_channel_opens(channel_policy.max_attempts);
    broker.break_channels();

    tokio::time::sleep(channel_policy.total_delay() + Duration::from_secs(1)).await;
    assert!(!client.is_connected());
    // Only the connection supervisor is left.
    assert_eq!(client.active_supervisors(), 1);
    assert!(client.publish("hello", "nowhere").await.is_err());

    // A connection-level event restores service.
    broker.kill();
    broker.restore();
    assert!(wait_until(RetryPolicy::connection().total_delay(), || client.is_connected()).await);
    assert_eq!(client.active_supervisors(), 2);
    client.publish("hello", "recovered").await.unwrap();
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn publish_retries_transient_rejections() {
    let (broker, client) = connect(Topology::default()).await;

    broker.fail_next_publishes(2);
    client.publish("hello", "third time lucky").await.unwrap();
    assert_eq!(broker.publish_attempts(), 3);
    assert_eq!(broker.published(), 1);

    broker.fail_next_publishes(3);
    let err = client.publish("hello", "unlucky").await.unwrap_err();
    assert!(matches!(err, RideMeshError::RetriesExhausted { attempts: 3, .. }));
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn publish_honours_caller_cancellation() {
    let (broker, client) = connect(Topology::default()).await;
    broker.kill();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = client
        .publish_with_cancel(&cancel, "hello", "too late")
        .await
        .unwrap_err();
    assert!(matches!(err, RideMeshError::Cancelled));
    assert!(started.elapsed() < Duration::from_millis(100));

    // An already-cancelled token never reaches the broker.
    let attempts = broker.publish_attempts();
    assert!(client
        .publish_with_cancel(&cancel, "hello", "never sent")
        .await
        .is_err());
    assert_eq!(broker.publish_attempts(), attempts);
    client.close().await;
}
