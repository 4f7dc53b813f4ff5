//! Integration tests exercising the broker over its HTTP binding: the
//! client and server must present the same contract as the in-memory
//! queue.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use runinator_broker::{http::HttpBroker, AckStatus, Broker, FiringQueue};
use runinator_core::Firing;
use tokio::net::TcpListener;
use tokio::sync::watch;

async fn start_broker() -> (HttpBroker, FiringQueue, watch::Sender<bool>) {
    let queue = FiringQueue::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let serve_queue = queue.clone();
    tokio::spawn(async move {
        runinator_broker::http::serve(listener, serve_queue, shutdown_rx)
            .await
            .unwrap();
    });

    let client = HttpBroker::new(&format!("http://{addr}/")).unwrap();
    (client, queue, shutdown_tx)
}

fn firing(task_id: i64) -> Firing {
    Firing {
        id: 0,
        task_id,
        scheduled_for: Utc.with_ymd_and_hms(2025, 1, 16, 12, 0, 0).unwrap(),
        attempt: 0,
        action_name: "Console".into(),
        action_function: "run_console".into(),
        configuration: b"echo hi".to_vec(),
        timeout_ms: 1_000,
    }
}

#[tokio::test]
async fn publish_lease_ack_round_trip() {
    let (client, queue, _shutdown) = start_broker().await;

    let receipt = client.publish(firing(1)).await.unwrap();
    assert!(!receipt.duplicate);

    let leased = client
        .lease("worker-1", Duration::from_millis(500))
        .await
        .unwrap()
        .expect("a pending firing");
    assert_eq!(leased.firing.task_id, 1);
    assert_eq!(leased.firing.id, receipt.id);
    assert!(!leased.lease_token.is_empty());

    let status = client.ack(leased.firing.id, &leased.lease_token).await.unwrap();
    assert_eq!(status, AckStatus::Acked);
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn duplicate_publish_returns_the_existing_id() {
    let (client, _queue, _shutdown) = start_broker().await;

    let first = client.publish(firing(2)).await.unwrap();
    let second = client.publish(firing(2)).await.unwrap();
    assert!(second.duplicate);
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn empty_queue_lease_returns_none() {
    let (client, _queue, _shutdown) = start_broker().await;

    let leased = client
        .lease("worker-1", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(leased.is_none());
}

#[tokio::test]
async fn stale_token_is_reported_not_applied() {
    let (client, queue, _shutdown) = start_broker().await;

    client.publish(firing(3)).await.unwrap();
    let leased = client
        .lease("worker-1", Duration::from_millis(500))
        .await
        .unwrap()
        .unwrap();

    let status = client
        .ack(leased.firing.id, "00000000000000000000000000000000")
        .await
        .unwrap();
    assert_eq!(status, AckStatus::Stale);
    assert_eq!(queue.in_flight(), 1);
}

#[tokio::test]
async fn nack_drop_is_visible_in_the_dead_list() {
    let (client, _queue, _shutdown) = start_broker().await;

    client.publish(firing(4)).await.unwrap();
    let leased = client
        .lease("worker-1", Duration::from_millis(500))
        .await
        .unwrap()
        .unwrap();
    client
        .nack(
            leased.firing.id,
            &leased.lease_token,
            false,
            Some("handler_not_found".into()),
        )
        .await
        .unwrap();

    let dead = client.list_dead().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].firing.task_id, 4);
    assert_eq!(dead[0].reason, "handler_not_found");
}

#[tokio::test]
async fn lease_long_poll_picks_up_a_late_publish() {
    let (client, _queue, _shutdown) = start_broker().await;

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.lease("worker-1", Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.publish(firing(5)).await.unwrap();

    let leased = waiter.await.unwrap().unwrap().expect("late publish leased");
    assert_eq!(leased.firing.task_id, 5);
}
