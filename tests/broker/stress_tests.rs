use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use runner_broker::broker::EnqueueOptions;
use runner_broker::broker::protocol::{Command, CommandPayload, Event, EventPayload};

use super::{
    TEST_SECRET, connect_client, connect_runner, recv_json, send_text, spawn_broker,
    wait_for_condition,
};

#[tokio::test]
async fn stress_test_broadcast_reaches_every_subscriber() {
    let broker = spawn_broker().await;
    let mut clients = Vec::new();
    for _ in 0..20 {
        let (client, _) = connect_client(broker.addr, Some("p1"), None).await;
        clients.push(client);
    }

    broker
        .state
        .broker
        .broadcast_build_started("p1", None, "b1")
        .await;

    for client in clients.iter_mut() {
        let batch = recv_json(client, Duration::from_secs(3)).await.unwrap();
        assert_eq!(batch["type"], "batch-update");
        assert_eq!(batch["events"][0]["data"]["buildId"], "b1");
    }
}

#[tokio::test]
async fn stress_test_queue_drains_in_order_on_reconnect() {
    let broker = spawn_broker().await;
    let total = 50;
    let successes = Arc::new(AtomicUsize::new(0));

    let mut expected_ids = Vec::new();
    for _ in 0..total {
        let command = Command::new("p1", CommandPayload::RunnerHealthCheck {});
        expected_ids.push(command.id.to_string());
        let count = successes.clone();
        broker
            .state
            .broker
            .enqueue_command(
                "r1",
                command,
                EnqueueOptions::new()
                    .ttl(Duration::from_secs(60))
                    .on_success(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .await;
    }
    assert_eq!(broker.state.broker.queue.pending_count("r1").await, total);

    let mut runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;

    let mut received = Vec::new();
    while received.len() < total {
        let frame = recv_json(&mut runner, Duration::from_secs(5))
            .await
            .expect("queued command frame");
        received.push(frame["id"].as_str().unwrap().to_string());
    }

    assert_eq!(received, expected_ids);
    assert_eq!(successes.load(Ordering::SeqCst), total);
    assert_eq!(broker.state.broker.queue.pending_count("r1").await, 0);
}

#[tokio::test]
async fn stress_test_event_burst_is_batched_not_dropped() {
    let broker = spawn_broker().await;
    let (mut client, _) = connect_client(broker.addr, Some("p1"), None).await;
    let mut runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;
    wait_for_condition(
        || async { broker.state.broker.is_runner_connected("r1").await },
        Duration::from_secs(2),
    )
    .await;

    let total = 40;
    for i in 0..total {
        let event = Event::new(EventPayload::LogChunk {
            chunk: format!("line {}\n", i),
            stream: Some("stdout".to_string()),
        })
        .with_project_id("p1");
        send_text(&mut runner, serde_json::to_string(&event).unwrap()).await;
    }

    // Entries arrive coalesced into batch-update envelopes; count them all.
    let mut seen = 0;
    let mut batches = 0;
    while seen < total {
        let batch = recv_json(&mut client, Duration::from_secs(5))
            .await
            .expect("batch frame");
        assert_eq!(batch["type"], "batch-update");
        let events = batch["events"].as_array().unwrap();
        for entry in events {
            assert_eq!(entry["type"], "log-chunk");
        }
        seen += events.len();
        batches += 1;
    }

    assert_eq!(seen, total);
    // The 10-entry overflow trigger and the 200 ms window guarantee
    // coalescing, so far fewer frames than events crossed the wire.
    assert!(batches <= total / 2, "expected coalescing, got {} batches", batches);
}

#[tokio::test]
async fn stress_test_concurrent_state_updates_from_many_tasks() {
    let broker = spawn_broker().await;
    let (mut client, _) = connect_client(broker.addr, Some("p1"), None).await;

    let total = 60;
    let mut handles = Vec::new();
    for i in 0..total {
        let core = broker.state.broker.clone();
        handles.push(tokio::spawn(async move {
            core.broadcast_state_update("p1", None, json!({ "seq": i }))
                .await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut seen = 0;
    while seen < total {
        let batch = recv_json(&mut client, Duration::from_secs(5))
            .await
            .expect("batch frame");
        seen += batch["events"].as_array().unwrap().len();
    }
    assert_eq!(seen, total);
}
