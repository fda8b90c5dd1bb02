use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use runner_broker::broker::protocol::{Command, CommandPayload};
use runner_broker::broker::{EnqueueOptions, ToolCallUpdate};

use super::{
    TEST_SECRET, connect_client, connect_runner, recv_close_code, recv_json, send_json,
    spawn_broker, wait_for_condition,
};

#[tokio::test]
async fn test_client_heartbeat_round_trip() {
    let broker = spawn_broker().await;
    let (mut client, greeting) = connect_client(broker.addr, Some("p1"), None).await;
    assert_eq!(greeting["projectId"], "p1");

    send_json(&mut client, &json!({"type": "heartbeat"})).await;
    let ack = recv_json(&mut client, Duration::from_secs(2)).await.unwrap();
    assert_eq!(ack["type"], "heartbeat-ack");
}

#[tokio::test]
async fn test_get_state_is_acknowledged() {
    let broker = spawn_broker().await;
    let (mut client, _) = connect_client(broker.addr, Some("p1"), Some("s1")).await;

    send_json(&mut client, &json!({"type": "get-state"})).await;
    let response = recv_json(&mut client, Duration::from_secs(2)).await.unwrap();
    assert_eq!(response["type"], "state-response");
    assert_eq!(response["projectId"], "p1");
    assert_eq!(response["sessionId"], "s1");
}

#[tokio::test]
async fn test_runner_auth_failure_closes_1008() {
    let broker = spawn_broker().await;
    let mut runner = connect_runner(broker.addr, "r1", "wrong-secret").await;

    let code = recv_close_code(&mut runner, Duration::from_secs(2)).await;
    assert_eq!(code, Some(1008));
    assert!(!broker.state.broker.is_runner_connected("r1").await);
}

#[tokio::test]
async fn test_runner_registers_on_authenticated_upgrade() {
    let broker = spawn_broker().await;
    let _runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;

    assert!(
        wait_for_condition(
            || async { broker.state.broker.is_runner_connected("r1").await },
            Duration::from_secs(2),
        )
        .await
    );

    let connections = broker.state.broker.list_runner_connections(None).await;
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].runner_id, "r1");
}

#[tokio::test]
async fn test_second_connection_evicts_first() {
    let broker = spawn_broker().await;
    let mut first = connect_runner(broker.addr, "r1", TEST_SECRET).await;
    wait_for_condition(
        || async { broker.state.broker.is_runner_connected("r1").await },
        Duration::from_secs(2),
    )
    .await;

    let mut second = connect_runner(broker.addr, "r1", TEST_SECRET).await;

    // The first socket observes a normal close
    let code = recv_close_code(&mut first, Duration::from_secs(2)).await;
    assert_eq!(code, Some(1000));

    // Commands now land on the second socket
    let command = Command::new("p1", CommandPayload::RunnerHealthCheck {});
    assert!(
        wait_for_condition(
            || async {
                broker
                    .state
                    .broker
                    .send_command_to_runner("r1", &command)
                    .await
            },
            Duration::from_secs(2),
        )
        .await
    );

    let frame = recv_json(&mut second, Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame["type"], "runner-health-check");
    assert_eq!(frame["id"], command.id.to_string());
}

#[tokio::test]
async fn test_queue_then_deliver_on_reconnect() {
    let broker = spawn_broker().await;
    let successes = Arc::new(AtomicUsize::new(0));

    let command = Command::new("p1", CommandPayload::RunnerHealthCheck {});
    let command_id = command.id;

    let count = successes.clone();
    let result = broker
        .state
        .broker
        .enqueue_command(
            "r1",
            command,
            EnqueueOptions::new()
                .ttl(Duration::from_secs(60))
                .max_attempts(3)
                .on_success(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .await;
    assert!(!result.sent);
    assert!(result.queued);

    // Runner connects and the queue drains onto its socket
    let mut runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;
    let frame = recv_json(&mut runner, Duration::from_secs(3)).await.unwrap();
    assert_eq!(frame["id"], command_id.to_string());
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(broker.state.broker.queue.pending_count("r1").await, 0);
}

#[tokio::test]
async fn test_queue_ttl_expiry_fires_once() {
    let broker = spawn_broker().await;
    let failures = Arc::new(AtomicUsize::new(0));

    let count = failures.clone();
    broker
        .state
        .broker
        .enqueue_command(
            "r1",
            Command::new("p1", CommandPayload::RunnerHealthCheck {}),
            EnqueueOptions::new()
                .ttl(Duration::from_millis(200))
                .on_failure(move |reason| {
                    assert_eq!(reason, "Command expired");
                    count.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    broker.state.broker.queue.sweep_expired().await;
    broker.state.broker.queue.sweep_expired().await;

    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(broker.state.broker.queue.total_pending().await, 0);
}

#[tokio::test]
async fn test_fan_out_filter_by_session() {
    let broker = spawn_broker().await;
    let (mut client_a, _) = connect_client(broker.addr, Some("p1"), Some("sX")).await;
    let (mut client_b, _) = connect_client(broker.addr, Some("p1"), None).await;

    let tool_call = ToolCallUpdate {
        id: "t1".to_string(),
        name: "Bash".to_string(),
        todo_index: 0,
        input: Some(json!({"command": "ls"})),
        output: None,
        state: "running".to_string(),
    };

    broker
        .state
        .broker
        .broadcast_tool_call("p1", Some("sX".to_string()), tool_call.clone())
        .await;

    let batch_a = recv_json(&mut client_a, Duration::from_secs(2)).await.unwrap();
    let batch_b = recv_json(&mut client_b, Duration::from_secs(2)).await.unwrap();
    assert_eq!(batch_a["events"][0]["type"], "tool-call");
    assert_eq!(batch_b["events"][0]["type"], "tool-call");

    // A second broadcast scoped to sY reaches only the session-less client
    broker
        .state
        .broker
        .broadcast_tool_call("p1", Some("sY".to_string()), tool_call)
        .await;

    let batch_b = recv_json(&mut client_b, Duration::from_secs(2)).await.unwrap();
    assert_eq!(batch_b["sessionId"], "sY");

    // Client A sees nothing further
    assert!(recv_json(&mut client_a, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_immediate_broadcasts_flush_without_window() {
    let broker = spawn_broker().await;
    let (mut client, _) = connect_client(broker.addr, Some("p1"), None).await;

    let start = std::time::Instant::now();
    broker
        .state
        .broker
        .broadcast_todos_update(
            "p1",
            None,
            json!([{"title": "scaffold app", "done": false}]),
            0,
            Some("planning".to_string()),
        )
        .await;

    let batch = recv_json(&mut client, Duration::from_secs(2)).await.unwrap();
    assert_eq!(batch["events"][0]["type"], "todos-update");
    // Well under the 200 ms batch window
    assert!(start.elapsed() < Duration::from_millis(150));
}

#[tokio::test]
async fn test_subscribe_message_rebinds_project() {
    let broker = spawn_broker().await;
    let (mut client, _) = connect_client(broker.addr, Some("p1"), None).await;

    send_json(
        &mut client,
        &json!({"type": "subscribe", "projectId": "p2", "sessionId": null}),
    )
    .await;

    // Frames are processed in order, so the state-response confirms the
    // subscribe landed.
    send_json(&mut client, &json!({"type": "get-state"})).await;
    let response = recv_json(&mut client, Duration::from_secs(2)).await.unwrap();
    assert_eq!(response["type"], "state-response");
    assert_eq!(response["projectId"], "p2");

    broker
        .state
        .broker
        .broadcast_build_started("p2", None, "b2")
        .await;
    let batch = recv_json(&mut client, Duration::from_secs(2)).await.unwrap();
    assert_eq!(batch["projectId"], "p2");
}

#[tokio::test]
async fn test_runner_status_observer() {
    let broker = spawn_broker().await;
    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));

    let up_count = ups.clone();
    let down_count = downs.clone();
    broker
        .state
        .broker
        .on_runner_status_change(Arc::new(move |runner_id, connected, _| {
            assert_eq!(runner_id, "r1");
            if connected {
                up_count.fetch_add(1, Ordering::SeqCst);
            } else {
                down_count.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .await;

    let runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;
    assert!(
        wait_for_condition(
            || async { ups.load(Ordering::SeqCst) == 1 },
            Duration::from_secs(2)
        )
        .await
    );

    drop(runner);
    assert!(
        wait_for_condition(
            || async { downs.load(Ordering::SeqCst) == 1 },
            Duration::from_secs(2)
        )
        .await
    );
}

#[tokio::test]
async fn test_stats_endpoints() {
    let broker = spawn_broker().await;
    let _runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;
    wait_for_condition(
        || async { broker.state.broker.is_runner_connected("r1").await },
        Duration::from_secs(2),
    )
    .await;

    let base = format!("http://{}", broker.addr);
    let health: serde_json::Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let stats: serde_json::Value = reqwest::get(format!("{}/ws/stats", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["runners"], 1);
    assert_eq!(stats["metrics"]["runnersConnected"], 1);

    let runners: serde_json::Value = reqwest::get(format!("{}/ws/runners", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(runners["count"], 1);
    assert_eq!(runners["runners"][0]["runnerId"], "r1");

    let missing = reqwest::get(format!("{}/definitely-not-a-route", base))
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}
