use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use runner_broker::broker::protocol::{Event, EventPayload, decode_body, encode_body};
use runner_broker::broker::{HmrCallbacks, ProxyRequest};
use runner_broker::error::BrokerError;

use super::{TEST_SECRET, connect_runner, recv_json, send_text, spawn_broker, wait_for_condition};

fn get_request(path: &str) -> ProxyRequest {
    ProxyRequest {
        method: "GET".to_string(),
        path: path.to_string(),
        headers: HashMap::new(),
        body: None,
    }
}

async fn reply(runner: &mut super::WsClient, payload: EventPayload) {
    let event = Event::new(payload).with_project_id("p1");
    send_text(runner, serde_json::to_string(&event).unwrap()).await;
}

fn request_id_of(command: &Value) -> uuid::Uuid {
    command["payload"]["requestId"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .expect("requestId")
}

#[tokio::test]
async fn test_proxy_round_trip() {
    let broker = spawn_broker().await;
    let mut runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;
    wait_for_condition(
        || async { broker.state.broker.is_runner_connected("r1").await },
        Duration::from_secs(2),
    )
    .await;

    let task = {
        let core = broker.state.broker.clone();
        tokio::spawn(async move {
            core.proxy_request("r1", "p1", 5173, get_request("/index.html"))
                .await
        })
    };

    let command = recv_json(&mut runner, Duration::from_secs(2)).await.unwrap();
    assert_eq!(command["type"], "http-proxy-request");
    assert_eq!(command["payload"]["method"], "GET");
    assert_eq!(command["payload"]["path"], "/index.html");
    assert_eq!(command["payload"]["port"], 5173);

    reply(
        &mut runner,
        EventPayload::HttpProxyResponse {
            request_id: request_id_of(&command),
            status_code: 200,
            headers: HashMap::from([("content-type".to_string(), "text/html".to_string())]),
            is_chunked: false,
            body: Some(encode_body(b"<!doctype html>hi")),
        },
    )
    .await;

    let response = tokio_test::assert_ok!(task.await.unwrap());
    assert_eq!(response.status_code, 200);
    assert_eq!(response.headers["content-type"], "text/html");
    assert_eq!(response.body, b"<!doctype html>hi");
}

#[tokio::test]
async fn test_proxy_chunked_response() {
    let broker = spawn_broker().await;
    let mut runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;
    wait_for_condition(
        || async { broker.state.broker.is_runner_connected("r1").await },
        Duration::from_secs(2),
    )
    .await;

    let task = {
        let core = broker.state.broker.clone();
        tokio::spawn(async move {
            core.proxy_request("r1", "p1", 5173, get_request("/bundle.js"))
                .await
        })
    };

    let command = recv_json(&mut runner, Duration::from_secs(2)).await.unwrap();
    let request_id = request_id_of(&command);

    reply(
        &mut runner,
        EventPayload::HttpProxyResponse {
            request_id,
            status_code: 200,
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/javascript".to_string(),
            )]),
            is_chunked: true,
            body: None,
        },
    )
    .await;

    for (chunk, is_final) in [
        (&b"const a = 1;"[..], false),
        (b"const b = 2;", false),
        (b"export { a, b };", true),
    ] {
        reply(
            &mut runner,
            EventPayload::HttpProxyChunk {
                request_id,
                chunk: encode_body(chunk),
                is_final,
            },
        )
        .await;
    }

    let response = task.await.unwrap().unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(
        response.body,
        b"const a = 1;const b = 2;export { a, b };"
    );
}

#[tokio::test]
async fn test_proxy_error_event() {
    let broker = spawn_broker().await;
    let mut runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;
    wait_for_condition(
        || async { broker.state.broker.is_runner_connected("r1").await },
        Duration::from_secs(2),
    )
    .await;

    let task = {
        let core = broker.state.broker.clone();
        tokio::spawn(async move {
            core.proxy_request("r1", "p1", 5173, get_request("/api/missing"))
                .await
        })
    };

    let command = recv_json(&mut runner, Duration::from_secs(2)).await.unwrap();
    reply(
        &mut runner,
        EventPayload::HttpProxyError {
            request_id: request_id_of(&command),
            status_code: Some(502),
            error: "dev server not listening".to_string(),
        },
    )
    .await;

    match task.await.unwrap() {
        Err(BrokerError::Proxy { message, status }) => {
            assert_eq!(message, "dev server not listening");
            assert_eq!(status, Some(502));
        }
        other => panic!("Expected proxy error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_proxy_to_absent_runner_fails_fast() {
    let broker = spawn_broker().await;

    let result = broker
        .state
        .broker
        .proxy_request("ghost", "p1", 5173, get_request("/"))
        .await;
    assert!(matches!(result, Err(BrokerError::RunnerUnavailable { .. })));
}

#[tokio::test]
async fn test_runner_disconnect_rejects_pending_proxy() {
    let broker = spawn_broker().await;
    let mut runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;
    wait_for_condition(
        || async { broker.state.broker.is_runner_connected("r1").await },
        Duration::from_secs(2),
    )
    .await;

    let task = {
        let core = broker.state.broker.clone();
        tokio::spawn(async move {
            core.proxy_request("r1", "p1", 5173, get_request("/slow"))
                .await
        })
    };

    // The request reaches the runner, which then vanishes
    recv_json(&mut runner, Duration::from_secs(2)).await.unwrap();
    drop(runner);

    match tokio::time::timeout(Duration::from_secs(5), task).await {
        Ok(Ok(Err(BrokerError::RunnerDisconnected))) => {}
        other => panic!("Expected runner-disconnected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_hmr_relay_both_directions() {
    let broker = spawn_broker().await;
    let mut runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;
    wait_for_condition(
        || async { broker.state.broker.is_runner_connected("r1").await },
        Duration::from_secs(2),
    )
    .await;

    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel::<()>();
    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<String>();

    let callbacks = HmrCallbacks {
        on_connected: Arc::new(move || {
            let _ = connected_tx.send(());
        }),
        on_message: Arc::new(move |frame| {
            let _ = message_tx.send(frame.to_string());
        }),
        ..HmrCallbacks::noop()
    };

    broker
        .state
        .broker
        .hmr_connect("c1", "r1", "p1", 5173, Some("vite-hmr".to_string()), callbacks)
        .await
        .unwrap();

    // Runner sees the connect command with the caller's connection id
    let command = recv_json(&mut runner, Duration::from_secs(2)).await.unwrap();
    assert_eq!(command["type"], "hmr-connect");
    assert_eq!(command["payload"]["connectionId"], "c1");
    assert_eq!(command["payload"]["protocol"], "vite-hmr");

    reply(
        &mut runner,
        EventPayload::HmrConnected {
            connection_id: "c1".to_string(),
        },
    )
    .await;
    tokio::time::timeout(Duration::from_secs(2), connected_rx.recv())
        .await
        .expect("on_connected");

    // Browser -> runner
    assert!(
        broker
            .state
            .broker
            .hmr_send("c1", "{\"type\":\"update\"}")
            .await
    );
    let command = recv_json(&mut runner, Duration::from_secs(2)).await.unwrap();
    assert_eq!(command["type"], "hmr-message");
    assert_eq!(command["payload"]["message"], "{\"type\":\"update\"}");

    // Runner -> browser
    reply(
        &mut runner,
        EventPayload::HmrMessage {
            connection_id: "c1".to_string(),
            message: "{\"type\":\"full-reload\"}".to_string(),
        },
    )
    .await;
    let frame = tokio::time::timeout(Duration::from_secs(2), message_rx.recv())
        .await
        .expect("on_message")
        .unwrap();
    assert_eq!(frame, "{\"type\":\"full-reload\"}");

    // Local disconnect emits the command
    assert!(broker.state.broker.hmr_disconnect("c1").await);
    let command = recv_json(&mut runner, Duration::from_secs(2)).await.unwrap();
    assert_eq!(command["type"], "hmr-disconnect");
}

#[tokio::test]
async fn test_hmr_teardown_on_runner_disconnect() {
    let broker = spawn_broker().await;
    let mut runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;
    wait_for_condition(
        || async { broker.state.broker.is_runner_connected("r1").await },
        Duration::from_secs(2),
    )
    .await;

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<(u16, String)>();
    let callbacks = HmrCallbacks {
        on_disconnected: Arc::new(move |code, reason| {
            let _ = closed_tx.send((code, reason.to_string()));
        }),
        ..HmrCallbacks::noop()
    };

    broker
        .state
        .broker
        .hmr_connect("c1", "r1", "p1", 5173, None, callbacks)
        .await
        .unwrap();
    recv_json(&mut runner, Duration::from_secs(2)).await.unwrap();
    reply(
        &mut runner,
        EventPayload::HmrConnected {
            connection_id: "c1".to_string(),
        },
    )
    .await;

    drop(runner);

    let (code, reason) = tokio::time::timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .expect("on_disconnected")
        .unwrap();
    assert_eq!(code, 1001);
    assert_eq!(reason, "Runner disconnected");
}

#[tokio::test]
async fn test_proxy_body_base64_symmetry() {
    // The command body must decode to what the caller supplied.
    let broker = spawn_broker().await;
    let mut runner = connect_runner(broker.addr, "r1", TEST_SECRET).await;
    wait_for_condition(
        || async { broker.state.broker.is_runner_connected("r1").await },
        Duration::from_secs(2),
    )
    .await;

    let task = {
        let core = broker.state.broker.clone();
        tokio::spawn(async move {
            core.proxy_request(
                "r1",
                "p1",
                5173,
                ProxyRequest {
                    method: "POST".to_string(),
                    path: "/api/echo".to_string(),
                    headers: HashMap::from([(
                        "content-type".to_string(),
                        "application/json".to_string(),
                    )]),
                    body: Some(b"{\"hello\":\"world\"}".to_vec()),
                },
            )
            .await
        })
    };

    let command = recv_json(&mut runner, Duration::from_secs(2)).await.unwrap();
    let body = command["payload"]["body"].as_str().unwrap();
    assert_eq!(decode_body(body).unwrap(), b"{\"hello\":\"world\"}");

    reply(
        &mut runner,
        EventPayload::HttpProxyResponse {
            request_id: request_id_of(&command),
            status_code: 204,
            headers: HashMap::new(),
            is_chunked: false,
            body: None,
        },
    )
    .await;

    let response = task.await.unwrap().unwrap();
    assert_eq!(response.status_code, 204);
    assert!(response.body.is_empty());
}
