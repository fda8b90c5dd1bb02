pub mod basic_tests;
pub mod proxy_tests;
pub mod stress_tests;

// Common test harness: an in-process broker on an ephemeral port plus
// socket helpers for both ends of the protocol.

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::Message as TungsteniteMessage,
};
use url::Url;

use runner_broker::broker::{self, BrokerState};
use runner_broker::config::Config;

pub const TEST_SECRET: &str = "integration-test-secret";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestBroker {
    pub addr: SocketAddr,
    pub state: BrokerState,
}

pub fn test_config() -> Config {
    Config {
        runner_shared_secret: TEST_SECRET.to_string(),
        ..Config::default()
    }
}

/// Boots a broker with its background timers on an ephemeral port.
pub async fn spawn_broker() -> TestBroker {
    spawn_broker_with(test_config()).await
}

pub async fn spawn_broker_with(config: Config) -> TestBroker {
    let state = broker::create_broker_state(config);
    state.broker.start_background_tasks().await;

    let app = Router::new().merge(broker::create_broker_routes().with_state(state.clone()));
    let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
        .serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });

    TestBroker { addr, state }
}

/// Opens an authenticated runner socket.
pub async fn connect_runner(addr: SocketAddr, runner_id: &str, secret: &str) -> WsClient {
    let url = Url::parse(&format!("ws://{}/ws/runner?runnerId={}", addr, runner_id)).unwrap();
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", secret).parse().unwrap(),
    );

    let (stream, _) = connect_async(request).await.expect("runner connect");
    stream
}

/// Opens a browser subscription socket and consumes the greeting.
pub async fn connect_client(
    addr: SocketAddr,
    project_id: Option<&str>,
    session_id: Option<&str>,
) -> (WsClient, Value) {
    let mut url = format!("ws://{}/ws", addr);
    match (project_id, session_id) {
        (Some(project), Some(session)) => {
            url = format!("{}?projectId={}&sessionId={}", url, project, session)
        }
        (Some(project), None) => url = format!("{}?projectId={}", url, project),
        _ => {}
    }

    let (mut stream, _) = connect_async(Url::parse(&url).unwrap())
        .await
        .expect("client connect");
    let greeting = recv_json(&mut stream, Duration::from_secs(2))
        .await
        .expect("greeting");
    assert_eq!(greeting["type"], "connected");
    (stream, greeting)
}

/// Receives frames until a JSON text frame arrives, or the deadline hits.
pub async fn recv_json(stream: &mut WsClient, deadline: Duration) -> Option<Value> {
    let result = timeout(deadline, async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(TungsteniteMessage::Text(text)) => {
                    return serde_json::from_str::<Value>(&text).ok();
                }
                Ok(TungsteniteMessage::Ping(_)) | Ok(TungsteniteMessage::Pong(_)) => continue,
                _ => return None,
            }
        }
        None
    })
    .await;
    result.ok().flatten()
}

/// Receives frames until a close frame arrives; returns its code.
pub async fn recv_close_code(stream: &mut WsClient, deadline: Duration) -> Option<u16> {
    let result = timeout(deadline, async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(TungsteniteMessage::Close(Some(frame))) => {
                    return Some(u16::from(frame.code));
                }
                Ok(TungsteniteMessage::Close(None)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    })
    .await;
    result.ok().flatten()
}

pub async fn send_json(stream: &mut WsClient, value: &Value) {
    stream
        .send(TungsteniteMessage::Text(value.to_string()))
        .await
        .expect("send frame");
}

pub async fn send_text(stream: &mut WsClient, text: String) {
    stream
        .send(TungsteniteMessage::Text(text))
        .await
        .expect("send frame");
}

/// Polls `condition` until it holds or the deadline passes.
pub async fn wait_for_condition<F, Fut>(mut condition: F, deadline: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
