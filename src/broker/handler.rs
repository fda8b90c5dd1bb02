use axum::{
    Json, TypedHeader,
    extract::{
        OriginalUri, Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::StatusCode,
    response::Response,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use headers::{Authorization, authorization::Bearer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{
    Broker,
    monitoring::MetricsSnapshot,
    protocol::{DecodedEvent, decode_event},
    registry::RunnerConnectionInfo,
    subscribers::{ClientMessage, ServerMessage},
};

#[derive(Clone)]
pub struct BrokerState {
    pub broker: Arc<Broker>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerUpgradeQuery {
    pub runner_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientUpgradeQuery {
    pub project_id: Option<String>,
    pub session_id: Option<String>,
}

pub struct BrokerHandler;

impl BrokerHandler {
    /// `/ws/runner` upgrade. The bearer secret is compared against the
    /// environment at upgrade time; a mismatch still upgrades but closes
    /// immediately with 1008 so the runner sees a policy close, not an
    /// HTTP error.
    pub async fn runner_ws_handler(
        ws: WebSocketUpgrade,
        Query(query): Query<RunnerUpgradeQuery>,
        auth: Option<TypedHeader<Authorization<Bearer>>>,
        State(state): State<BrokerState>,
    ) -> Response {
        let runner_id = query.runner_id.unwrap_or_else(|| "default".to_string());

        let expected = state.broker.config.current_runner_secret();
        let authorized = match &auth {
            Some(TypedHeader(bearer)) => !expected.is_empty() && bearer.token() == expected,
            None => false,
        };

        if !authorized {
            warn!("Rejecting runner {} upgrade: invalid shared secret", runner_id);
            return ws.on_upgrade(|socket| Self::close_unauthorized(socket));
        }

        info!("Runner {} upgrade accepted", runner_id);
        ws.on_upgrade(move |socket| Self::handle_runner_socket(state, socket, runner_id))
    }

    async fn close_unauthorized(mut socket: WebSocket) {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "Invalid runner secret".into(),
            })))
            .await;
    }

    async fn handle_runner_socket(state: BrokerState, socket: WebSocket, runner_id: String) {
        let broker = state.broker;
        let (mut sender, mut receiver) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        // Dedicated writer task; all outbound frames for this socket are
        // serialized through the channel.
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sender.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        broker.registry.register(&runner_id, outbound.clone(), None).await;

        // Drain anything that queued up while this runner was away.
        {
            let broker = broker.clone();
            let runner_id = runner_id.clone();
            tokio::spawn(async move {
                let result = broker.queue.process_queue(&runner_id).await;
                if result.remaining > 0 {
                    debug!(
                        "{} command(s) still queued for runner {} after reconnect",
                        result.remaining, runner_id
                    );
                }
            });
        }

        let ping = tokio::spawn({
            let outbound = outbound.clone();
            let interval = broker.config.runner_ping_interval();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // the first tick fires immediately
                loop {
                    ticker.tick().await;
                    if outbound.send(Message::Ping(Vec::new())).is_err() {
                        break;
                    }
                }
            }
        });

        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    broker.registry.touch(&runner_id).await;
                    Self::handle_runner_frame(&broker, &runner_id, &text).await;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    broker.registry.touch(&runner_id).await;
                }
                Ok(Message::Binary(_)) => {
                    // The protocol is JSON text frames only.
                    broker.registry.touch(&runner_id).await;
                    debug!("Ignoring binary frame from runner {}", runner_id);
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!("Runner {} socket error: {}", runner_id, e);
                    break;
                }
            }
        }

        ping.abort();
        // An evicted connection must not cancel work that now belongs to
        // its replacement; the stale sweep fails its own victims.
        if broker.registry.unregister(&runner_id, &outbound).await {
            broker.http_proxy.fail_runner(&runner_id).await;
            broker.hmr_proxy.fail_runner(&runner_id).await;
        }
        drop(outbound);
        let _ = writer.await;
    }

    /// Parses and routes one inbound runner frame. Parse failures and
    /// unknown types are counted and dropped; the socket stays up.
    pub(crate) async fn handle_runner_frame(broker: &Arc<Broker>, runner_id: &str, text: &str) {
        match decode_event(text) {
            Err(e) => {
                broker.metrics.record_parse_error();
                warn!("Dropping unparseable frame from runner {}: {}", runner_id, e);
            }
            Ok(DecodedEvent::Unknown { message_type, .. }) => {
                broker.metrics.record_unknown_message_type();
                debug!(
                    "Dropping unknown message type {:?} from runner {}",
                    message_type, runner_id
                );
            }
            Ok(DecodedEvent::Event(event)) => {
                broker.metrics.record_event_received();
                if let Some(project_id) = &event.project_id {
                    broker.registry.record_project(runner_id, project_id).await;
                }

                broker.command_events.dispatch(&event);
                if event.is_proxy_event() {
                    broker.http_proxy.handle_event(&event).await;
                    broker.hmr_proxy.handle_event(&event).await;
                } else {
                    broker.subscribers.broadcast_runner_event(&event).await;
                }
            }
        }
    }

    /// `/ws` upgrade. Browser auth happens in the app before the upgrade
    /// is proxied here, so the hub accepts unconditionally.
    pub async fn client_ws_handler(
        ws: WebSocketUpgrade,
        Query(query): Query<ClientUpgradeQuery>,
        State(state): State<BrokerState>,
    ) -> Response {
        ws.on_upgrade(move |socket| {
            Self::handle_client_socket(state, socket, query.project_id, query.session_id)
        })
    }

    async fn handle_client_socket(
        state: BrokerState,
        socket: WebSocket,
        project_id: Option<String>,
        session_id: Option<String>,
    ) {
        let broker = state.broker;
        let client_id = Uuid::new_v4();
        let (mut sender, mut receiver) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sender.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        broker
            .subscribers
            .register(client_id, outbound.clone(), project_id, session_id)
            .await;

        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    Self::handle_client_frame(&broker, client_id, &text).await;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    broker.subscribers.touch(client_id).await;
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!("Subscriber {} socket error: {}", client_id, e);
                    break;
                }
                _ => {}
            }
        }

        broker.subscribers.remove(client_id).await;
        drop(outbound);
        let _ = writer.await;
    }

    async fn handle_client_frame(broker: &Arc<Broker>, client_id: Uuid, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Heartbeat) => {
                broker.subscribers.touch(client_id).await;
                broker
                    .subscribers
                    .send_to(client_id, &ServerMessage::HeartbeatAck)
                    .await;
            }
            Ok(ClientMessage::Subscribe {
                project_id,
                session_id,
            }) => {
                broker.subscribers.touch(client_id).await;
                broker
                    .subscribers
                    .update_subscription(client_id, project_id, session_id)
                    .await;
            }
            Ok(ClientMessage::GetState) => {
                broker.subscribers.touch(client_id).await;
                // State recovery itself is the app's job over HTTP; the
                // sentinel just acknowledges the request.
                let (project_id, session_id) = broker
                    .subscribers
                    .subscription_of(client_id)
                    .await
                    .unwrap_or((None, None));
                broker
                    .subscribers
                    .send_to(
                        client_id,
                        &ServerMessage::StateResponse {
                            project_id,
                            session_id,
                        },
                    )
                    .await;
            }
            Err(e) => {
                broker.metrics.record_unknown_message_type();
                debug!("Dropping client frame from {}: {}", client_id, e);
            }
        }
    }

    // --- HTTP endpoints --------------------------------------------------

    pub async fn health() -> Json<serde_json::Value> {
        Json(serde_json::json!({ "status": "ok" }))
    }

    pub async fn get_broker_stats(State(state): State<BrokerState>) -> Json<BrokerStats> {
        let broker = &state.broker;
        Json(BrokerStats {
            runners: broker.registry.connection_count().await,
            subscribers: broker.subscribers.subscriber_count().await,
            queued_commands: broker.queue.total_pending().await,
            pending_proxy_requests: broker.http_proxy.pending_count().await,
            hmr_connections: broker.hmr_proxy.connection_count().await,
            ws_proxy_enabled: broker.config.use_ws_proxy,
            metrics: broker.metrics.snapshot(),
        })
    }

    pub async fn list_runners(State(state): State<BrokerState>) -> Json<RunnersResponse> {
        let runners = state.broker.registry.list_connections(None).await;
        Json(RunnersResponse {
            count: runners.len(),
            runners,
        })
    }

    /// Catch-all for paths no route owns. The root path is probed by load
    /// balancers, so it stays quiet.
    pub async fn unknown_path(OriginalUri(uri): OriginalUri) -> StatusCode {
        if uri.path() != "/" {
            warn!("Unknown path requested: {}", uri.path());
        }
        StatusCode::NOT_FOUND
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    pub runners: usize,
    pub subscribers: usize,
    pub queued_commands: usize,
    pub pending_proxy_requests: usize,
    pub hmr_connections: usize,
    pub ws_proxy_enabled: bool,
    pub metrics: MetricsSnapshot,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnersResponse {
    pub count: usize,
    pub runners: Vec<RunnerConnectionInfo>,
}
