use axum::extract::ws::{CloseFrame, Message, close_code};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::monitoring::BrokerMetrics;
use crate::broker::protocol::{Event, EventPayload, TraceContext};

/// Messages a browser client may send on `/ws`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Heartbeat,
    Subscribe {
        project_id: Option<String>,
        session_id: Option<String>,
    },
    GetState,
}

/// Messages the hub sends to browser clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        client_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Heartbeat,
    HeartbeatAck,
    /// Acknowledges `get-state`; actual state recovery happens over HTTP.
    StateResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    BatchUpdate {
        project_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        events: Vec<BatchEntry>,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "_trace", skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

impl BatchEntry {
    fn new(entry_type: &str, data: Value) -> Self {
        Self {
            entry_type: entry_type.to_string(),
            data,
            timestamp: Utc::now(),
            trace: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    pub id: String,
    pub name: String,
    pub todo_index: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub state: String,
}

/// One browser socket observing a project (and optionally a session).
pub struct Subscription {
    pub client_id: Uuid,
    pub outbound: mpsc::UnboundedSender<Message>,
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
}

type BatchKey = (String, Option<String>);

/// Fans runner and app events out to browser subscribers, coalescing the
/// chatty ones into 200 ms batches and flushing critical ones immediately.
#[derive(Clone)]
pub struct SubscriberHub {
    subscriptions: Arc<RwLock<HashMap<Uuid, Subscription>>>,
    batches: Arc<Mutex<HashMap<BatchKey, Vec<BatchEntry>>>>,
    metrics: BrokerMetrics,
    batch_max_entries: usize,
}

impl SubscriberHub {
    pub fn new(metrics: BrokerMetrics, batch_max_entries: usize) -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            batches: Arc::new(Mutex::new(HashMap::new())),
            metrics,
            batch_max_entries,
        }
    }

    /// Registers a freshly upgraded browser socket and greets it.
    pub async fn register(
        &self,
        client_id: Uuid,
        outbound: mpsc::UnboundedSender<Message>,
        project_id: Option<String>,
        session_id: Option<String>,
    ) {
        let greeting = ServerMessage::Connected {
            client_id,
            project_id: project_id.clone(),
            session_id: session_id.clone(),
        };

        {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions.insert(
                client_id,
                Subscription {
                    client_id,
                    outbound,
                    project_id,
                    session_id,
                    last_heartbeat: Utc::now(),
                },
            );
        }

        self.metrics.record_subscriber_connected();
        info!("Subscriber {} connected", client_id);
        self.send_to(client_id, &greeting).await;
    }

    pub async fn remove(&self, client_id: Uuid) -> bool {
        let removed = self.subscriptions.write().await.remove(&client_id).is_some();
        if removed {
            info!("Subscriber {} disconnected", client_id);
            self.metrics.record_subscriber_disconnected();
        }
        removed
    }

    pub async fn update_subscription(
        &self,
        client_id: Uuid,
        project_id: Option<String>,
        session_id: Option<String>,
    ) {
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(subscription) = subscriptions.get_mut(&client_id) {
            debug!(
                "Subscriber {} now watching project={:?} session={:?}",
                client_id, project_id, session_id
            );
            subscription.project_id = project_id;
            subscription.session_id = session_id;
        }
    }

    pub async fn touch(&self, client_id: Uuid) {
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(subscription) = subscriptions.get_mut(&client_id) {
            subscription.last_heartbeat = Utc::now();
        }
    }

    pub async fn subscription_of(&self, client_id: Uuid) -> Option<(Option<String>, Option<String>)> {
        self.subscriptions
            .read()
            .await
            .get(&client_id)
            .map(|s| (s.project_id.clone(), s.session_id.clone()))
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Sends one frame to one client. A dead socket removes the
    /// subscription.
    pub async fn send_to(&self, client_id: Uuid, message: &ServerMessage) -> bool {
        let Ok(text) = serde_json::to_string(message) else {
            return false;
        };

        let sent = {
            let subscriptions = self.subscriptions.read().await;
            match subscriptions.get(&client_id) {
                Some(subscription) => subscription.outbound.send(Message::Text(text)).is_ok(),
                None => return false,
            }
        };

        if !sent {
            self.remove(client_id).await;
        }
        sent
    }

    // --- app-facing broadcasts -------------------------------------------

    pub async fn broadcast_build_started(
        &self,
        project_id: &str,
        session_id: Option<String>,
        build_id: &str,
    ) {
        self.append(
            project_id,
            session_id,
            BatchEntry::new("build-started", json!({ "buildId": build_id })),
            true,
        )
        .await;
    }

    pub async fn broadcast_todos_update(
        &self,
        project_id: &str,
        session_id: Option<String>,
        todos: Value,
        active_index: i64,
        phase: Option<String>,
    ) {
        self.append(
            project_id,
            session_id,
            BatchEntry::new(
                "todos-update",
                json!({ "todos": todos, "activeIndex": active_index, "phase": phase }),
            ),
            true,
        )
        .await;
    }

    pub async fn broadcast_todo_completed(
        &self,
        project_id: &str,
        session_id: Option<String>,
        todo_index: i64,
    ) {
        self.append(
            project_id,
            session_id,
            BatchEntry::new("todo-completed", json!({ "todoIndex": todo_index })),
            true,
        )
        .await;
    }

    pub async fn broadcast_tool_call(
        &self,
        project_id: &str,
        session_id: Option<String>,
        tool_call: ToolCallUpdate,
    ) {
        let data = serde_json::to_value(&tool_call).unwrap_or(Value::Null);
        self.append(project_id, session_id, BatchEntry::new("tool-call", data), true)
            .await;
    }

    pub async fn broadcast_build_complete(
        &self,
        project_id: &str,
        session_id: Option<String>,
        status: &str,
        summary: Option<String>,
    ) {
        self.append(
            project_id,
            session_id,
            BatchEntry::new(
                "build-complete",
                json!({ "status": status, "summary": summary }),
            ),
            true,
        )
        .await;
    }

    /// Coarse state snapshot; rides the batch window.
    pub async fn broadcast_state_update(
        &self,
        project_id: &str,
        session_id: Option<String>,
        partial_state: Value,
    ) {
        self.append(
            project_id,
            session_id,
            BatchEntry::new("state-update", partial_state),
            false,
        )
        .await;
    }

    /// Fans a runner event out to the project's subscribers. Terminal
    /// events flush immediately, the rest ride the batch window.
    pub async fn broadcast_runner_event(&self, event: &Event) {
        let Some(project_id) = event.project_id.clone() else {
            return;
        };

        let mut data = serde_json::to_value(&event.payload).unwrap_or(Value::Null);
        if let Some(object) = data.as_object_mut() {
            object.remove("type");
            if let Some(command_id) = event.command_id {
                object.insert("commandId".to_string(), json!(command_id));
            }
        }

        let immediate = matches!(
            event.payload,
            EventPayload::BuildCompleted { .. }
                | EventPayload::BuildFailed { .. }
                | EventPayload::Error { .. }
        );

        let entry = BatchEntry {
            entry_type: event.event_type().to_string(),
            data,
            timestamp: event.timestamp,
            trace: event.trace.clone(),
        };

        self.append(&project_id, None, entry, immediate).await;
    }

    async fn append(
        &self,
        project_id: &str,
        session_id: Option<String>,
        entry: BatchEntry,
        immediate: bool,
    ) {
        let key: BatchKey = (project_id.to_string(), session_id);
        let over_limit = {
            let mut batches = self.batches.lock().await;
            let batch = batches.entry(key.clone()).or_default();
            batch.push(entry);
            batch.len() > self.batch_max_entries
        };

        if immediate || over_limit {
            self.flush_key(&key).await;
        }
    }

    /// Delivers one pending batch to every matching subscription. A batch
    /// with no audience is discarded.
    async fn flush_key(&self, key: &BatchKey) {
        let Some(entries) = self.batches.lock().await.remove(key) else {
            return;
        };
        if entries.is_empty() {
            return;
        }

        let (project_id, session_id) = key;
        // Snapshot the audience so sends happen outside the lock.
        let targets: Vec<(Uuid, mpsc::UnboundedSender<Message>)> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .values()
                .filter(|s| {
                    s.project_id.as_deref() == Some(project_id.as_str())
                        && (s.session_id.is_none() || s.session_id == *session_id)
                })
                .map(|s| (s.client_id, s.outbound.clone()))
                .collect()
        };

        if targets.is_empty() {
            debug!(
                "Discarding batch of {} entries for project {} with no subscribers",
                entries.len(),
                project_id
            );
            return;
        }

        let message = ServerMessage::BatchUpdate {
            project_id: project_id.clone(),
            session_id: session_id.clone(),
            events: entries,
            timestamp: Utc::now(),
        };
        let Ok(text) = serde_json::to_string(&message) else {
            return;
        };

        let mut closed = Vec::new();
        for (client_id, outbound) in targets {
            if outbound.send(Message::Text(text.clone())).is_err() {
                warn!("Dropping subscriber {} after failed send", client_id);
                closed.push(client_id);
            }
        }
        for client_id in closed {
            self.remove(client_id).await;
        }

        self.metrics.record_batch_flushed();
    }

    /// Flushes every pending batch. Runs on the batch window timer.
    pub async fn flush_all(&self) {
        let keys: Vec<BatchKey> = self.batches.lock().await.keys().cloned().collect();
        join_all(keys.iter().map(|key| self.flush_key(key))).await;
    }

    pub async fn pending_batch_count(&self) -> usize {
        self.batches.lock().await.len()
    }

    /// Emits the periodic hub heartbeat to every client.
    pub async fn send_heartbeats(&self) {
        let client_ids: Vec<Uuid> = self.subscriptions.read().await.keys().copied().collect();
        for client_id in client_ids {
            self.send_to(client_id, &ServerMessage::Heartbeat).await;
        }
    }

    /// Closes every client silent for longer than `timeout`.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<Uuid> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();

        let stale: Vec<(Uuid, mpsc::UnboundedSender<Message>)> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .values()
                .filter(|s| s.last_heartbeat < cutoff)
                .map(|s| (s.client_id, s.outbound.clone()))
                .collect()
        };

        let mut swept = Vec::with_capacity(stale.len());
        for (client_id, outbound) in stale {
            warn!("Closing stale subscriber {}", client_id);
            let _ = outbound.send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "Heartbeat timeout".into(),
            })));
            self.remove(client_id).await;
            swept.push(client_id);
        }
        swept
    }

    /// Closes every subscriber with 1000. Used on broker shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<Subscription> = {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions.drain().map(|(_, s)| s).collect()
        };
        for subscription in drained {
            let _ = subscription.outbound.send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "Broker shutting down".into(),
            })));
            self.metrics.record_subscriber_disconnected();
        }
        self.batches.lock().await.clear();
    }
}
