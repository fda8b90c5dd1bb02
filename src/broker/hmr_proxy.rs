use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::monitoring::BrokerMetrics;
use crate::broker::protocol::{Command, CommandPayload, Event, EventPayload};
use crate::broker::router::CommandSink;
use crate::error::{BrokerError, BrokerResult};

/// Callbacks wired to one tunneled HMR connection. All four are invoked
/// outside the connection table lock.
#[derive(Clone)]
pub struct HmrCallbacks {
    pub on_connected: Arc<dyn Fn() + Send + Sync>,
    pub on_message: Arc<dyn Fn(&str) + Send + Sync>,
    pub on_disconnected: Arc<dyn Fn(u16, &str) + Send + Sync>,
    pub on_error: Arc<dyn Fn(&str) + Send + Sync>,
}

impl HmrCallbacks {
    pub fn noop() -> Self {
        Self {
            on_connected: Arc::new(|| {}),
            on_message: Arc::new(|_| {}),
            on_disconnected: Arc::new(|_, _| {}),
            on_error: Arc::new(|_| {}),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmrConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HmrConnectionInfo {
    pub connection_id: String,
    pub runner_id: String,
    pub project_id: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub status: String,
    pub opened_at: DateTime<Utc>,
}

struct HmrConnection {
    runner_id: String,
    project_id: String,
    port: u16,
    protocol: Option<String>,
    status: HmrConnectionStatus,
    callbacks: HmrCallbacks,
    opened_at: DateTime<Utc>,
}

/// Long-lived HMR WebSocket tunnels, keyed by the caller-assigned
/// connection id. The id is preserved end-to-end so frames from both
/// directions correlate.
#[derive(Clone)]
pub struct HmrProxyManager {
    connections: Arc<Mutex<HashMap<String, HmrConnection>>>,
    sink: Arc<dyn CommandSink>,
    metrics: BrokerMetrics,
    connect_timeout: Duration,
}

impl HmrProxyManager {
    pub fn new(
        sink: Arc<dyn CommandSink>,
        metrics: BrokerMetrics,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            sink,
            metrics,
            connect_timeout,
        }
    }

    /// Opens a tunnel to the dev server on `port` inside `runner_id`. The
    /// connect deadline fires `on_error("Connection timeout")` if the
    /// runner never confirms.
    pub async fn connect(
        &self,
        connection_id: &str,
        runner_id: &str,
        project_id: &str,
        port: u16,
        protocol: Option<String>,
        callbacks: HmrCallbacks,
    ) -> BrokerResult<()> {
        {
            let mut connections = self.connections.lock().await;
            connections.insert(
                connection_id.to_string(),
                HmrConnection {
                    runner_id: runner_id.to_string(),
                    project_id: project_id.to_string(),
                    port,
                    protocol: protocol.clone(),
                    status: HmrConnectionStatus::Connecting,
                    callbacks,
                    opened_at: Utc::now(),
                },
            );
        }

        let command = Command::new(
            project_id,
            CommandPayload::HmrConnect {
                connection_id: connection_id.to_string(),
                port,
                protocol,
            },
        );

        if !self.sink.send_command(runner_id, &command).await {
            self.connections.lock().await.remove(connection_id);
            return Err(BrokerError::runner_unavailable(runner_id));
        }

        info!(
            "HMR connect {} -> runner {} port {}",
            connection_id, runner_id, port
        );
        self.metrics.record_hmr_connection();

        // Arm the connect deadline; it only acts while the entry is still
        // in the connecting state.
        let connections = self.connections.clone();
        let connection_id = connection_id.to_string();
        let connect_timeout = self.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(connect_timeout).await;
            let timed_out = {
                let mut connections = connections.lock().await;
                match connections.get(&connection_id) {
                    Some(entry) if entry.status == HmrConnectionStatus::Connecting => {
                        connections.remove(&connection_id)
                    }
                    _ => None,
                }
            };
            if let Some(entry) = timed_out {
                warn!("HMR connection {} timed out while connecting", connection_id);
                (entry.callbacks.on_error)("Connection timeout");
            }
        });

        Ok(())
    }

    /// Forwards one browser frame into the tunnel. No-op unless the tunnel
    /// is connected.
    pub async fn send(&self, connection_id: &str, frame: &str) -> bool {
        let (runner_id, project_id) = {
            let connections = self.connections.lock().await;
            match connections.get(connection_id) {
                Some(entry) if entry.status == HmrConnectionStatus::Connected => {
                    (entry.runner_id.clone(), entry.project_id.clone())
                }
                _ => return false,
            }
        };

        let command = Command::new(
            project_id,
            CommandPayload::HmrMessage {
                connection_id: connection_id.to_string(),
                message: frame.to_string(),
            },
        );
        self.sink.send_command(&runner_id, &command).await
    }

    /// Tears a tunnel down from the browser side. Caller-initiated, so no
    /// callback fires.
    pub async fn disconnect(&self, connection_id: &str) -> bool {
        let Some(entry) = self.connections.lock().await.remove(connection_id) else {
            return false;
        };

        let command = Command::new(
            entry.project_id,
            CommandPayload::HmrDisconnect {
                connection_id: connection_id.to_string(),
            },
        );
        self.sink.send_command(&entry.runner_id, &command).await;
        info!("HMR connection {} disconnected locally", connection_id);
        true
    }

    /// Applies one runner event to the tunnel state machine. Non-HMR
    /// events are ignored.
    pub async fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::HmrConnected { connection_id } => {
                let callbacks = {
                    let mut connections = self.connections.lock().await;
                    connections.get_mut(connection_id).map(|entry| {
                        entry.status = HmrConnectionStatus::Connected;
                        entry.callbacks.clone()
                    })
                };
                if let Some(callbacks) = callbacks {
                    debug!("HMR connection {} established", connection_id);
                    (callbacks.on_connected)();
                }
            }
            EventPayload::HmrMessage {
                connection_id,
                message,
            } => {
                let callbacks = {
                    let connections = self.connections.lock().await;
                    connections.get(connection_id).map(|e| e.callbacks.clone())
                };
                if let Some(callbacks) = callbacks {
                    (callbacks.on_message)(message);
                }
            }
            EventPayload::HmrDisconnected {
                connection_id,
                code,
                reason,
            } => {
                if let Some(entry) = self.connections.lock().await.remove(connection_id) {
                    debug!("HMR connection {} closed by runner", connection_id);
                    (entry.callbacks.on_disconnected)(
                        code.unwrap_or(1000),
                        reason.as_deref().unwrap_or(""),
                    );
                }
            }
            EventPayload::HmrError {
                connection_id,
                error,
            } => {
                if let Some(entry) = self.connections.lock().await.remove(connection_id) {
                    warn!("HMR connection {} failed: {}", connection_id, error);
                    (entry.callbacks.on_error)(error);
                }
            }
            _ => {}
        }
    }

    /// Tears down every tunnel owned by a runner that went away.
    pub async fn fail_runner(&self, runner_id: &str) {
        let dropped: Vec<(String, HmrConnection)> = {
            let mut connections = self.connections.lock().await;
            let ids: Vec<String> = connections
                .iter()
                .filter(|(_, entry)| entry.runner_id == runner_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| connections.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (connection_id, entry) in dropped {
            debug!(
                "Tearing down HMR connection {} after runner {} disconnect",
                connection_id, runner_id
            );
            (entry.callbacks.on_disconnected)(1001, "Runner disconnected");
        }
    }

    /// Live tunnels, for the stats endpoint.
    pub async fn list_connections(&self) -> Vec<HmrConnectionInfo> {
        self.connections
            .lock()
            .await
            .iter()
            .map(|(connection_id, entry)| HmrConnectionInfo {
                connection_id: connection_id.clone(),
                runner_id: entry.runner_id.clone(),
                project_id: entry.project_id.clone(),
                port: entry.port,
                protocol: entry.protocol.clone(),
                status: format!("{:?}", entry.status).to_lowercase(),
                opened_at: entry.opened_at,
            })
            .collect()
    }

    pub async fn status_of(&self, connection_id: &str) -> Option<HmrConnectionStatus> {
        self.connections
            .lock()
            .await
            .get(connection_id)
            .map(|e| e.status)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Fails every tunnel exactly once. Used on broker shutdown.
    pub async fn drain_all(&self) {
        let drained: Vec<HmrConnection> = {
            let mut connections = self.connections.lock().await;
            connections.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            (entry.callbacks.on_error)("Broker shutting down");
        }
    }
}
