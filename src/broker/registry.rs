use axum::extract::ws::{CloseFrame, Message, close_code};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::monitoring::BrokerMetrics;

/// Observer invoked with `(runner_id, connected, affected_project_ids)`
/// whenever a runner comes up or goes away.
pub type RunnerStatusCallback = Arc<dyn Fn(&str, bool, &[String]) + Send + Sync>;

/// State for one live runner socket. Outbound writes are serialized through
/// the `outbound` channel; a dedicated writer task owns the sink half.
pub struct RunnerConnection {
    pub runner_id: String,
    pub outbound: mpsc::UnboundedSender<Message>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    pub project_ids: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConnectionInfo {
    pub runner_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub project_ids: Vec<String>,
}

/// Tracks the fleet of authenticated runner connections. Enforces the
/// one-connection-per-runner-id invariant and owns runner liveness.
#[derive(Clone)]
pub struct RunnerRegistry {
    runners: Arc<RwLock<HashMap<String, RunnerConnection>>>,
    observers: Arc<RwLock<Vec<RunnerStatusCallback>>>,
    metrics: BrokerMetrics,
}

impl RunnerRegistry {
    pub fn new(metrics: BrokerMetrics) -> Self {
        Self {
            runners: Arc::new(RwLock::new(HashMap::new())),
            observers: Arc::new(RwLock::new(Vec::new())),
            metrics,
        }
    }

    /// Registers a freshly upgraded runner socket. A prior connection under
    /// the same id is closed with 1000 and replaced.
    pub async fn register(
        &self,
        runner_id: &str,
        outbound: mpsc::UnboundedSender<Message>,
        user_id: Option<Uuid>,
    ) {
        let evicted = {
            let mut runners = self.runners.write().await;
            let evicted = runners.remove(runner_id);
            runners.insert(
                runner_id.to_string(),
                RunnerConnection {
                    runner_id: runner_id.to_string(),
                    outbound,
                    connected_at: Utc::now(),
                    last_heartbeat: Utc::now(),
                    user_id,
                    project_ids: HashSet::new(),
                },
            );
            evicted
        };

        if let Some(previous) = evicted {
            warn!(
                "Runner {} reconnected, evicting prior connection",
                runner_id
            );
            let _ = previous.outbound.send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "Replaced by new connection".into(),
            })));
            self.metrics.record_runner_disconnected();
        }

        info!("Runner {} connected", runner_id);
        self.metrics.record_runner_connected();
        self.notify(runner_id, true, &[]).await;
    }

    /// Removes a runner connection, but only if `outbound` still identifies
    /// the registered one. An evicted connection's cleanup therefore cannot
    /// remove its successor.
    pub async fn unregister(
        &self,
        runner_id: &str,
        outbound: &mpsc::UnboundedSender<Message>,
    ) -> bool {
        let removed = {
            let mut runners = self.runners.write().await;
            match runners.get(runner_id) {
                Some(current) if current.outbound.same_channel(outbound) => {
                    runners.remove(runner_id)
                }
                _ => None,
            }
        };

        match removed {
            Some(connection) => {
                info!("Runner {} disconnected", runner_id);
                self.metrics.record_runner_disconnected();
                let project_ids: Vec<String> = connection.project_ids.into_iter().collect();
                self.notify(runner_id, false, &project_ids).await;
                true
            }
            None => false,
        }
    }

    /// Records activity on the runner socket. Any inbound frame counts.
    pub async fn touch(&self, runner_id: &str) {
        let mut runners = self.runners.write().await;
        if let Some(connection) = runners.get_mut(runner_id) {
            connection.last_heartbeat = Utc::now();
        }
    }

    /// Remembers that `project_id` is served by this runner, for status
    /// notifications on disconnect.
    pub async fn record_project(&self, runner_id: &str, project_id: &str) {
        if project_id.is_empty() {
            return;
        }
        let mut runners = self.runners.write().await;
        if let Some(connection) = runners.get_mut(runner_id) {
            connection.project_ids.insert(project_id.to_string());
        }
    }

    pub async fn is_connected(&self, runner_id: &str) -> bool {
        self.runners.read().await.contains_key(runner_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.runners.read().await.len()
    }

    pub async fn outbound_for(&self, runner_id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        self.runners
            .read()
            .await
            .get(runner_id)
            .map(|c| c.outbound.clone())
    }

    /// Lists live runner connections, optionally scoped to an owning user.
    pub async fn list_connections(&self, user_id: Option<Uuid>) -> Vec<RunnerConnectionInfo> {
        self.runners
            .read()
            .await
            .values()
            .filter(|c| user_id.is_none() || c.user_id == user_id)
            .map(|c| RunnerConnectionInfo {
                runner_id: c.runner_id.clone(),
                connected_at: c.connected_at,
                last_heartbeat: c.last_heartbeat,
                user_id: c.user_id,
                project_ids: c.project_ids.iter().cloned().collect(),
            })
            .collect()
    }

    pub async fn on_runner_status_change(&self, callback: RunnerStatusCallback) {
        self.observers.write().await.push(callback);
    }

    async fn notify(&self, runner_id: &str, connected: bool, project_ids: &[String]) {
        let observers: Vec<RunnerStatusCallback> =
            self.observers.read().await.iter().cloned().collect();
        for observer in observers {
            observer(runner_id, connected, project_ids);
        }
    }

    /// Closes every runner whose last heartbeat is older than `timeout`.
    /// Returns the ids that were swept.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();

        let stale: Vec<RunnerConnection> = {
            let mut runners = self.runners.write().await;
            let stale_ids: Vec<String> = runners
                .values()
                .filter(|c| c.last_heartbeat < cutoff)
                .map(|c| c.runner_id.clone())
                .collect();
            stale_ids
                .iter()
                .filter_map(|id| runners.remove(id))
                .collect()
        };

        let mut swept = Vec::with_capacity(stale.len());
        for connection in stale {
            warn!(
                "Closing stale runner {} (last heartbeat {})",
                connection.runner_id, connection.last_heartbeat
            );
            let _ = connection.outbound.send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "Heartbeat timeout".into(),
            })));
            self.metrics.record_runner_disconnected();
            let project_ids: Vec<String> = connection.project_ids.iter().cloned().collect();
            self.notify(&connection.runner_id, false, &project_ids).await;
            swept.push(connection.runner_id);
        }
        swept
    }

    /// Closes every connection with 1000. Used on broker shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<RunnerConnection> = {
            let mut runners = self.runners.write().await;
            runners.drain().map(|(_, c)| c).collect()
        };

        for connection in drained {
            debug!("Closing runner {} for shutdown", connection.runner_id);
            let _ = connection.outbound.send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "Broker shutting down".into(),
            })));
            self.metrics.record_runner_disconnected();
            let project_ids: Vec<String> = connection.project_ids.iter().cloned().collect();
            self.notify(&connection.runner_id, false, &project_ids).await;
        }
    }
}
