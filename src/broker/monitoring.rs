use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Process-wide broker counters, exposed through the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub runners_connected: u64,
    pub runners_disconnected: u64,
    pub active_runners: u64,
    pub subscribers_connected: u64,
    pub active_subscribers: u64,
    pub commands_sent: u64,
    pub commands_queued: u64,
    pub queue_drops: u64,
    pub events_received: u64,
    pub parse_errors: u64,
    pub unknown_message_types: u64,
    pub send_errors: u64,
    pub batches_flushed: u64,
    pub proxy_requests: u64,
    pub proxy_timeouts: u64,
    pub hmr_connections: u64,
    pub last_updated: DateTime<Utc>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            runners_connected: 0,
            runners_disconnected: 0,
            active_runners: 0,
            subscribers_connected: 0,
            active_subscribers: 0,
            commands_sent: 0,
            commands_queued: 0,
            queue_drops: 0,
            events_received: 0,
            parse_errors: 0,
            unknown_message_types: 0,
            send_errors: 0,
            batches_flushed: 0,
            proxy_requests: 0,
            proxy_timeouts: 0,
            hmr_connections: 0,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Clone, Default)]
pub struct BrokerMetrics {
    inner: Arc<RwLock<MetricsSnapshot>>,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F: FnOnce(&mut MetricsSnapshot)>(&self, f: F) {
        if let Ok(mut snapshot) = self.inner.write() {
            f(&mut snapshot);
            snapshot.last_updated = Utc::now();
        }
    }

    pub fn record_runner_connected(&self) {
        self.update(|m| {
            m.runners_connected += 1;
            m.active_runners += 1;
        });
    }

    pub fn record_runner_disconnected(&self) {
        self.update(|m| {
            m.runners_disconnected += 1;
            m.active_runners = m.active_runners.saturating_sub(1);
        });
    }

    pub fn record_subscriber_connected(&self) {
        self.update(|m| {
            m.subscribers_connected += 1;
            m.active_subscribers += 1;
        });
    }

    pub fn record_subscriber_disconnected(&self) {
        self.update(|m| {
            m.active_subscribers = m.active_subscribers.saturating_sub(1);
        });
    }

    pub fn record_command_sent(&self) {
        self.update(|m| m.commands_sent += 1);
    }

    pub fn record_command_queued(&self) {
        self.update(|m| m.commands_queued += 1);
    }

    pub fn record_queue_drop(&self) {
        self.update(|m| m.queue_drops += 1);
    }

    pub fn record_event_received(&self) {
        self.update(|m| m.events_received += 1);
    }

    pub fn record_parse_error(&self) {
        self.update(|m| m.parse_errors += 1);
    }

    pub fn record_unknown_message_type(&self) {
        self.update(|m| m.unknown_message_types += 1);
    }

    pub fn record_send_error(&self) {
        self.update(|m| m.send_errors += 1);
    }

    pub fn record_batch_flushed(&self) {
        self.update(|m| m.batches_flushed += 1);
    }

    pub fn record_proxy_request(&self) {
        self.update(|m| m.proxy_requests += 1);
    }

    pub fn record_proxy_timeout(&self) {
        self.update(|m| m.proxy_timeouts += 1);
    }

    pub fn record_hmr_connection(&self) {
        self.update(|m| m.hmr_connections += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}
