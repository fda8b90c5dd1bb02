use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::broker::monitoring::BrokerMetrics;
use crate::broker::protocol::Command;
use crate::broker::router::CommandSink;
use crate::config::Config;

pub type SuccessCallback = Box<dyn FnOnce() + Send>;
pub type FailureCallback = Box<dyn FnOnce(&str) + Send>;

pub const QUEUE_FULL: &str = "Queue full";
pub const COMMAND_EXPIRED: &str = "Command expired";
pub const MAX_ATTEMPTS_REACHED: &str = "Max retry attempts reached";
pub const SHUTTING_DOWN: &str = "Broker shutting down";

/// Per-command overrides and completion callbacks.
#[derive(Default)]
pub struct EnqueueOptions {
    pub ttl: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub on_success: Option<SuccessCallback>,
    pub on_failure: Option<FailureCallback>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn on_success(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_failure(mut self, callback: impl FnOnce(&str) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueResult {
    pub sent: bool,
    pub queued: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub sent: usize,
    pub failed: usize,
    pub remaining: usize,
}

struct QueuedCommand {
    command: Command,
    queued_at: DateTime<Utc>,
    attempts: u32,
    max_attempts: u32,
    ttl: Duration,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

impl QueuedCommand {
    fn is_expired(&self) -> bool {
        let age = Utc::now() - self.queued_at;
        age > chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX)
    }

    fn succeed(&mut self) {
        if let Some(callback) = self.on_success.take() {
            callback();
        }
    }

    fn fail(&mut self, reason: &str) {
        if let Some(callback) = self.on_failure.take() {
            callback(reason);
        }
    }
}

/// Per-runner FIFO of commands that could not be delivered immediately.
/// Queues survive runner disconnects; a reconnect drains them in order.
#[derive(Clone)]
pub struct CommandQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<QueuedCommand>>>>,
    sink: Arc<dyn CommandSink>,
    metrics: BrokerMetrics,
    max_queue_size: usize,
    default_ttl: Duration,
    default_max_attempts: u32,
}

impl CommandQueue {
    pub fn new(sink: Arc<dyn CommandSink>, metrics: BrokerMetrics, config: &Config) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            sink,
            metrics,
            max_queue_size: config.max_queue_size,
            default_ttl: config.command_ttl(),
            default_max_attempts: config.max_delivery_attempts,
        }
    }

    /// Attempts an immediate send; on failure the command is parked on the
    /// runner's queue. A full queue drops its oldest entry.
    pub async fn enqueue(
        &self,
        runner_id: &str,
        command: Command,
        options: EnqueueOptions,
    ) -> EnqueueResult {
        let mut entry = QueuedCommand {
            command,
            queued_at: Utc::now(),
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(self.default_max_attempts),
            ttl: options.ttl.unwrap_or(self.default_ttl),
            on_success: options.on_success,
            on_failure: options.on_failure,
        };

        if self.sink.send_command(runner_id, &entry.command).await {
            entry.succeed();
            return EnqueueResult {
                sent: true,
                queued: false,
            };
        }

        let dropped = {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(runner_id.to_string()).or_default();
            let dropped = if queue.len() >= self.max_queue_size {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(entry);
            dropped
        };

        if let Some(mut oldest) = dropped {
            debug!(
                "Queue for runner {} full, dropping oldest {} command",
                runner_id,
                oldest.command.command_type()
            );
            self.metrics.record_queue_drop();
            oldest.fail(QUEUE_FULL);
        }

        self.metrics.record_command_queued();
        EnqueueResult {
            sent: false,
            queued: true,
        }
    }

    /// Drains deliverable commands for a runner that just (re)connected.
    /// Expired and exhausted entries are dropped with their failure
    /// callback; entries the socket still refuses stay queued in place.
    pub async fn process_queue(&self, runner_id: &str) -> ProcessResult {
        let Some(pending) = self.queues.lock().await.remove(runner_id) else {
            return ProcessResult::default();
        };

        let mut result = ProcessResult::default();
        let mut remaining = VecDeque::new();

        for mut entry in pending {
            if entry.is_expired() {
                entry.fail(COMMAND_EXPIRED);
                result.failed += 1;
                continue;
            }

            if entry.attempts >= entry.max_attempts {
                entry.fail(MAX_ATTEMPTS_REACHED);
                result.failed += 1;
                continue;
            }

            entry.attempts += 1;
            if self.sink.send_command(runner_id, &entry.command).await {
                entry.succeed();
                result.sent += 1;
            } else {
                remaining.push_back(entry);
            }
        }

        result.remaining = remaining.len();
        if !remaining.is_empty() {
            let mut queues = self.queues.lock().await;
            // Commands enqueued while we were draining go behind the ones
            // that were already waiting.
            if let Some(newer) = queues.remove(runner_id) {
                remaining.extend(newer);
            }
            result.remaining = remaining.len();
            queues.insert(runner_id.to_string(), remaining);
        }

        if result.sent > 0 || result.failed > 0 {
            info!(
                "Processed queue for runner {}: {} sent, {} failed, {} remaining",
                runner_id, result.sent, result.failed, result.remaining
            );
        }
        result
    }

    /// Drops every entry whose TTL has elapsed. Runs on the sweep interval.
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<QueuedCommand> = {
            let mut queues = self.queues.lock().await;
            let mut expired = Vec::new();
            for queue in queues.values_mut() {
                let mut kept = VecDeque::with_capacity(queue.len());
                while let Some(entry) = queue.pop_front() {
                    if entry.is_expired() {
                        expired.push(entry);
                    } else {
                        kept.push_back(entry);
                    }
                }
                *queue = kept;
            }
            queues.retain(|_, q| !q.is_empty());
            expired
        };

        let count = expired.len();
        for mut entry in expired {
            debug!(
                "Expiring queued {} command for runner after TTL",
                entry.command.command_type()
            );
            entry.fail(COMMAND_EXPIRED);
        }
        count
    }

    pub async fn pending_count(&self, runner_id: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(runner_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub async fn total_pending(&self) -> usize {
        self.queues.lock().await.values().map(|q| q.len()).sum()
    }

    /// Fails every queued command exactly once. Used on broker shutdown.
    pub async fn drain_all(&self) {
        let drained: Vec<QueuedCommand> = {
            let mut queues = self.queues.lock().await;
            queues.drain().flat_map(|(_, q)| q).collect()
        };
        for mut entry in drained {
            entry.fail(SHUTTING_DOWN);
        }
    }
}
