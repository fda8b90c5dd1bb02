use async_trait::async_trait;
use axum::extract::ws::Message;
use tracing::{debug, warn};

use crate::broker::monitoring::BrokerMetrics;
use crate::broker::protocol::{Command, current_trace};
use crate::broker::registry::RunnerRegistry;

/// Seam between command producers (queue, proxy managers) and the wire.
/// Lets the producers be exercised in tests against a mock sink.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Returns whether the command was handed to the runner's socket.
    /// Failures are reported, never raised.
    async fn send_command(&self, runner_id: &str, command: &Command) -> bool;
}

/// Routes typed commands onto a named runner's socket.
#[derive(Clone)]
pub struct CommandRouter {
    registry: RunnerRegistry,
    metrics: BrokerMetrics,
}

impl CommandRouter {
    pub fn new(registry: RunnerRegistry, metrics: BrokerMetrics) -> Self {
        Self { registry, metrics }
    }

    pub async fn send_command_to_runner(&self, runner_id: &str, command: &Command) -> bool {
        let Some(outbound) = self.registry.outbound_for(runner_id).await else {
            debug!(
                "Cannot send {} command: runner {} not connected",
                command.command_type(),
                runner_id
            );
            return false;
        };

        // Attach the active trace context unless the command already
        // carries one.
        let mut command = command.clone();
        if command.trace.is_none() {
            command.trace = current_trace();
        }

        let text = match serde_json::to_string(&command) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize {} command: {}", command.command_type(), e);
                self.metrics.record_send_error();
                return false;
            }
        };

        if outbound.send(Message::Text(text)).is_err() {
            warn!(
                "Send failed for {} command to runner {}: socket closed",
                command.command_type(),
                runner_id
            );
            self.metrics.record_send_error();
            return false;
        }

        self.registry
            .record_project(runner_id, &command.project_id)
            .await;
        self.metrics.record_command_sent();
        true
    }
}

#[async_trait]
impl CommandSink for CommandRouter {
    async fn send_command(&self, runner_id: &str, command: &Command) -> bool {
        self.send_command_to_runner(runner_id, command).await
    }
}
