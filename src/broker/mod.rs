pub mod command_events;
pub mod handler;
pub mod hmr_proxy;
pub mod http_proxy;
pub mod monitoring;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod router;
pub mod subscribers;

// Re-export commonly used types for convenience
pub use command_events::{CommandEventStream, CommandEventSubscription, EventHandler};
pub use handler::{BrokerHandler, BrokerState, BrokerStats, RunnersResponse};
pub use hmr_proxy::{HmrCallbacks, HmrConnectionStatus, HmrProxyManager};
pub use http_proxy::{HttpProxyManager, ProxyRequest, ProxyResponse};
pub use monitoring::{BrokerMetrics, MetricsSnapshot};
pub use protocol::{
    Command, CommandPayload, DecodedCommand, DecodedEvent, Event, EventPayload, TraceContext,
    current_trace, decode_command, decode_event, with_trace,
};
pub use queue::{CommandQueue, EnqueueOptions, EnqueueResult, ProcessResult};
pub use registry::{RunnerConnectionInfo, RunnerRegistry, RunnerStatusCallback};
pub use router::{CommandRouter, CommandSink};
pub use subscribers::{BatchEntry, ClientMessage, ServerMessage, SubscriberHub, ToolCallUpdate};

use axum::{Router, routing::get};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::BrokerResult;

/// The broker core. One value, owned by `main`, shared with the HTTP layer
/// through [`BrokerState`]; every collaborator receives it by reference.
pub struct Broker {
    pub config: Config,
    pub metrics: BrokerMetrics,
    pub registry: RunnerRegistry,
    pub router: CommandRouter,
    pub queue: CommandQueue,
    pub subscribers: SubscriberHub,
    pub command_events: CommandEventStream,
    pub http_proxy: HttpProxyManager,
    pub hmr_proxy: HmrProxyManager,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Broker {
    pub fn new(config: Config) -> Arc<Self> {
        let metrics = BrokerMetrics::new();
        let registry = RunnerRegistry::new(metrics.clone());
        let router = CommandRouter::new(registry.clone(), metrics.clone());
        let sink: Arc<dyn CommandSink> = Arc::new(router.clone());
        let queue = CommandQueue::new(sink.clone(), metrics.clone(), &config);
        let subscribers = SubscriberHub::new(metrics.clone(), config.batch_max_entries);
        let command_events = CommandEventStream::new();
        let http_proxy =
            HttpProxyManager::new(sink.clone(), metrics.clone(), config.proxy_timeout());
        let hmr_proxy = HmrProxyManager::new(sink, metrics.clone(), config.hmr_connect_timeout());

        Arc::new(Self {
            config,
            metrics,
            registry,
            router,
            queue,
            subscribers,
            command_events,
            http_proxy,
            hmr_proxy,
            background_tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Spawns the periodic timers: batch flush, hub heartbeat + client
    /// sweep, runner stale sweep, and queue TTL sweep.
    pub async fn start_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.background_tasks.lock().await;

        tasks.push(tokio::spawn({
            let subscribers = self.subscribers.clone();
            let delay = self.config.batch_delay();
            async move {
                let mut ticker = tokio::time::interval(delay);
                loop {
                    ticker.tick().await;
                    subscribers.flush_all().await;
                }
            }
        }));

        tasks.push(tokio::spawn({
            let subscribers = self.subscribers.clone();
            let interval = self.config.client_heartbeat_interval();
            let stale_timeout = self.config.client_stale_timeout();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    subscribers.send_heartbeats().await;
                    subscribers.sweep_stale(stale_timeout).await;
                }
            }
        }));

        tasks.push(tokio::spawn({
            let registry = self.registry.clone();
            let http_proxy = self.http_proxy.clone();
            let hmr_proxy = self.hmr_proxy.clone();
            let interval = self.config.runner_sweep_interval();
            let stale_timeout = self.config.runner_stale_timeout();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    for runner_id in registry.sweep_stale(stale_timeout).await {
                        http_proxy.fail_runner(&runner_id).await;
                        hmr_proxy.fail_runner(&runner_id).await;
                    }
                }
            }
        }));

        tasks.push(tokio::spawn({
            let queue = self.queue.clone();
            let interval = self.config.queue_sweep_interval();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    queue.sweep_expired().await;
                }
            }
        }));
    }

    /// Stops the timers, fails every queued command, pending proxy request
    /// and HMR tunnel exactly once, and closes all sockets with 1000.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Broker shutting down");

        for task in self.background_tasks.lock().await.drain(..) {
            task.abort();
        }

        self.queue.drain_all().await;
        self.http_proxy.drain_all().await;
        self.hmr_proxy.drain_all().await;
        self.command_events.clear();
        self.registry.close_all().await;
        self.subscribers.close_all().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // --- programmatic surface the app consumes ---------------------------

    pub async fn send_command_to_runner(&self, runner_id: &str, command: &Command) -> bool {
        self.router.send_command_to_runner(runner_id, command).await
    }

    pub async fn enqueue_command(
        &self,
        runner_id: &str,
        command: Command,
        options: EnqueueOptions,
    ) -> EnqueueResult {
        self.queue.enqueue(runner_id, command, options).await
    }

    pub async fn list_runner_connections(
        &self,
        user_id: Option<Uuid>,
    ) -> Vec<RunnerConnectionInfo> {
        self.registry.list_connections(user_id).await
    }

    pub async fn is_runner_connected(&self, runner_id: &str) -> bool {
        self.registry.is_connected(runner_id).await
    }

    pub async fn on_runner_status_change(&self, callback: RunnerStatusCallback) {
        self.registry.on_runner_status_change(callback).await;
    }

    pub async fn broadcast_build_started(
        &self,
        project_id: &str,
        session_id: Option<String>,
        build_id: &str,
    ) {
        self.subscribers
            .broadcast_build_started(project_id, session_id, build_id)
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
        self.subscribers
            .broadcast_todos_update(project_id, session_id, todos, active_index, phase)
            .await;
    }

    pub async fn broadcast_todo_completed(
        &self,
        project_id: &str,
        session_id: Option<String>,
        todo_index: i64,
    ) {
        self.subscribers
            .broadcast_todo_completed(project_id, session_id, todo_index)
            .await;
    }

    pub async fn broadcast_tool_call(
        &self,
        project_id: &str,
        session_id: Option<String>,
        tool_call: ToolCallUpdate,
    ) {
        self.subscribers
            .broadcast_tool_call(project_id, session_id, tool_call)
            .await;
    }

    pub async fn broadcast_build_complete(
        &self,
        project_id: &str,
        session_id: Option<String>,
        status: &str,
        summary: Option<String>,
    ) {
        self.subscribers
            .broadcast_build_complete(project_id, session_id, status, summary)
            .await;
    }

    pub async fn broadcast_state_update(
        &self,
        project_id: &str,
        session_id: Option<String>,
        partial_state: Value,
    ) {
        self.subscribers
            .broadcast_state_update(project_id, session_id, partial_state)
            .await;
    }

    pub fn add_runner_event_subscriber(
        &self,
        command_id: Uuid,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> CommandEventSubscription {
        self.command_events.add_subscriber(command_id, handler)
    }

    pub async fn proxy_request(
        &self,
        runner_id: &str,
        project_id: &str,
        port: u16,
        request: ProxyRequest,
    ) -> BrokerResult<ProxyResponse> {
        self.http_proxy
            .proxy_request(runner_id, project_id, port, request)
            .await
    }

    pub async fn hmr_connect(
        &self,
        connection_id: &str,
        runner_id: &str,
        project_id: &str,
        port: u16,
        protocol: Option<String>,
        callbacks: HmrCallbacks,
    ) -> BrokerResult<()> {
        self.hmr_proxy
            .connect(connection_id, runner_id, project_id, port, protocol, callbacks)
            .await
    }

    pub async fn hmr_send(&self, connection_id: &str, frame: &str) -> bool {
        self.hmr_proxy.send(connection_id, frame).await
    }

    pub async fn hmr_disconnect(&self, connection_id: &str) -> bool {
        self.hmr_proxy.disconnect(connection_id).await
    }
}

/// Builds the broker and its HTTP state.
pub fn create_broker_state(config: Config) -> BrokerState {
    BrokerState {
        broker: Broker::new(config),
    }
}

/// The single upgrade surface: `/ws` for browsers, `/ws/runner` for
/// runners, plus the operational read-only endpoints. Unknown paths land
/// in the logged fallback.
pub fn create_broker_routes() -> Router<BrokerState> {
    Router::new()
        .route("/ws", get(BrokerHandler::client_ws_handler))
        .route("/ws/runner", get(BrokerHandler::runner_ws_handler))
        .route("/ws/stats", get(BrokerHandler::get_broker_stats))
        .route("/ws/runners", get(BrokerHandler::list_runners))
        .route("/health", get(BrokerHandler::health))
        .fallback(BrokerHandler::unknown_path)
}
