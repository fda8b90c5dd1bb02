use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::monitoring::BrokerMetrics;
use crate::broker::protocol::{Command, CommandPayload, Event, EventPayload, decode_body, encode_body};
use crate::broker::router::CommandSink;
use crate::error::{BrokerError, BrokerResult};

/// An HTTP request to forward into a runner's loopback dev server.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

struct PendingProxyRequest {
    runner_id: String,
    status_code: Option<u16>,
    headers: Option<HashMap<String, String>>,
    chunks: Vec<u8>,
    completion: oneshot::Sender<BrokerResult<ProxyResponse>>,
}

impl PendingProxyRequest {
    fn complete(self, result: BrokerResult<ProxyResponse>) {
        // The receiver may already be gone after a timeout; that is fine.
        let _ = self.completion.send(result);
    }
}

/// Correlates http-proxy request/response/chunk/error events by request id
/// and assembles chunked bodies. Each pending request resolves exactly once:
/// every completion path removes the table entry before completing.
#[derive(Clone)]
pub struct HttpProxyManager {
    pending: Arc<Mutex<HashMap<Uuid, PendingProxyRequest>>>,
    sink: Arc<dyn CommandSink>,
    metrics: BrokerMetrics,
    timeout: Duration,
}

impl HttpProxyManager {
    pub fn new(sink: Arc<dyn CommandSink>, metrics: BrokerMetrics, timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            sink,
            metrics,
            timeout,
        }
    }

    /// Tunnels one HTTP request to the dev server listening on `port`
    /// inside `runner_id`, waiting up to the proxy timeout for the
    /// assembled response.
    pub async fn proxy_request(
        &self,
        runner_id: &str,
        project_id: &str,
        port: u16,
        request: ProxyRequest,
    ) -> BrokerResult<ProxyResponse> {
        let request_id = Uuid::new_v4();
        let (completion, receiver) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                request_id,
                PendingProxyRequest {
                    runner_id: runner_id.to_string(),
                    status_code: None,
                    headers: None,
                    chunks: Vec::new(),
                    completion,
                },
            );
        }

        let command = Command::new(
            project_id,
            CommandPayload::HttpProxyRequest {
                request_id,
                method: request.method,
                path: request.path,
                headers: request.headers,
                body: request.body.as_deref().map(encode_body),
                port,
            },
        );

        if !self.sink.send_command(runner_id, &command).await {
            self.pending.lock().await.remove(&request_id);
            return Err(BrokerError::runner_unavailable(runner_id));
        }
        self.metrics.record_proxy_request();

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(result)) => result,
            // Completion sender dropped without resolving; treat as a lost
            // runner.
            Ok(Err(_)) => Err(BrokerError::RunnerDisconnected),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                self.metrics.record_proxy_timeout();
                warn!("Proxy request {} to runner {} timed out", request_id, runner_id);
                Err(BrokerError::ProxyTimeout)
            }
        }
    }

    /// Reduces one runner event into the pending table. Non-proxy events
    /// are ignored.
    pub async fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::HttpProxyResponse {
                request_id,
                status_code,
                headers,
                is_chunked,
                body,
            } => {
                if *is_chunked {
                    // Status and headers arrive first; chunks follow.
                    let mut pending = self.pending.lock().await;
                    if let Some(entry) = pending.get_mut(request_id) {
                        entry.status_code = Some(*status_code);
                        entry.headers = Some(headers.clone());
                    }
                    return;
                }

                let Some(entry) = self.pending.lock().await.remove(request_id) else {
                    return;
                };
                let result = match body.as_deref().map(decode_body).transpose() {
                    Ok(decoded) => Ok(ProxyResponse {
                        status_code: *status_code,
                        headers: headers.clone(),
                        body: decoded.unwrap_or_default(),
                    }),
                    Err(e) => Err(BrokerError::proxy(
                        format!("Invalid base64 response body: {}", e),
                        None,
                    )),
                };
                entry.complete(result);
            }
            EventPayload::HttpProxyChunk {
                request_id,
                chunk,
                is_final,
            } => {
                let mut pending = self.pending.lock().await;
                if !pending.contains_key(request_id) {
                    debug!("Dropping chunk for unknown proxy request {}", request_id);
                    return;
                }

                match decode_body(chunk) {
                    Ok(bytes) => {
                        if let Some(entry) = pending.get_mut(request_id) {
                            entry.chunks.extend_from_slice(&bytes);
                        }
                    }
                    Err(e) => {
                        if let Some(entry) = pending.remove(request_id) {
                            entry.complete(Err(BrokerError::proxy(
                                format!("Invalid base64 chunk: {}", e),
                                None,
                            )));
                        }
                        return;
                    }
                }

                if *is_final {
                    if let Some(entry) = pending.remove(request_id) {
                        let PendingProxyRequest {
                            status_code,
                            headers,
                            chunks,
                            completion,
                            ..
                        } = entry;
                        let _ = completion.send(Ok(ProxyResponse {
                            status_code: status_code.unwrap_or(200),
                            headers: headers.unwrap_or_default(),
                            body: chunks,
                        }));
                    }
                }
            }
            EventPayload::HttpProxyError {
                request_id,
                status_code,
                error,
            } => {
                if let Some(entry) = self.pending.lock().await.remove(request_id) {
                    entry.complete(Err(BrokerError::proxy(error.clone(), *status_code)));
                }
            }
            _ => {}
        }
    }

    /// Rejects every request pending against a runner that went away.
    pub async fn fail_runner(&self, runner_id: &str) {
        let failed: Vec<PendingProxyRequest> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, entry)| entry.runner_id == runner_id)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        for entry in failed {
            entry.complete(Err(BrokerError::RunnerDisconnected));
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Rejects everything still pending. Used on broker shutdown.
    pub async fn drain_all(&self) {
        let drained: Vec<PendingProxyRequest> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.complete(Err(BrokerError::ShuttingDown));
        }
    }
}
