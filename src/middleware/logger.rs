use axum::{http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::broker::protocol::TraceContext;

/// Request logging middleware. Assigns a request id and captures an
/// inbound W3C trace context into the request extensions so handlers that
/// originate commands can propagate it over the socket.
pub async fn logger<B>(mut req: Request<B>, next: Next<B>) -> Response {
    let request_id = Uuid::new_v4();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();

    if let Some(trace) = extract_trace_context(&req) {
        req.extensions_mut().insert(trace);
    }
    req.extensions_mut().insert(request_id);

    let response = next.run(req).await;
    let status = response.status().as_u16();
    let elapsed = start.elapsed().as_millis();

    info!(request_id = %request_id, method = %method, uri = %uri, status = status, elapsed_ms = elapsed, "Request log");
    response
}

fn extract_trace_context<B>(req: &Request<B>) -> Option<TraceContext> {
    let trace = req
        .headers()
        .get("traceparent")
        .and_then(|v| v.to_str().ok())?
        .to_string();
    let baggage = req
        .headers()
        .get("baggage")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Some(TraceContext { trace, baggage })
}
