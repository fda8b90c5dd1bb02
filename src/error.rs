use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runner {runner_id} is not connected")]
    RunnerUnavailable { runner_id: String },

    #[error("Runner disconnected")]
    RunnerDisconnected,

    #[error("Proxy request timed out")]
    ProxyTimeout,

    #[error("Proxy error: {message}")]
    Proxy {
        message: String,
        status: Option<u16>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            BrokerError::Config(e) => {
                tracing::error!("Configuration error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            BrokerError::RunnerUnavailable { .. } => (StatusCode::BAD_GATEWAY, self.to_string()),
            BrokerError::RunnerDisconnected => (StatusCode::BAD_GATEWAY, self.to_string()),
            BrokerError::ProxyTimeout => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            BrokerError::Proxy { message, status } => {
                let code = status
                    .and_then(|s| StatusCode::from_u16(s).ok())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                (code, message.clone())
            }
            BrokerError::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Serialization error".to_string())
            }
            BrokerError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            BrokerError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        let body = ErrorBody {
            success: false,
            message,
        };
        (status, Json(body)).into_response()
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

// Convenience constructors
impl BrokerError {
    pub fn runner_unavailable(runner_id: impl Into<String>) -> Self {
        Self::RunnerUnavailable {
            runner_id: runner_id.into(),
        }
    }

    pub fn proxy(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Proxy {
            message: message.into(),
            status,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}
