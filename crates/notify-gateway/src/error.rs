use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use zoe_wa_transport::TransportError;

use crate::readiness::ReadinessState;

/// Errors surfaced by the notification API.
///
/// An acknowledgment timeout is not an error; it is a successful send with
/// `timedOut` set.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid bot token")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("WhatsApp client not ready ({})", .0.as_str())]
    NotReady(ReadinessState),

    #[error("{0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Transport(TransportError::ChatNotFound(_)) => StatusCode::NOT_FOUND,
            Self::Transport(TransportError::InvalidJid(_)) => StatusCode::BAD_REQUEST,
            Self::Transport(TransportError::NotConnected) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Transport(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller; server side failures stay generic
    fn public_message(&self) -> String {
        match self {
            Self::Transport(TransportError::ChatNotFound(jid)) => format!("group not found: {jid}"),
            Self::Transport(TransportError::InvalidJid(jid)) => format!("invalid group id: {jid}"),
            Self::Transport(TransportError::NotConnected) => "WhatsApp client not ready".to_string(),
            Self::Transport(_) => "failed to send message".to_string(),
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!("❌ Request failed: {}", self);
        }
        let body = json!({
            "ok": false,
            "error": self.public_message(),
        });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
