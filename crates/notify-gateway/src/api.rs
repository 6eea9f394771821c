use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use zoe_wa_transport::{AckLevel, WhatsAppTransport};

use crate::ack::AckWaitCoordinator;
use crate::backup::BackupHandle;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::groups::{GroupReference, GroupResolver};
use crate::rate_limit::RateLimiter;
use crate::readiness::{ReadinessHandle, ReadinessState};

/// Header that may carry the shared secret instead of the body
pub const TOKEN_HEADER: &str = "bot-token";

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    config: Arc<GatewayConfig>,
    transport: Arc<dyn WhatsAppTransport>,
    resolver: GroupResolver,
    acks: Arc<AckWaitCoordinator>,
    readiness: ReadinessHandle,
    backup: Option<BackupHandle>,
    limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        config: Arc<GatewayConfig>,
        transport: Arc<dyn WhatsAppTransport>,
        acks: Arc<AckWaitCoordinator>,
        readiness: ReadinessHandle,
        backup: Option<BackupHandle>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            resolver: GroupResolver::new(transport.clone()),
            config,
            transport,
            acks,
            readiness,
            backup,
            limiter,
        }
    }
}

/// Body of `POST /send-group`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendGroupRequest {
    #[serde(rename = "bot-token")]
    pub bot_token: Option<String>,
    /// Group display name
    pub group: Option<String>,
    pub group_id: Option<String>,
    pub message: Option<String>,
    pub ack: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Successful send, whether or not the requested level was reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendGroupResponse {
    pub ok: bool,
    pub group_id: String,
    pub message_id: String,
    pub ack: AckLevel,
    pub timed_out: bool,
    pub waited_for: AckLevel,
    pub timeout_ms: u64,
}

fn authorize(expected: &str, provided: Option<&str>) -> Result<()> {
    let Some(provided) = provided else {
        return Err(GatewayError::Unauthorized);
    };
    if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
        Ok(())
    } else {
        Err(GatewayError::Unauthorized)
    }
}

/// Send a message to a group and wait for it to be acknowledged
async fn send_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SendGroupResponse>> {
    let request: SendGroupRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Validation(format!("invalid JSON body: {e}")))?;

    let header_token = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = authorize(
        &state.config.bot_token,
        request.bot_token.as_deref().or(header_token),
    ) {
        warn!("🔒 Rejected send with missing or wrong bot token");
        return Err(e);
    }

    let text = match request.message {
        Some(text) if !text.trim().is_empty() => text,
        _ => return Err(GatewayError::Validation("message is required".to_string())),
    };
    let reference = GroupReference::new(request.group_id.as_deref(), request.group.as_deref());
    if reference.is_empty() {
        return Err(GatewayError::Validation(
            "group or groupId is required".to_string(),
        ));
    }

    let readiness = state.readiness.current();
    if readiness != ReadinessState::Ready {
        return Err(GatewayError::NotReady(readiness));
    }

    let group_id = state.resolver.resolve(&reference).await?;
    let waited_for = request
        .ack
        .as_deref()
        .map(AckLevel::parse_lenient)
        .unwrap_or(state.config.ack_default);
    let timeout = state.config.effective_timeout(request.timeout_ms);

    info!(
        "📨 Sending {} chars to {} (waiting for {}, up to {:?})",
        text.chars().count(),
        group_id,
        waited_for,
        timeout
    );

    // Detached, so a caller hanging up does not abandon the wait half way
    let transport = state.transport.clone();
    let acks = state.acks.clone();
    let pipeline = tokio::spawn(async move {
        let sent = transport.send_message(&group_id, &text).await?;
        let outcome = acks.wait_for(&sent, waited_for, timeout).await;
        Ok::<_, GatewayError>((group_id, sent, outcome))
    });
    let (group_id, sent, outcome) = pipeline
        .await
        .map_err(|e| GatewayError::Internal(format!("send task failed: {e}")))??;

    if outcome.timed_out {
        info!(
            "⏰ {} still at {} after {:?}",
            sent.id, outcome.level, timeout
        );
    } else {
        info!("✅ {} reached {}", sent.id, outcome.level);
    }

    Ok(Json(SendGroupResponse {
        ok: true,
        group_id,
        message_id: sent.id,
        ack: outcome.level,
        timed_out: outcome.timed_out,
        waited_for,
        timeout_ms: timeout.as_millis() as u64,
    }))
}

/// Liveness plus readiness details
async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let readiness = state.readiness.current();
    let backup = match &state.backup {
        Some(handle) => json!(handle.status()),
        None => json!({ "disabled": true }),
    };

    Json(json!({
        "ok": true,
        "ready": readiness == ReadinessState::Ready,
        "state": readiness,
        "clientId": state.transport.client_id(),
        "backup": backup,
        "ackDefault": state.config.ack_default,
        "ackTimeoutMs": state.config.ack_timeout.as_millis() as u64,
        "pendingAcks": state.acks.pending(),
    }))
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Result<Response> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    state.limiter.check(peer)?;
    Ok(next.run(request).await)
}

/// Create the HTTP router
pub fn create_router(state: AppState) -> Router {
    let send = Router::new()
        .route("/send-group", post(send_group))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(send)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
