//! # Zoe Notify Gateway
//!
//! Small HTTP service that lets CI pipelines and other automation post plain
//! text notifications into WhatsApp groups and learn how far each message got
//! on the delivery ladder (server, device, read, played).
//!
//! The pieces:
//!
//! - [`readiness`]: whether the WhatsApp client can take sends right now
//! - [`groups`]: turning a group id or display name into a group JID
//! - [`ack`]: waiting, with a timeout, for a message to reach a level
//! - [`backup`]: periodic archives of the linked session
//! - [`api`]: the axum router serving `/healthz` and `/send-group`
//! - [`builder`]: wiring all of the above around a [`WhatsAppTransport`]
//!
//! [`WhatsAppTransport`]: zoe_wa_transport::WhatsAppTransport

pub mod ack;
pub mod api;
pub mod backup;
pub mod builder;
pub mod config;
pub mod error;
pub mod groups;
pub mod rate_limit;
pub mod readiness;

pub use ack::{AckOutcome, AckWaitCoordinator, AckWaitRequest};
pub use api::{AppState, SendGroupRequest, SendGroupResponse, create_router};
pub use backup::{BackupError, BackupHandle, BackupScheduler, BackupStatus};
pub use builder::{NotifyGateway, NotifyGatewayBuilder, default_loopback_script};
pub use config::{BackupConfig, ConfigError, GatewayArgs, GatewayConfig};
pub use error::GatewayError;
pub use groups::{GroupReference, GroupResolver};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use readiness::{ReadinessDriver, ReadinessHandle, ReadinessState, readiness};
