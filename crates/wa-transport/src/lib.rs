//! # Zoe WhatsApp transport
//!
//! The contract between the notification gateway and whatever actually speaks
//! the WhatsApp protocol. It provides:
//!
//! - the data types exchanged with the transport (connection status,
//!   acknowledgment levels, delivery receipts, chat listings)
//! - the [`WhatsAppTransport`] trait the gateway is written against
//! - the [`CredentialStore`] used to persist the linked session
//! - [`LoopbackTransport`], an in-process transport for local runs and tests

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub mod error;
pub mod loopback;
pub mod store;

pub use error::{StoreError, TransportError};
pub use loopback::{AckScript, LoopbackTransport, SentMessage};
pub use store::{
    CredentialStore, MemoryCredentialStore, RedisCredentialStore, open_credential_store, redact_url,
};

/// Connection status reported by the transport's lifecycle stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    LoggedOut,
}

impl From<&str> for ConnectionStatus {
    fn from(s: &str) -> Self {
        match s {
            "connected" => ConnectionStatus::Connected,
            "disconnected" => ConnectionStatus::Disconnected,
            "connecting" => ConnectionStatus::Connecting,
            "logged_out" => ConnectionStatus::LoggedOut,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

/// Rungs of the WhatsApp delivery confirmation ladder.
///
/// Higher is more confirmed. `Error` is the sentinel the transport reports
/// when delivery failed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AckLevel {
    Error = 0,
    #[default]
    Server = 1,
    Device = 2,
    Read = 3,
    Played = 4,
}

impl AckLevel {
    /// Parse a caller supplied level name.
    ///
    /// This never fails: anything that is not one of `server`, `device`,
    /// `read` or `played` maps to [`AckLevel::Server`].
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "server" => AckLevel::Server,
            "device" => AckLevel::Device,
            "read" => AckLevel::Read,
            "played" => AckLevel::Played,
            _ => AckLevel::Server,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AckLevel::Error => "error",
            AckLevel::Server => "server",
            AckLevel::Device => "device",
            AckLevel::Read => "read",
            AckLevel::Played => "played",
        }
    }
}

impl fmt::Display for AckLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message the transport accepted for delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: String,
    pub chat_jid: String,
    pub submitted_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(id: impl Into<String>, chat_jid: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chat_jid: chat_jid.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// Delivery acknowledgment event for a single message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub chat_jid: String,
    pub level: AckLevel,
}

/// Chat listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub jid: String,
    pub name: String,
    #[serde(default)]
    pub is_group: bool,
}

impl ChatInfo {
    /// A group chat entry
    pub fn group(jid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            name: name.into(),
            is_group: true,
        }
    }

    /// A direct (one to one) chat entry
    pub fn direct(jid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            name: name.into(),
            is_group: false,
        }
    }
}

/// Everything the gateway needs from a WhatsApp client.
///
/// Receipt and lifecycle streams are broadcast: every subscriber sees every
/// event emitted after it subscribed.
#[async_trait]
pub trait WhatsAppTransport: Send + Sync + 'static {
    /// Stable identifier of the linked session
    fn client_id(&self) -> &str;

    /// Establish the connection, linking a new device if no session exists
    async fn connect(&self) -> Result<(), TransportError>;

    /// Current connection status
    async fn connection_status(&self) -> ConnectionStatus;

    /// Send a plain text message, returning the accepted message handle
    async fn send_message(&self, chat_jid: &str, text: &str)
    -> Result<OutboundMessage, TransportError>;

    /// List all chats known to the account, groups and direct chats alike
    async fn list_chats(&self) -> Result<Vec<ChatInfo>, TransportError>;

    /// Subscribe to delivery receipts
    fn subscribe_receipts(&self) -> broadcast::Receiver<DeliveryReceipt>;

    /// Subscribe to connection lifecycle changes
    fn subscribe_lifecycle(&self) -> broadcast::Receiver<ConnectionStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_status_from_string() {
        assert_eq!(ConnectionStatus::from("connected"), ConnectionStatus::Connected);
        assert_eq!(
            ConnectionStatus::from("disconnected"),
            ConnectionStatus::Disconnected
        );
        assert_eq!(ConnectionStatus::from("connecting"), ConnectionStatus::Connecting);
        assert_eq!(ConnectionStatus::from("logged_out"), ConnectionStatus::LoggedOut);
        assert_eq!(
            ConnectionStatus::from("unknown"),
            ConnectionStatus::Disconnected
        ); // Default
    }

    #[test]
    fn ack_levels_are_ordered() {
        assert!(AckLevel::Error < AckLevel::Server);
        assert!(AckLevel::Server < AckLevel::Device);
        assert!(AckLevel::Device < AckLevel::Read);
        assert!(AckLevel::Read < AckLevel::Played);
    }

    #[test]
    fn lenient_parse_falls_back_to_server() {
        assert_eq!(AckLevel::parse_lenient("read"), AckLevel::Read);
        assert_eq!(AckLevel::parse_lenient(" PLAYED "), AckLevel::Played);
        assert_eq!(AckLevel::parse_lenient("Device"), AckLevel::Device);
        assert_eq!(AckLevel::parse_lenient("delivered"), AckLevel::Server);
        assert_eq!(AckLevel::parse_lenient(""), AckLevel::Server);
        // the failure sentinel is never a valid thing to wait for
        assert_eq!(AckLevel::parse_lenient("error"), AckLevel::Server);
    }

    #[test]
    fn ack_level_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&AckLevel::Device).unwrap(), "\"device\"");
        assert_eq!(AckLevel::Read.to_string(), "read");
    }

    #[test]
    fn chats_json_parsing() {
        let json = r#"[
            {"jid": "1203630001@g.us", "name": "Release Notices", "is_group": true},
            {"jid": "491234567@s.whatsapp.net", "name": "Alice"}
        ]"#;

        let chats: Vec<ChatInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(chats.len(), 2);
        assert!(chats[0].is_group);
        assert!(!chats[1].is_group);
    }

    #[test]
    fn transport_trait_is_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn WhatsAppTransport>();
    }
}
