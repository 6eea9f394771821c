use thiserror::Error;

/// Errors reported by a [`WhatsAppTransport`](crate::WhatsAppTransport)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WhatsApp client is not connected")]
    NotConnected,

    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Invalid JID: {0}")]
    InvalidJid(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Session store error: {0}")]
    Store(String),
}

impl From<StoreError> for TransportError {
    fn from(err: StoreError) -> Self {
        TransportError::Store(err.to_string())
    }
}

/// Errors reported by a [`CredentialStore`](crate::CredentialStore)
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported store URL: {0}")]
    UnsupportedUrl(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
