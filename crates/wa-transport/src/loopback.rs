//! In-process transport.
//!
//! Accepts sends for a seeded list of chats, answers each send with a scripted
//! series of delivery receipts and keeps its "linked device" session in the
//! [`CredentialStore`]. The gateway binary runs on it when no real WhatsApp
//! client is wired in, and every test in the workspace uses it as the
//! collaborator on the other side of [`WhatsAppTransport`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    AckLevel, ChatInfo, ConnectionStatus, CredentialStore, DeliveryReceipt, OutboundMessage,
    TransportError, WhatsAppTransport,
};

const SESSION_KEY: &str = "session";
const EVENT_BUFFER: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receipts emitted after every accepted send.
///
/// Each step waits its delay after the previous step, then emits its level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckScript {
    steps: Vec<(Duration, AckLevel)>,
}

impl AckScript {
    /// No receipts at all; every wait on this transport times out
    pub fn silent() -> Self {
        Self::default()
    }

    /// Append a step
    pub fn then(mut self, delay: Duration, level: AckLevel) -> Self {
        self.steps.push((delay, level));
        self
    }

    pub fn steps(&self) -> &[(Duration, AckLevel)] {
        &self.steps
    }
}

/// A message accepted by the loopback transport, with its text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message: OutboundMessage,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    client_id: String,
    linked_at: chrono::DateTime<Utc>,
}

/// In-process [`WhatsAppTransport`]
pub struct LoopbackTransport {
    client_id: String,
    store: Arc<dyn CredentialStore>,
    status: Mutex<ConnectionStatus>,
    chats: Mutex<Vec<ChatInfo>>,
    sent: Mutex<Vec<SentMessage>>,
    fail_next: Mutex<Option<TransportError>>,
    ack_script: AckScript,
    receipts_tx: broadcast::Sender<DeliveryReceipt>,
    lifecycle_tx: broadcast::Sender<ConnectionStatus>,
}

impl LoopbackTransport {
    /// Create a disconnected transport for `client_id`
    pub fn new(client_id: impl Into<String>, store: Arc<dyn CredentialStore>) -> Self {
        let (receipts_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (lifecycle_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            client_id: client_id.into(),
            store,
            status: Mutex::new(ConnectionStatus::Disconnected),
            chats: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
            ack_script: AckScript::silent(),
            receipts_tx,
            lifecycle_tx,
        }
    }

    /// Seed the chat listing
    pub fn with_chats(self, chats: Vec<ChatInfo>) -> Self {
        *lock(&self.chats) = chats;
        self
    }

    /// Set the receipts emitted after each send
    pub fn with_ack_script(mut self, script: AckScript) -> Self {
        self.ack_script = script;
        self
    }

    /// Parse a chat listing from JSON (an array of [`ChatInfo`])
    pub fn chats_from_json(json: &str) -> Result<Vec<ChatInfo>, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Force a connection status and announce it on the lifecycle stream
    pub fn set_status(&self, status: ConnectionStatus) {
        *lock(&self.status) = status;
        // No subscribers is fine
        let _ = self.lifecycle_tx.send(status);
    }

    /// Emit a receipt for a message, as the network would
    pub fn emit_receipt(&self, message_id: &str, level: AckLevel) {
        let chat_jid = lock(&self.sent)
            .iter()
            .find(|sent| sent.message.id == message_id)
            .map(|sent| sent.message.chat_jid.clone())
            .unwrap_or_default();
        let _ = self.receipts_tx.send(DeliveryReceipt {
            message_id: message_id.to_string(),
            chat_jid,
            level,
        });
    }

    /// Make the next send fail with `error`
    pub fn fail_next_send(&self, error: TransportError) {
        *lock(&self.fail_next) = Some(error);
    }

    /// Everything accepted so far, oldest first
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    fn next_message_id() -> String {
        // WhatsApp web style id
        let id = uuid::Uuid::new_v4();
        format!("3EB0{}", hex::encode_upper(&id.as_bytes()[..8]))
    }

    fn spawn_ack_script(&self, message: &OutboundMessage) {
        if self.ack_script.steps().is_empty() {
            return;
        }
        let steps = self.ack_script.steps().to_vec();
        let receipts_tx = self.receipts_tx.clone();
        let message_id = message.id.clone();
        let chat_jid = message.chat_jid.clone();

        tokio::spawn(async move {
            for (delay, level) in steps {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                debug!("📬 Loopback receipt {} for {}", level, message_id);
                let _ = receipts_tx.send(DeliveryReceipt {
                    message_id: message_id.clone(),
                    chat_jid: chat_jid.clone(),
                    level,
                });
            }
        });
    }
}

#[async_trait]
impl WhatsAppTransport for LoopbackTransport {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.set_status(ConnectionStatus::Connecting);

        let session = match self.store.load(&self.client_id, SESSION_KEY).await {
            Ok(session) => session,
            Err(e) => {
                warn!("❌ Failed to load session for {}: {}", self.client_id, e);
                self.set_status(ConnectionStatus::Disconnected);
                return Err(e.into());
            }
        };

        match session {
            Some(_) => info!("🔑 Restored session for client {}", self.client_id),
            None => {
                info!(
                    "📱 No session for client {}, linking a new device",
                    self.client_id
                );
                let record = SessionRecord {
                    client_id: self.client_id.clone(),
                    linked_at: Utc::now(),
                };
                let bytes = serde_json::to_vec(&record)
                    .map_err(|e| TransportError::Store(e.to_string()))?;
                if let Err(e) = self.store.save(&self.client_id, SESSION_KEY, &bytes).await {
                    warn!("❌ Failed to persist session for {}: {}", self.client_id, e);
                    self.set_status(ConnectionStatus::LoggedOut);
                    return Err(e.into());
                }
            }
        }

        self.set_status(ConnectionStatus::Connected);
        info!("✅ Loopback transport connected");
        Ok(())
    }

    async fn connection_status(&self) -> ConnectionStatus {
        *lock(&self.status)
    }

    async fn send_message(
        &self,
        chat_jid: &str,
        text: &str,
    ) -> Result<OutboundMessage, TransportError> {
        if let Some(error) = lock(&self.fail_next).take() {
            return Err(error);
        }
        if *lock(&self.status) != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        if !chat_jid.contains('@') {
            return Err(TransportError::InvalidJid(chat_jid.to_string()));
        }
        if !lock(&self.chats).iter().any(|chat| chat.jid == chat_jid) {
            return Err(TransportError::ChatNotFound(chat_jid.to_string()));
        }

        let message = OutboundMessage::new(Self::next_message_id(), chat_jid);
        lock(&self.sent).push(SentMessage {
            message: message.clone(),
            text: text.to_string(),
        });
        debug!("📤 Loopback accepted {} for {}", message.id, chat_jid);

        self.spawn_ack_script(&message);
        Ok(message)
    }

    async fn list_chats(&self) -> Result<Vec<ChatInfo>, TransportError> {
        if *lock(&self.status) != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        Ok(lock(&self.chats).clone())
    }

    fn subscribe_receipts(&self) -> broadcast::Receiver<DeliveryReceipt> {
        self.receipts_tx.subscribe()
    }

    fn subscribe_lifecycle(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.lifecycle_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryCredentialStore;

    fn transport() -> LoopbackTransport {
        LoopbackTransport::new("ci-bot", Arc::new(MemoryCredentialStore::new()))
            .with_chats(vec![ChatInfo::group("1203630001@g.us", "Release Notices")])
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let transport = transport();
        let result = transport.send_message("1203630001@g.us", "hi").await;
        assert_eq!(result, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn connect_links_then_restores_session() -> anyhow::Result<()> {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
        let first = LoopbackTransport::new("ci-bot", store.clone());
        let mut lifecycle = first.subscribe_lifecycle();

        first.connect().await?;
        assert_eq!(lifecycle.recv().await?, ConnectionStatus::Connecting);
        assert_eq!(lifecycle.recv().await?, ConnectionStatus::Connected);
        assert_eq!(first.connection_status().await, ConnectionStatus::Connected);
        let linked = store.load("ci-bot", SESSION_KEY).await?;
        assert!(linked.is_some());

        // same client id reuses the stored session instead of relinking
        let second = LoopbackTransport::new("ci-bot", store.clone());
        second.connect().await?;
        assert_eq!(store.load("ci-bot", SESSION_KEY).await?, linked);

        // a different client id starts from an empty session
        assert!(store.load("other-bot", SESSION_KEY).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn send_validates_target() -> anyhow::Result<()> {
        let transport = transport();
        transport.connect().await?;

        assert_eq!(
            transport.send_message("not-a-jid", "hi").await,
            Err(TransportError::InvalidJid("not-a-jid".to_string()))
        );
        assert_eq!(
            transport.send_message("999@g.us", "hi").await,
            Err(TransportError::ChatNotFound("999@g.us".to_string()))
        );

        let message = transport.send_message("1203630001@g.us", "hi").await?;
        assert!(message.id.starts_with("3EB0"));
        assert_eq!(message.chat_jid, "1203630001@g.us");
        assert_eq!(transport.sent_messages().len(), 1);
        assert_eq!(transport.sent_messages()[0].text, "hi");
        Ok(())
    }

    #[tokio::test]
    async fn forced_failure_applies_once() -> anyhow::Result<()> {
        let transport = transport();
        transport.connect().await?;
        transport.fail_next_send(TransportError::Send("boom".to_string()));

        assert!(transport.send_message("1203630001@g.us", "a").await.is_err());
        assert!(transport.send_message("1203630001@g.us", "b").await.is_ok());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn ack_script_emits_receipts_in_order() -> anyhow::Result<()> {
        let transport = transport().with_ack_script(
            AckScript::silent()
                .then(Duration::ZERO, AckLevel::Server)
                .then(Duration::from_secs(2), AckLevel::Device),
        );
        transport.connect().await?;
        let mut receipts = transport.subscribe_receipts();

        let message = transport.send_message("1203630001@g.us", "hi").await?;

        let first = receipts.recv().await?;
        assert_eq!(first.message_id, message.id);
        assert_eq!(first.level, AckLevel::Server);

        let second = receipts.recv().await?;
        assert_eq!(second.level, AckLevel::Device);
        assert_eq!(second.chat_jid, "1203630001@g.us");
        Ok(())
    }

    #[tokio::test]
    async fn manual_receipts_carry_chat() -> anyhow::Result<()> {
        let transport = transport();
        transport.connect().await?;
        let message = transport.send_message("1203630001@g.us", "hi").await?;
        let mut receipts = transport.subscribe_receipts();

        transport.emit_receipt(&message.id, AckLevel::Read);
        let receipt = receipts.recv().await?;
        assert_eq!(receipt.level, AckLevel::Read);
        assert_eq!(receipt.chat_jid, "1203630001@g.us");
        Ok(())
    }

    #[tokio::test]
    async fn listing_requires_connection() -> anyhow::Result<()> {
        let transport = transport();
        assert_eq!(
            transport.list_chats().await,
            Err(TransportError::NotConnected)
        );
        transport.connect().await?;
        assert_eq!(transport.list_chats().await?.len(), 1);
        Ok(())
    }

    #[test]
    fn parses_chat_file() {
        let chats = LoopbackTransport::chats_from_json(
            r#"[{"jid": "1@g.us", "name": "Ops", "is_group": true}]"#,
        )
        .unwrap();
        assert_eq!(chats, vec![ChatInfo::group("1@g.us", "Ops")]);
    }
}
