use std::sync::Arc;

use tracing::{debug, info};
use zoe_wa_transport::{ChatInfo, WhatsAppTransport};

use crate::error::{GatewayError, Result};

/// How a caller names the target group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReference {
    pub explicit_id: Option<String>,
    pub name: Option<String>,
}

impl GroupReference {
    /// Build a reference, treating blank strings as absent
    pub fn new(explicit_id: Option<&str>, name: Option<&str>) -> Self {
        fn present(value: Option<&str>) -> Option<String> {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }
        Self {
            explicit_id: present(explicit_id),
            name: present(name),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.explicit_id.is_none() && self.name.is_none()
    }
}

/// Turns a [`GroupReference`] into a group JID
#[derive(Clone)]
pub struct GroupResolver {
    transport: Arc<dyn WhatsAppTransport>,
}

impl GroupResolver {
    pub fn new(transport: Arc<dyn WhatsAppTransport>) -> Self {
        Self { transport }
    }

    /// Resolve `reference` to a group JID.
    ///
    /// An explicit id wins and is returned as given; checking that it exists
    /// is left to the send. Otherwise the chat listing is searched for a group
    /// whose display name equals `name`, ignoring case. The first match wins.
    pub async fn resolve(&self, reference: &GroupReference) -> Result<String> {
        if let Some(id) = &reference.explicit_id {
            debug!("🎯 Using explicit group id {}", id);
            return Ok(id.clone());
        }

        let Some(name) = &reference.name else {
            return Err(GatewayError::Validation(
                "group or groupId is required".to_string(),
            ));
        };

        let chats = self.transport.list_chats().await?;
        match find_group_by_name(&chats, name) {
            Some(chat) => {
                info!("🔎 Resolved group '{}' to {}", name, chat.jid);
                Ok(chat.jid.clone())
            }
            None => Err(GatewayError::NotFound(format!("group not found: {name}"))),
        }
    }
}

/// First group chat whose name equals the trimmed `name`, ignoring case.
/// Display names are compared as listed.
pub fn find_group_by_name<'a>(chats: &'a [ChatInfo], name: &str) -> Option<&'a ChatInfo> {
    let wanted = name.trim().to_lowercase();
    chats
        .iter()
        .filter(|chat| chat.is_group)
        .find(|chat| chat.name.to_lowercase() == wanted)
}
