use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};
use zoe_wa_transport::{
    AckLevel, AckScript, ConnectionStatus, CredentialStore, LoopbackTransport, TransportError,
    WhatsAppTransport, open_credential_store,
};

use crate::ack::AckWaitCoordinator;
use crate::api::{AppState, create_router};
use crate::backup::{BackupHandle, BackupScheduler};
use crate::config::GatewayConfig;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::readiness::{ReadinessHandle, readiness};

/// Receipts the loopback transport answers every send with
pub fn default_loopback_script() -> AckScript {
    AckScript::silent()
        .then(Duration::ZERO, AckLevel::Server)
        .then(Duration::from_millis(250), AckLevel::Device)
}

/// Builder wiring a transport, its credential store and the gateway services
pub struct NotifyGatewayBuilder {
    config: GatewayConfig,
    store: Option<Arc<dyn CredentialStore>>,
    transport: Option<Arc<dyn WhatsAppTransport>>,
}

impl NotifyGatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
        }
    }

    /// Use this store instead of opening the configured store url
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this transport instead of the loopback one
    pub fn with_transport(mut self, transport: Arc<dyn WhatsAppTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Assemble the gateway. Does not connect the transport.
    pub async fn build(self) -> Result<NotifyGateway> {
        let config = Arc::new(self.config);

        let store = match self.store {
            Some(store) => store,
            None => open_credential_store(&config.store_url)
                .await
                .context("Failed to open session store")?,
        };
        info!("🗄️ Session store: {}", store.describe());

        let transport: Arc<dyn WhatsAppTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(loopback_transport(&config, store.clone()).await?),
        };

        let mut tasks = Vec::new();

        // subscribe before reading the status so no lifecycle event is missed
        let (driver, readiness) = readiness();
        let lifecycle = transport.subscribe_lifecycle();
        if transport.connection_status().await == ConnectionStatus::Connected {
            driver.apply(ConnectionStatus::Connected);
        }
        tasks.push(driver.spawn(lifecycle));

        let acks = Arc::new(AckWaitCoordinator::new(transport.subscribe_receipts()));

        let backup = match &config.backup {
            Some(backup_config) => {
                let scheduler = BackupScheduler::new(
                    store.clone(),
                    config.client_id.clone(),
                    backup_config.clone(),
                );
                let (handle, task) = scheduler.spawn();
                tasks.push(task);
                Some(handle)
            }
            None => {
                info!("💾 Session backups disabled");
                None
            }
        };

        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::per_minute(
            config.rate_limit_per_minute,
        )));

        let state = AppState::new(
            config.clone(),
            transport.clone(),
            acks,
            readiness.clone(),
            backup.clone(),
            limiter,
        );

        Ok(NotifyGateway {
            transport,
            state,
            readiness,
            backup,
            tasks,
        })
    }
}

async fn loopback_transport(
    config: &GatewayConfig,
    store: Arc<dyn CredentialStore>,
) -> Result<LoopbackTransport> {
    let chats = match &config.chats_file {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read chats file {}", path.display()))?;
            LoopbackTransport::chats_from_json(&json)
                .with_context(|| format!("Invalid chats file {}", path.display()))?
        }
        None => Vec::new(),
    };
    info!("🔁 Using loopback transport with {} chats", chats.len());

    Ok(LoopbackTransport::new(config.client_id.clone(), store)
        .with_chats(chats)
        .with_ack_script(default_loopback_script()))
}

/// A fully wired gateway
pub struct NotifyGateway {
    transport: Arc<dyn WhatsAppTransport>,
    state: AppState,
    readiness: ReadinessHandle,
    backup: Option<BackupHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl NotifyGateway {
    /// Connect the transport; readiness follows its lifecycle events
    pub async fn connect(&self) -> Result<(), TransportError> {
        info!(
            "🔗 Connecting WhatsApp client {}...",
            self.transport.client_id()
        );
        if let Err(e) = self.transport.connect().await {
            error!("❌ Failed to connect WhatsApp client: {}", e);
            return Err(e);
        }
        Ok(())
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub fn readiness(&self) -> ReadinessHandle {
        self.readiness.clone()
    }

    pub fn backup(&self) -> Option<BackupHandle> {
        self.backup.clone()
    }

    pub fn transport(&self) -> Arc<dyn WhatsAppTransport> {
        self.transport.clone()
    }

    /// Serve HTTP on `listener` until `shutdown` completes
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }
}

impl Drop for NotifyGateway {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
