use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::StoreError;

// Redis key prefix for session hashes, one hash per client id
const SESSION_KEY_PREFIX: &str = "zoe:wa-session";

/// Opaque key/value persistence for the transport's authentication material.
///
/// Every client id gets its own namespace, so switching the client id means
/// starting from an empty session.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Store a value, replacing any previous value for the key
    async fn save(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Load a value
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Every key and value of a namespace, ordered by key
    async fn snapshot(&self, namespace: &str) -> Result<BTreeMap<String, Vec<u8>>, StoreError>;

    /// Human readable location, safe to log
    fn describe(&self) -> String;
}

/// Open the store named by a connection URL.
///
/// `memory://` gives an ephemeral in-process store, `redis://` and
/// `rediss://` a Redis backed one.
pub async fn open_credential_store(url: &str) -> Result<Arc<dyn CredentialStore>, StoreError> {
    if url.starts_with("memory://") {
        info!("💾 Using ephemeral in-memory session store");
        return Ok(Arc::new(MemoryCredentialStore::new()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let store = RedisCredentialStore::connect(url).await?;
        info!("💾 Using Redis session store at {}", store.describe());
        return Ok(Arc::new(store));
    }
    Err(StoreError::UnsupportedUrl(redact_url(url)))
}

/// In-process store, contents are lost on restart
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    namespaces: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn save(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.namespaces
            .write()
            .await
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .namespaces
            .read()
            .await
            .get(namespace)
            .and_then(|entries| entries.get(key).cloned()))
    }

    async fn snapshot(&self, namespace: &str) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        Ok(self
            .namespaces
            .read()
            .await
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

/// Redis backed store, one hash per namespace
pub struct RedisCredentialStore {
    conn: tokio::sync::Mutex<ConnectionManager>,
    location: String,
}

impl RedisCredentialStore {
    /// Connect to Redis
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn_manager = ConnectionManager::new(client).await?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(conn_manager),
            location: redact_url(url),
        })
    }

    fn hash_key(namespace: &str) -> String {
        format!("{SESSION_KEY_PREFIX}:{namespace}")
    }
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
    async fn save(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let _: () = conn.hset(Self::hash_key(namespace), key, value).await?;
        Ok(())
    }

    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.lock().await;
        Ok(conn.hget(Self::hash_key(namespace), key).await?)
    }

    async fn snapshot(&self, namespace: &str) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        let mut conn = self.conn.lock().await;
        let entries: HashMap<String, Vec<u8>> = conn.hgetall(Self::hash_key(namespace)).await?;
        Ok(entries.into_iter().collect())
    }

    fn describe(&self) -> String {
        self.location.clone()
    }
}

/// Drop credentials from a connection URL so it can be logged
pub fn redact_url(url: &str) -> String {
    match (url.split_once("://"), url.rsplit_once('@')) {
        (Some((scheme, _)), Some((_, host))) => format!("{scheme}://***@{host}"),
        _ => url.to_string(),
    }
}
