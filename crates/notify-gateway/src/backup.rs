//! Periodic export of the linked session.
//!
//! Every interval the credential store namespace of the client is written to
//! `session-<client-id>-<timestamp>.tar.gz`, one archive entry per stored key
//! plus a `manifest.json`. Failures are logged and counted, never propagated.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use zoe_wa_transport::{CredentialStore, StoreError};

use crate::config::BackupConfig;

const MANIFEST_NAME: &str = "manifest.json";
const ARCHIVE_SUFFIX: &str = ".tar.gz";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.9fZ";

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backup task failed: {0}")]
    Task(String),
}

/// What `/healthz` reports about backups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub enabled: bool,
    pub interval_secs: u64,
    pub directory: String,
    pub runs: u64,
    pub failures: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_archive: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    client_id: &'a str,
    created_at: DateTime<Utc>,
    keys: Vec<&'a str>,
}

/// Cheap to clone view on the backup status
#[derive(Debug, Clone)]
pub struct BackupHandle {
    status: Arc<RwLock<BackupStatus>>,
}

impl BackupHandle {
    pub fn status(&self) -> BackupStatus {
        self.status
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

pub struct BackupScheduler {
    store: Arc<dyn CredentialStore>,
    client_id: String,
    config: BackupConfig,
    status: Arc<RwLock<BackupStatus>>,
}

impl BackupScheduler {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        client_id: impl Into<String>,
        config: BackupConfig,
    ) -> Self {
        let status = BackupStatus {
            enabled: true,
            interval_secs: config.interval.as_secs(),
            directory: config.directory.display().to_string(),
            ..Default::default()
        };
        Self {
            store,
            client_id: client_id.into(),
            config,
            status: Arc::new(RwLock::new(status)),
        }
    }

    pub fn handle(&self) -> BackupHandle {
        BackupHandle {
            status: self.status.clone(),
        }
    }

    /// Run forever, first backup after one full interval
    pub fn spawn(self) -> (BackupHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(async move {
            info!(
                "💾 Session backups every {}s into {}",
                self.config.interval.as_secs(),
                self.config.directory.display()
            );
            let mut ticker =
                tokio::time::interval_at(Instant::now() + self.config.interval, self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // recorded in the status either way
                let _ = self.run_once().await;
            }
        });
        (handle, task)
    }

    /// Take one backup now and record the outcome
    pub async fn run_once(&self) -> Result<PathBuf, BackupError> {
        let result = self.write_backup().await;

        let mut status = self
            .status
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        status.runs += 1;
        match &result {
            Ok(path) => {
                info!("💾 Session backup written to {}", path.display());
                status.last_success_at = Some(Utc::now());
                status.last_error = None;
                status.last_archive = Some(path.display().to_string());
            }
            Err(e) => {
                warn!("❌ Session backup failed: {}", e);
                status.failures += 1;
                status.last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn write_backup(&self) -> Result<PathBuf, BackupError> {
        let entries = self.store.snapshot(&self.client_id).await?;
        debug!(
            "Snapshot of {} holds {} keys",
            self.client_id,
            entries.len()
        );

        let directory = self.config.directory.clone();
        let client_id = self.client_id.clone();
        let retain = self.config.retain;

        tokio::task::spawn_blocking(move || {
            let path = write_archive(&directory, &client_id, Utc::now(), &entries)?;
            prune_archives(&directory, &client_id, retain)?;
            Ok::<_, BackupError>(path)
        })
        .await
        .map_err(|e| BackupError::Task(e.to_string()))?
    }
}

/// Keep file names to a safe alphabet
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        // empty, "." and ".." are not valid entry names
        return format!("_{cleaned}");
    }
    cleaned
}

fn archive_prefix(client_id: &str) -> String {
    format!("session-{}-", sanitize(client_id))
}

/// Whether `name` is an archive of exactly this client. The prefix alone is
/// not enough: `session-ci-` also starts `session-ci-bot-...`.
fn is_archive_of(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(ARCHIVE_SUFFIX))
        .is_some_and(|stamp| NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).is_ok())
}

/// Write one archive into `directory` and return its path
pub fn write_archive(
    directory: &Path,
    client_id: &str,
    created_at: DateTime<Utc>,
    entries: &BTreeMap<String, Vec<u8>>,
) -> Result<PathBuf, BackupError> {
    std::fs::create_dir_all(directory)?;

    let file_name = format!(
        "{}{}{}",
        archive_prefix(client_id),
        created_at.format(TIMESTAMP_FORMAT),
        ARCHIVE_SUFFIX
    );
    let target = directory.join(file_name);

    let manifest = Manifest {
        client_id,
        created_at,
        keys: entries.keys().map(String::as_str).collect(),
    };
    let manifest = serde_json::to_vec_pretty(&manifest)?;

    let tmp = tempfile::NamedTempFile::new_in(directory)?;
    let mut encoder = GzEncoder::new(tmp, Compression::default());
    {
        let mut builder = tar::Builder::new(&mut encoder);
        for (key, value) in entries {
            append(&mut builder, &sanitize(key), value, created_at)?;
        }
        append(&mut builder, MANIFEST_NAME, &manifest, created_at)?;
        builder.finish()?;
    }
    let mut tmp = encoder.finish()?;
    tmp.flush()?;
    tmp.persist(&target).map_err(|e| e.error)?;

    Ok(target)
}

fn append<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
    created_at: DateTime<Utc>,
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o600);
    header.set_mtime(created_at.timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, name, data)
}

/// Delete the oldest archives of `client_id` beyond `retain`; 0 keeps all
pub fn prune_archives(
    directory: &Path,
    client_id: &str,
    retain: usize,
) -> Result<usize, BackupError> {
    if retain == 0 {
        return Ok(0);
    }
    let prefix = archive_prefix(client_id);
    let mut archives: Vec<PathBuf> = std::fs::read_dir(directory)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| is_archive_of(name, &prefix))
        })
        .collect();
    if archives.len() <= retain {
        return Ok(0);
    }

    // timestamps are fixed width, so names sort oldest first
    archives.sort();
    let excess = archives.len() - retain;
    for old in &archives[..excess] {
        debug!("🗑️ Removing old backup {}", old.display());
        std::fs::remove_file(old)?;
    }
    Ok(excess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Duration;
    use tempfile::TempDir;
    use zoe_wa_transport::MemoryCredentialStore;

    async fn store() -> anyhow::Result<Arc<dyn CredentialStore>> {
        let store = MemoryCredentialStore::new();
        store.save("ci-bot", "session", br#"{"linked":true}"#).await?;
        store.save("ci-bot", "pre-keys", b"\x01\x02\x03").await?;
        store.save("other-bot", "session", b"not mine").await?;
        Ok(Arc::new(store))
    }

    fn config(dir: &Path, retain: usize) -> BackupConfig {
        BackupConfig {
            interval: Duration::from_secs(60),
            directory: dir.to_path_buf(),
            retain,
        }
    }

    fn read_archive(path: &Path) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
        let file = std::fs::File::open(path)?;
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let mut entries = BTreeMap::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.display().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            entries.insert(name, data);
        }
        Ok(entries)
    }

    #[tokio::test]
    async fn writes_archive_with_manifest() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let scheduler = BackupScheduler::new(store().await?, "ci-bot", config(dir.path(), 7));

        let path = scheduler.run_once().await?;
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("session-ci-bot-"));
        assert!(name.ends_with(".tar.gz"));

        let entries = read_archive(&path)?;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries["session"], br#"{"linked":true}"#.to_vec());
        assert_eq!(entries["pre-keys"], vec![1, 2, 3]);

        let manifest: serde_json::Value = serde_json::from_slice(&entries[MANIFEST_NAME])?;
        assert_eq!(manifest["clientId"], "ci-bot");
        assert_eq!(manifest["keys"], serde_json::json!(["pre-keys", "session"]));

        // no temp files left behind
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);

        let status = scheduler.handle().status();
        assert!(status.enabled);
        assert_eq!(status.runs, 1);
        assert_eq!(status.failures, 0);
        assert!(status.last_success_at.is_some());
        assert_eq!(status.last_archive, Some(path.display().to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_recorded() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file")?;

        let scheduler = BackupScheduler::new(store().await?, "ci-bot", config(&blocker, 7));
        assert!(scheduler.run_once().await.is_err());

        let status = scheduler.handle().status();
        assert_eq!(status.runs, 1);
        assert_eq!(status.failures, 1);
        assert!(status.last_error.is_some());
        assert!(status.last_success_at.is_none());
        Ok(())
    }

    #[test]
    fn prunes_oldest_archives() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        for ts in ["20260101T000000", "20260102T000000", "20260103T000000"] {
            std::fs::write(
                dir.path().join(format!("session-ci-bot-{ts}.000000000Z.tar.gz")),
                b"old",
            )?;
        }
        std::fs::write(dir.path().join("session-other-20250101T000000.000000000Z.tar.gz"), b"x")?;

        assert_eq!(prune_archives(dir.path(), "ci-bot", 2)?, 1);
        assert!(
            !dir.path()
                .join("session-ci-bot-20260101T000000.000000000Z.tar.gz")
                .exists()
        );
        // other clients are left alone
        assert!(
            dir.path()
                .join("session-other-20250101T000000.000000000Z.tar.gz")
                .exists()
        );

        assert_eq!(prune_archives(dir.path(), "ci-bot", 0)?, 0);
        Ok(())
    }

    #[test]
    fn prefix_sharing_clients_keep_their_archives() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        for ts in ["20260101T000000", "20260102T000000"] {
            std::fs::write(
                dir.path().join(format!("session-ci-bot-{ts}.000000000Z.tar.gz")),
                b"old",
            )?;
        }
        let created_at = DateTime::parse_from_rfc3339("2026-01-03T00:00:00Z")?.with_timezone(&Utc);
        let own = write_archive(dir.path(), "ci", created_at, &BTreeMap::new())?;

        assert_eq!(prune_archives(dir.path(), "ci", 2)?, 0);
        assert!(own.exists());
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 3);

        // and the longer id never counts the shorter one's archive
        assert_eq!(prune_archives(dir.path(), "ci-bot", 1)?, 1);
        assert!(own.exists());
        assert!(
            dir.path()
                .join("session-ci-bot-20260102T000000.000000000Z.tar.gz")
                .exists()
        );
        Ok(())
    }

    #[test]
    fn archive_names_are_matched_exactly() {
        let prefix = archive_prefix("ci");
        assert!(is_archive_of("session-ci-20260101T000000.000000000Z.tar.gz", &prefix));
        assert!(!is_archive_of("session-ci-bot-20260101T000000.000000000Z.tar.gz", &prefix));
        assert!(!is_archive_of("session-ci-20260101T000000.000000000Z.tar", &prefix));
        assert!(!is_archive_of("session-ci-latest.tar.gz", &prefix));
    }

    #[test]
    fn key_names_are_sanitized() {
        assert_eq!(sanitize("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize("app-state:sync"), "app-state_sync");
        assert_eq!(sanitize(".."), "_..");
        assert_eq!(sanitize(""), "_");
    }

    #[tokio::test]
    async fn first_backup_waits_one_interval() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let scheduler = BackupScheduler::new(store().await?, "ci-bot", config(dir.path(), 7));
        let (handle, task) = scheduler.spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.status().runs, 0);
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        task.abort();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn backup_runs_after_one_interval() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let scheduler = BackupScheduler::new(store().await?, "ci-bot", config(dir.path(), 7));
        let (handle, task) = scheduler.spawn();

        tokio::time::sleep(Duration::from_secs(61)).await;
        // the archive is written on the blocking pool
        for _ in 0..200 {
            if handle.status().runs > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let status = handle.status();
        assert_eq!(status.runs, 1);
        assert_eq!(status.failures, 0);
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
        task.abort();
        Ok(())
    }
}
