use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use zoe_wa_transport::{AckLevel, redact_url};

/// Shortest enabled backup interval
pub const MIN_BACKUP_INTERVAL_SECS: u64 = 60;

/// Command line arguments for the notification gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "zoe-notify-gateway")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Zoe Notify Gateway - deliver notifications into WhatsApp groups")]
pub struct GatewayArgs {
    /// Shared secret callers must present as `bot-token`
    #[arg(long, env = "BOT_TOKEN", hide_env_values = true)]
    pub bot_token: Option<String>,

    /// Where the linked session lives (`redis://...` or `memory://`)
    #[arg(long, env = "SESSION_STORE_URL", hide_env_values = true)]
    pub store_url: Option<String>,

    /// Host address to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Session namespace; changing it forces linking a new device
    #[arg(long, env = "WA_CLIENT_ID", default_value = "notify-gateway")]
    pub client_id: String,

    /// Acknowledgment level waited for when a request names none
    #[arg(long, env = "ACK_DEFAULT", default_value = "server")]
    pub ack_default: String,

    /// Acknowledgment wait when a request names none
    #[arg(long, env = "ACK_TIMEOUT_MS", default_value_t = 15_000)]
    pub ack_timeout_ms: u64,

    /// Upper bound for a requested acknowledgment wait
    #[arg(long, env = "ACK_TIMEOUT_MAX_MS", default_value_t = 120_000)]
    pub ack_timeout_max_ms: u64,

    /// Seconds between session backups, 0 disables them
    #[arg(long, env = "BACKUP_INTERVAL_SECS", default_value_t = 0)]
    pub backup_interval_secs: u64,

    /// Directory backup archives are written to
    #[arg(long, env = "BACKUP_DIR", default_value = "./backups")]
    pub backup_dir: PathBuf,

    /// Number of backup archives kept, 0 keeps all
    #[arg(long, env = "BACKUP_RETAIN", default_value_t = 7)]
    pub backup_retain: usize,

    /// Requests per minute and client address on /send-group, 0 disables
    #[arg(long, env = "RATE_LIMIT_PER_MINUTE", default_value_t = 60)]
    pub rate_limit_per_minute: u32,

    /// JSON chat listing for the loopback transport
    #[arg(long, env = "LOOPBACK_CHATS_FILE")]
    pub chats_file: Option<PathBuf>,
}

/// Fatal configuration problems, reported before anything starts
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("BOT_TOKEN is required")]
    MissingBotToken,

    #[error("SESSION_STORE_URL is required")]
    MissingStoreUrl,

    #[error("unsupported session store url {0} (expected redis:// or memory://)")]
    UnsupportedStoreUrl(String),

    #[error("backup interval of {0}s is below the minimum of 60s")]
    BackupIntervalTooShort(u64),

    #[error("acknowledgment timeout must be greater than zero")]
    ZeroAckTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub interval: Duration,
    pub directory: PathBuf,
    pub retain: usize,
}

/// Validated gateway configuration
#[derive(Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub bot_token: String,
    pub store_url: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub ack_default: AckLevel,
    pub ack_timeout: Duration,
    pub ack_timeout_max: Duration,
    /// `None` when backups are disabled
    pub backup: Option<BackupConfig>,
    pub rate_limit_per_minute: u32,
    pub chats_file: Option<PathBuf>,
}

impl GatewayConfig {
    /// Defaults with the two required values filled in
    pub fn new(bot_token: impl Into<String>, store_url: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            store_url: store_url.into(),
            host: "0.0.0.0".to_string(),
            port: 3000,
            client_id: "notify-gateway".to_string(),
            ack_default: AckLevel::Server,
            ack_timeout: Duration::from_millis(15_000),
            ack_timeout_max: Duration::from_millis(120_000),
            backup: None,
            rate_limit_per_minute: 60,
            chats_file: None,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The wait for one request: the default when `requested_ms` is absent
    /// or zero, else the requested value capped at the maximum
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            None | Some(0) => self.ack_timeout,
            Some(ms) => Duration::from_millis(ms).min(self.ack_timeout_max),
        }
    }
}

// hand written so the token never ends up in a log line
impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bot_token", &"***")
            .field("store_url", &redact_url(&self.store_url))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("ack_default", &self.ack_default)
            .field("ack_timeout", &self.ack_timeout)
            .field("ack_timeout_max", &self.ack_timeout_max)
            .field("backup", &self.backup)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("chats_file", &self.chats_file)
            .finish()
    }
}

impl TryFrom<GatewayArgs> for GatewayConfig {
    type Error = ConfigError;

    fn try_from(args: GatewayArgs) -> Result<Self, Self::Error> {
        let bot_token = args
            .bot_token
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::MissingBotToken)?;

        let store_url = args
            .store_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingStoreUrl)?;
        let supported = ["redis://", "rediss://", "memory://"]
            .iter()
            .any(|scheme| store_url.starts_with(scheme));
        if !supported {
            return Err(ConfigError::UnsupportedStoreUrl(redact_url(&store_url)));
        }

        let backup = match args.backup_interval_secs {
            0 => None,
            secs if secs < MIN_BACKUP_INTERVAL_SECS => {
                return Err(ConfigError::BackupIntervalTooShort(secs));
            }
            secs => Some(BackupConfig {
                interval: Duration::from_secs(secs),
                directory: args.backup_dir,
                retain: args.backup_retain,
            }),
        };

        if args.ack_timeout_ms == 0 || args.ack_timeout_max_ms == 0 {
            return Err(ConfigError::ZeroAckTimeout);
        }
        let ack_timeout_max = Duration::from_millis(args.ack_timeout_max_ms);
        // a default above the cap would never be honoured anyway
        let ack_timeout = Duration::from_millis(args.ack_timeout_ms).min(ack_timeout_max);

        Ok(Self {
            bot_token,
            store_url,
            host: args.host,
            port: args.port,
            client_id: args.client_id,
            ack_default: AckLevel::parse_lenient(&args.ack_default),
            ack_timeout,
            ack_timeout_max,
            backup,
            rate_limit_per_minute: args.rate_limit_per_minute,
            chats_file: args.chats_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> GatewayArgs {
        let mut argv = vec![
            "zoe-notify-gateway",
            "--bot-token",
            "s3cret",
            "--store-url",
            "memory://",
        ];
        argv.extend_from_slice(extra);
        GatewayArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let config = GatewayConfig::try_from(args(&[])).unwrap();
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
        assert_eq!(config.client_id, "notify-gateway");
        assert_eq!(config.ack_default, AckLevel::Server);
        assert_eq!(config.ack_timeout, Duration::from_secs(15));
        assert_eq!(config.ack_timeout_max, Duration::from_secs(120));
        assert_eq!(config.backup, None);
        assert_eq!(config.rate_limit_per_minute, 60);
    }

    #[test]
    fn missing_secrets_are_fatal() {
        let mut missing_token = args(&[]);
        missing_token.bot_token = None;
        assert_eq!(
            GatewayConfig::try_from(missing_token),
            Err(ConfigError::MissingBotToken)
        );

        let mut blank_token = args(&[]);
        blank_token.bot_token = Some("  ".to_string());
        assert_eq!(
            GatewayConfig::try_from(blank_token),
            Err(ConfigError::MissingBotToken)
        );

        let mut missing_store = args(&[]);
        missing_store.store_url = None;
        assert_eq!(
            GatewayConfig::try_from(missing_store),
            Err(ConfigError::MissingStoreUrl)
        );
    }

    #[test]
    fn store_scheme_is_checked() {
        let mut bad = args(&[]);
        bad.store_url = Some("postgres://user:pw@db/sessions".to_string());
        let err = GatewayConfig::try_from(bad).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedStoreUrl(_)));
        assert!(!err.to_string().contains("pw"));

        let mut redis = args(&[]);
        redis.store_url = Some("redis://127.0.0.1:6379".to_string());
        assert!(GatewayConfig::try_from(redis).is_ok());
    }

    #[test]
    fn backup_interval_bounds() {
        assert_eq!(
            GatewayConfig::try_from(args(&["--backup-interval-secs", "30"])),
            Err(ConfigError::BackupIntervalTooShort(30))
        );

        let config = GatewayConfig::try_from(args(&[
            "--backup-interval-secs",
            "3600",
            "--backup-dir",
            "/var/backups/wa",
            "--backup-retain",
            "3",
        ]))
        .unwrap();
        assert_eq!(
            config.backup,
            Some(BackupConfig {
                interval: Duration::from_secs(3600),
                directory: PathBuf::from("/var/backups/wa"),
                retain: 3,
            })
        );
    }

    #[test]
    fn zero_ack_timeout_is_rejected() {
        assert_eq!(
            GatewayConfig::try_from(args(&["--ack-timeout-ms", "0"])),
            Err(ConfigError::ZeroAckTimeout)
        );
    }

    #[test]
    fn unknown_ack_default_falls_back_to_server() {
        let config = GatewayConfig::try_from(args(&["--ack-default", "delivered"])).unwrap();
        assert_eq!(config.ack_default, AckLevel::Server);

        let config = GatewayConfig::try_from(args(&["--ack-default", "read"])).unwrap();
        assert_eq!(config.ack_default, AckLevel::Read);
    }

    #[test]
    fn effective_timeout() {
        let config = GatewayConfig::new("s3cret", "memory://");
        assert_eq!(config.effective_timeout(None), Duration::from_secs(15));
        assert_eq!(config.effective_timeout(Some(0)), Duration::from_secs(15));
        assert_eq!(config.effective_timeout(Some(5000)), Duration::from_secs(5));
        assert_eq!(
            config.effective_timeout(Some(10_000_000)),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn debug_output_hides_token() {
        let config = GatewayConfig::new("s3cret", "redis://:hunter2@cache:6379");
        let printed = format!("{config:?}");
        assert!(!printed.contains("s3cret"));
        assert!(!printed.contains("hunter2"));
    }
}
