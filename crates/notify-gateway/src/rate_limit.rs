//! Per client address request limiting for the send endpoint.
//!
//! Fixed one minute windows per address. The number of tracked addresses is
//! capped; when the cap is reached, expired windows are dropped first and a
//! new address is refused if that does not free a slot.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

const CLEANUP_EVERY: u64 = 100;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window, 0 disables limiting
    pub max_requests: u32,
    pub window: Duration,
    pub max_tracked: usize,
}

impl RateLimitConfig {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            ..Self::default()
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            max_tracked: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Requests without a known peer address share the `None` bucket
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: RwLock<HashMap<Option<IpAddr>, Window>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
            checks: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.max_requests > 0
    }

    /// Count one request from `peer`, failing once its window is used up
    pub fn check(&self, peer: Option<IpAddr>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let count = self.checks.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % CLEANUP_EVERY == 0 {
            self.cleanup();
        }

        let now = Instant::now();
        let mut windows = self
            .windows
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !windows.contains_key(&peer) && windows.len() >= self.config.max_tracked {
            let window = self.config.window;
            windows.retain(|_, w| now.duration_since(w.started) < window);
            if windows.len() >= self.config.max_tracked {
                warn!(
                    "🚦 Tracking {} client addresses already, refusing {:?}",
                    windows.len(),
                    peer
                );
                return Err(GatewayError::RateLimited);
            }
        }

        let window = windows.entry(peer).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= self.config.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }
        if window.count >= self.config.max_requests {
            warn!("🚦 Rate limit exceeded for {:?}", peer);
            return Err(GatewayError::RateLimited);
        }
        window.count += 1;
        Ok(())
    }

    /// Drop windows that have expired
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut windows = self
            .windows
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.started) < self.config.window);
        if windows.len() != before {
            debug!("🧹 Dropped {} expired rate limit windows", before - windows.len());
        }
    }

    pub fn tracked(&self) -> usize {
        self.windows
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
