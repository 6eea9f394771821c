//! Waiting for delivery acknowledgments.
//!
//! One [`AckWaitCoordinator`] owns the single subscription to the transport's
//! receipt stream. Every wait registers a pending entry keyed by message id;
//! the entry is resolved by whichever comes first, a receipt at or above the
//! requested level or the wait's timer. Resolution always starts by removing
//! the entry from the registry under its lock, so only one of the two can
//! ever complete a wait. The loser finds nothing and does nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zoe_wa_transport::{AckLevel, DeliveryReceipt, OutboundMessage};

/// How many unawaited messages keep their receipt history around
const DEFAULT_RECENT_CAPACITY: usize = 1024;

/// Result of waiting for a message to reach an acknowledgment level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckOutcome {
    /// The qualifying level, or the last level seen when the wait timed out
    pub level: AckLevel,
    pub timed_out: bool,
}

/// One outstanding wait
#[derive(Debug, Clone)]
pub struct AckWaitRequest {
    pub message_id: String,
    pub minimum: AckLevel,
    pub timeout: Duration,
    pub created_at: Instant,
}

struct PendingWait {
    // tells a wait apart from a later one that replaced it
    token: u64,
    request: AckWaitRequest,
    last_seen: Option<AckLevel>,
    done: oneshot::Sender<AckOutcome>,
}

enum Registration {
    Resolved(AckOutcome),
    Pending(oneshot::Receiver<AckOutcome>, u64),
}

struct Registry {
    pending: HashMap<String, PendingWait>,
    // receipts for messages nobody waits on (yet), in arrival order
    recent: HashMap<String, Vec<AckLevel>>,
    recent_order: VecDeque<String>,
    recent_capacity: usize,
    next_token: u64,
}

impl Registry {
    fn new(recent_capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            recent: HashMap::new(),
            recent_order: VecDeque::new(),
            recent_capacity,
            next_token: 0,
        }
    }

    fn observe(&mut self, receipt: DeliveryReceipt) {
        match self.pending.get_mut(&receipt.message_id) {
            None => self.remember(receipt),
            Some(wait) if receipt.level < wait.request.minimum => {
                debug!(
                    "📭 {} reached {}, waiting for {}",
                    receipt.message_id, receipt.level, wait.request.minimum
                );
                wait.last_seen = Some(receipt.level);
            }
            Some(_) => {
                if let Some(wait) = self.pending.remove(&receipt.message_id) {
                    info!(
                        "📬 {} acknowledged at {} after {:?}",
                        receipt.message_id,
                        receipt.level,
                        wait.request.created_at.elapsed()
                    );
                    // the waiter may be gone already, that's fine
                    let _ = wait.done.send(AckOutcome {
                        level: receipt.level,
                        timed_out: false,
                    });
                }
            }
        }
    }

    fn remember(&mut self, receipt: DeliveryReceipt) {
        if self.recent_capacity == 0 {
            return;
        }
        let DeliveryReceipt {
            message_id, level, ..
        } = receipt;

        if let Some(levels) = self.recent.get_mut(&message_id) {
            levels.push(level);
            return;
        }
        self.recent_order.push_back(message_id.clone());
        self.recent.insert(message_id, vec![level]);

        while self.recent_order.len() > self.recent_capacity {
            if let Some(evicted) = self.recent_order.pop_front() {
                self.recent.remove(&evicted);
            }
        }
    }

    fn take_recent(&mut self, message_id: &str) -> Vec<AckLevel> {
        match self.recent.remove(message_id) {
            Some(levels) => {
                self.recent_order.retain(|id| id != message_id);
                levels
            }
            None => Vec::new(),
        }
    }

    fn register(&mut self, request: AckWaitRequest) -> Registration {
        let seen = self.take_recent(&request.message_id);
        if let Some(level) = seen.iter().copied().find(|level| *level >= request.minimum) {
            debug!(
                "📬 {} was already acknowledged at {}",
                request.message_id, level
            );
            return Registration::Resolved(AckOutcome {
                level,
                timed_out: false,
            });
        }

        let (done, rx) = oneshot::channel();
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        let message_id = request.message_id.clone();
        let previous = self.pending.insert(
            message_id,
            PendingWait {
                token,
                request,
                last_seen: seen.last().copied(),
                done,
            },
        );
        if let Some(previous) = previous {
            warn!(
                "⚠️ Replaced an existing wait for {}",
                previous.request.message_id
            );
        }
        Registration::Pending(rx, token)
    }

    /// Remove the wait registered under `token` without resolving it
    /// through its channel. A newer wait for the same id is left alone.
    fn expire(&mut self, message_id: &str, token: u64) -> Option<PendingWait> {
        let current = self
            .pending
            .get(message_id)
            .is_some_and(|wait| wait.token == token);
        if current {
            self.pending.remove(message_id)
        } else {
            None
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the pending entry if the wait is dropped before it resolved
struct PendingGuard {
    registry: Arc<Mutex<Registry>>,
    message_id: String,
    token: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if lock(&self.registry)
            .expire(&self.message_id, self.token)
            .is_some()
        {
            debug!("🧹 Dropped unresolved wait for {}", self.message_id);
        }
    }
}

/// Matches delivery receipts to outstanding waits
pub struct AckWaitCoordinator {
    registry: Arc<Mutex<Registry>>,
    dispatcher: JoinHandle<()>,
}

impl AckWaitCoordinator {
    /// Start dispatching receipts from `receipts`
    pub fn new(receipts: broadcast::Receiver<DeliveryReceipt>) -> Self {
        Self::with_recent_capacity(receipts, DEFAULT_RECENT_CAPACITY)
    }

    /// Like [`AckWaitCoordinator::new`], remembering receipts of at most
    /// `recent_capacity` unawaited messages
    pub fn with_recent_capacity(
        mut receipts: broadcast::Receiver<DeliveryReceipt>,
        recent_capacity: usize,
    ) -> Self {
        let registry = Arc::new(Mutex::new(Registry::new(recent_capacity)));
        let shared = registry.clone();

        let dispatcher = tokio::spawn(async move {
            debug!("AckWaitCoordinator: starting receipt dispatcher");
            loop {
                match receipts.recv().await {
                    Ok(receipt) => lock(&shared).observe(receipt),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("⚠️ Receipt dispatcher lagged, skipped {} receipts", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("📪 Receipt stream closed, pending waits will time out");
                        break;
                    }
                }
            }
        });

        Self {
            registry,
            dispatcher,
        }
    }

    /// Wait until `message` is acknowledged at `minimum` or better.
    ///
    /// Resolves exactly once: with the first qualifying level, or, once
    /// `timeout` elapsed, with the last level seen for the message
    /// (`server` if none) and `timed_out` set.
    pub async fn wait_for(
        &self,
        message: &OutboundMessage,
        minimum: AckLevel,
        timeout: Duration,
    ) -> AckOutcome {
        let request = AckWaitRequest {
            message_id: message.id.clone(),
            minimum,
            timeout,
            created_at: Instant::now(),
        };

        let (mut rx, token) = match lock(&self.registry).register(request) {
            Registration::Resolved(outcome) => return outcome,
            Registration::Pending(rx, token) => (rx, token),
        };
        let _guard = PendingGuard {
            registry: self.registry.clone(),
            message_id: message.id.clone(),
            token,
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // sender dropped unresolved: the wait was replaced
                AckOutcome {
                    level: AckLevel::Server,
                    timed_out: true,
                }
            }
            Err(_) => {
                let expired = lock(&self.registry).expire(&message.id, token);
                match expired {
                    Some(wait) => {
                        let level = wait.last_seen.unwrap_or(AckLevel::Server);
                        info!(
                            "⏰ {} not acknowledged at {} within {:?}, last seen {}",
                            message.id, minimum, timeout, level
                        );
                        AckOutcome {
                            level,
                            timed_out: true,
                        }
                    }
                    // a receipt won the race and already resolved the wait
                    None => rx.try_recv().unwrap_or(AckOutcome {
                        level: AckLevel::Server,
                        timed_out: true,
                    }),
                }
            }
        }
    }

    /// Number of waits currently outstanding
    pub fn pending(&self) -> usize {
        lock(&self.registry).pending.len()
    }
}

impl Drop for AckWaitCoordinator {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}
