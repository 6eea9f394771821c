//! Process wide readiness of the WhatsApp transport.
//!
//! The state only moves when the transport reports a lifecycle change, using
//! the fixed table in [`ReadinessState::on_event`]. The writing half
//! ([`ReadinessDriver`]) is owned by the lifecycle listener task; request
//! handlers only ever hold a [`ReadinessHandle`].

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{info, warn};
use zoe_wa_transport::ConnectionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Initializing,
    Ready,
    Disconnected,
    AuthFailed,
}

impl ReadinessState {
    /// Next state after the transport reported `event`
    pub fn on_event(self, event: ConnectionStatus) -> Self {
        use ConnectionStatus as Event;
        use ReadinessState as State;

        match (self, event) {
            (_, Event::Connected) => State::Ready,
            (_, Event::LoggedOut) => State::AuthFailed,
            // a broken link stays broken until the device is linked again
            (State::AuthFailed, _) => State::AuthFailed,
            (State::Initializing, Event::Connecting) => State::Initializing,
            (_, Event::Connecting | Event::Disconnected) => State::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReadinessState::Initializing => "initializing",
            ReadinessState::Ready => "ready",
            ReadinessState::Disconnected => "disconnected",
            ReadinessState::AuthFailed => "auth_failed",
        }
    }
}

/// Create a fresh readiness pair, starting at [`ReadinessState::Initializing`]
pub fn readiness() -> (ReadinessDriver, ReadinessHandle) {
    let (tx, rx) = watch::channel(ReadinessState::Initializing);
    (ReadinessDriver { tx }, ReadinessHandle { rx })
}

/// Writing half, fed by transport lifecycle events
#[derive(Debug)]
pub struct ReadinessDriver {
    tx: watch::Sender<ReadinessState>,
}

impl ReadinessDriver {
    /// Apply one lifecycle event and return the resulting state
    pub fn apply(&self, event: ConnectionStatus) -> ReadinessState {
        let mut next = ReadinessState::Initializing;
        self.tx.send_modify(|state| {
            let previous = *state;
            *state = previous.on_event(event);
            next = *state;
            if previous != next {
                info!(
                    "📶 Readiness {} -> {} ({:?})",
                    previous.as_str(),
                    next.as_str(),
                    event
                );
            }
        });
        next
    }

    /// Follow a lifecycle stream until it closes
    pub fn spawn(self, events: broadcast::Receiver<ConnectionStatus>) -> JoinHandle<()> {
        let mut events = BroadcastStream::new(events);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        self.apply(event);
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!("⚠️ Lifecycle listener lagged, skipped {} events", skipped);
                    }
                }
            }
            warn!("📴 Lifecycle stream closed");
        })
    }
}

/// Read-only view on the readiness state
#[derive(Debug, Clone)]
pub struct ReadinessHandle {
    rx: watch::Receiver<ReadinessState>,
}

impl ReadinessHandle {
    pub fn current(&self) -> ReadinessState {
        *self.rx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.current() == ReadinessState::Ready
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for(&self, predicate: impl Fn(ReadinessState) -> bool) -> ReadinessState {
        let mut rx = self.rx.clone();
        let reached = rx.wait_for(|state| predicate(*state)).await.map(|state| *state);
        // driver gone, nothing will change any more
        reached.unwrap_or_else(|_| *rx.borrow())
    }
}
