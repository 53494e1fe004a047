//
// Copyright 2026 Moltz Project. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Session identity and shared client state.
//!
//! Every connection sequence gets a fresh monotonic session id. Background
//! tasks capture the id they were spawned under and compare it against the
//! current value before touching shared state; a task whose id is stale
//! exits silently instead of clobbering a newer session. Combined with the
//! connect gate (one connection sequence at a time) this makes overlapping
//! connect, disconnect, and reconnect calls safe without any task registry.

use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;

use crate::correlator::Correlator;
use crate::health::HealthMetrics;

/// Observable lifecycle state of the gateway connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionStatus {
    /// No connection and none in progress.
    Disconnected,
    /// A connection sequence is running.
    Connecting,
    /// Handshake accepted; requests flow.
    #[serde(rename_all = "camelCase")]
    Ready {
        /// Monotonic id of the live session.
        session_id: u64,
        /// URL that actually connected.
        used_url: String,
        /// Protocol version the gateway agreed to.
        protocol: i64,
    },
    /// A session was lost and the supervisor is retrying.
    #[serde(rename_all = "camelCase")]
    Reconnecting {
        /// 0-indexed attempt about to be made.
        attempt: u32,
        /// Delay before that attempt, in milliseconds.
        next_retry_ms: u64,
        /// What ended the previous session.
        reason: String,
    },
    /// The supervisor gave up or was told not to retry.
    #[serde(rename_all = "camelCase")]
    Failed {
        /// Terminal failure description.
        reason: String,
        /// Whether a fresh explicit connect could plausibly succeed.
        can_retry: bool,
    },
    /// Reconnection is suppressed by an explicit disconnect or offline
    /// toggle.
    Suspended,
}

impl ConnectionStatus {
    /// Whether requests may be issued in this state.
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionStatus::Ready { .. })
    }
}

/// Monotonic session id source.
#[derive(Debug, Default)]
pub(crate) struct SessionCounter(AtomicU64);

impl SessionCounter {
    /// Allocate the next session id and make it current.
    pub fn begin(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The currently live session id.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether `id` is still the live session.
    pub fn is_current(&self, id: u64) -> bool {
        self.current() == id
    }

    /// Invalidate the live session without starting a new one, so stale
    /// tasks drain out.
    pub fn invalidate(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// State shared between the client handle, the supervisor, and the
/// per-session background tasks.
pub(crate) struct Shared {
    /// Session id source; see module docs for the staleness protocol.
    pub sessions: SessionCounter,
    /// Serializes connection sequences. Held across resolve, establish, and
    /// handshake so two concurrent connect calls cannot race.
    pub gate: tokio::sync::Mutex<()>,
    /// Request/response correlation and the ready gate for outbound traffic.
    pub correlator: Correlator,
    /// Lifecycle state observable by the UI.
    pub status: watch::Sender<ConnectionStatus>,
    /// Set by explicit disconnect / offline toggle; checked before any
    /// automatic reconnection step.
    pub suppress_reconnect: AtomicBool,
    /// URL of the last session that reached ready, tried first on reconnect.
    pub last_good: Mutex<Option<String>>,
    /// Guard ensuring at most one reconnection loop runs at a time.
    pub reconnect_active: AtomicBool,
    /// Latency and keepalive bookkeeping for the live session.
    pub health: Mutex<HealthMetrics>,
}

impl Shared {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            sessions: SessionCounter::default(),
            gate: tokio::sync::Mutex::new(()),
            correlator: Correlator::new(),
            status,
            suppress_reconnect: AtomicBool::new(false),
            last_good: Mutex::new(None),
            reconnect_active: AtomicBool::new(false),
            health: Mutex::new(HealthMetrics::default()),
        }
    }

    /// Publish a status transition.
    pub fn set_status(&self, status: ConnectionStatus) {
        tracing::debug!(?status, "connection status changed");
        // send_replace never fails even with no subscribers.
        self.status.send_replace(status);
    }

    pub fn reconnect_suppressed(&self) -> bool {
        self.suppress_reconnect.load(Ordering::SeqCst)
    }

    pub fn set_reconnect_suppressed(&self, suppressed: bool) {
        self.suppress_reconnect.store(suppressed, Ordering::SeqCst);
    }
}

/// Messages accepted by a session's writer task.
#[derive(Debug)]
pub(crate) enum Outgoing {
    /// A complete JSON frame to send as a text message.
    Frame(String),
    /// Keepalive ping.
    Ping(Vec<u8>),
    /// Reply to a server ping.
    Pong(Vec<u8>),
    /// Close the socket and stop the writer.
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_monotonic() {
        let counter = SessionCounter::default();
        let a = counter.begin();
        let b = counter.begin();
        assert!(b > a);
        assert!(counter.is_current(b));
        assert!(!counter.is_current(a));
    }

    #[test]
    fn invalidate_orphans_the_live_session() {
        let counter = SessionCounter::default();
        let id = counter.begin();
        assert!(counter.is_current(id));
        counter.invalidate();
        assert!(!counter.is_current(id));
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let status = ConnectionStatus::Reconnecting {
            attempt: 2,
            next_retry_ms: 4000,
            reason: "connection lost".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains(r#""state":"reconnecting""#));
        assert!(json.contains(r#""nextRetryMs":4000"#));
    }

    #[test]
    fn only_ready_is_ready() {
        assert!(ConnectionStatus::Ready {
            session_id: 1,
            used_url: "ws://x".to_string(),
            protocol: 3,
        }
        .is_ready());
        assert!(!ConnectionStatus::Connecting.is_ready());
        assert!(!ConnectionStatus::Suspended.is_ready());
    }
}
