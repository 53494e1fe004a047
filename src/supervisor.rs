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

//! Connection supervision.
//!
//! One connect sequence runs at a time, under the shared gate: resolve
//! candidates, establish a transport, run the handshake, then bind the
//! correlator and spawn the session's read loop and keepalive. Losing an
//! established session (or failing a retryable connect) hands off to the
//! reconnection loop, which consults the configured strategy between
//! attempts and stands down the moment reconnection is suppressed or the
//! failure turns out to need new credentials.

use futures_util::StreamExt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::config::GatewayConfig;
use crate::error::ClientError;
use crate::frame::Frame;
use crate::handshake::{self, TransportReader};
use crate::secrets::TokenStore;
use crate::session::{ConnectionStatus, Outgoing, Shared};
use crate::transport::{self, ResolveInputs, TransportError};

/// How a successful connect sequence ended up talking to the gateway.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    /// Monotonic id of the session that reached ready.
    pub session_id: u64,
    /// URL that actually connected.
    pub used_url: String,
    /// Whether the `ws` to `wss` upgrade was what succeeded.
    pub scheme_upgraded: bool,
    /// Negotiated protocol version.
    pub protocol: i64,
}

pub(crate) type SharedStore = Option<Arc<dyn TokenStore>>;

/// Run one gated connect sequence.
///
/// Returns early with the live session's outcome if another caller already
/// got the connection to ready while this one waited on the gate.
pub(crate) async fn connect_sequence(
    shared: &Arc<Shared>,
    config: &GatewayConfig,
    store: &SharedStore,
) -> Result<ConnectOutcome, ClientError> {
    let _guard = shared.gate.lock().await;

    // A ready status alone is not proof of life: between a read loop's
    // unbind and the reconnect loop publishing its first status, the old
    // Ready value is still visible. The correlator binding is what actually
    // carries traffic, so require both before reusing the session.
    if shared.correlator.is_bound()
        && let ConnectionStatus::Ready {
            session_id,
            used_url,
            protocol,
        } = &*shared.status.borrow()
    {
        return Ok(ConnectOutcome {
            session_id: *session_id,
            used_url: used_url.clone(),
            scheme_upgraded: false,
            protocol: *protocol,
        });
    }

    let token = resolve_token(config, store).await?;
    let result = attempt_session(shared, config, store, &token).await;

    match &result {
        Ok(_) => config.reconnect.on_connected(),
        Err(e) => {
            config.reconnect.on_disconnected(e);
            shared.set_status(ConnectionStatus::Failed {
                reason: e.to_string(),
                can_retry: e.is_retryable() && !e.requires_reauth(),
            });
            // The caller gets the error; recovery continues in the
            // background for environmental failures.
            if e.is_retryable() && !e.requires_reauth() {
                maybe_spawn_reconnect(
                    shared.clone(),
                    config.clone(),
                    store.clone(),
                    TransportError::ConnectionLost {
                        reason: e.to_string(),
                    }
                    .into(),
                );
            }
        }
    }
    result
}

/// Resolve the bearer token: explicit configuration wins, then the store.
async fn resolve_token(
    config: &GatewayConfig,
    store: &SharedStore,
) -> Result<String, ClientError> {
    if let Some(token) = &config.token {
        return Ok(token.clone());
    }
    if let Some(store) = store
        && let Some(token) = store.get_token().await?
    {
        return Ok(token);
    }
    Err(ClientError::MissingToken)
}

/// One full attempt: resolve, establish, handshake, go ready.
///
/// Transport failures move on to the next candidate; a handshake rejection
/// aborts the whole attempt, because the gateway that rejected the
/// credentials is authoritative and the other candidates would answer the
/// same.
async fn attempt_session(
    shared: &Arc<Shared>,
    config: &GatewayConfig,
    store: &SharedStore,
    token: &str,
) -> Result<ConnectOutcome, ClientError> {
    let session_id = shared.sessions.begin();
    shared.set_status(ConnectionStatus::Connecting);
    shared
        .health
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .reset();

    let inputs = ResolveInputs {
        configured: config.url.clone(),
        env_hint: if config.use_env_hints {
            transport::env_hint()
        } else {
            None
        },
        last_good: shared
            .last_good
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone(),
    };
    let candidates = transport::resolve(&inputs);
    if candidates.is_empty() {
        return Err(TransportError::ResolutionFailed {
            reason: "no configured URL, environment hint, or well-known address".to_string(),
        }
        .into());
    }

    let mut last_error: Option<ClientError> = None;
    for candidate in &candidates {
        let established = match transport::establish(candidate, config.establish_timeouts).await {
            Ok(established) => established,
            Err(e) => {
                tracing::debug!(url = %candidate.url, error = %e, "candidate failed");
                last_error = Some(e.into());
                continue;
            }
        };

        let used_url = established.used_url.clone();
        let scheme_upgraded = established.scheme_upgraded;
        match handshake::perform(established.stream, config, token, session_id).await {
            Ok(success) => {
                shared.correlator.bind(success.writer.clone());
                *shared.last_good.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(used_url.clone());

                spawn_read_loop(
                    shared.clone(),
                    config.clone(),
                    store.clone(),
                    session_id,
                    success.reader,
                    success.writer.clone(),
                );
                spawn_keepalive(shared.clone(), config.ping_interval, session_id, success.writer);

                shared.set_status(ConnectionStatus::Ready {
                    session_id,
                    used_url: used_url.clone(),
                    protocol: success.info.protocol,
                });
                tracing::info!(session_id, url = %used_url, scheme_upgraded, "gateway connection ready");
                return Ok(ConnectOutcome {
                    session_id,
                    used_url,
                    scheme_upgraded,
                    protocol: success.info.protocol,
                });
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        TransportError::ResolutionFailed {
            reason: "all candidates were invalid".to_string(),
        }
        .into()
    }))
}

/// Spawn the reconnection loop unless one is already running or
/// reconnection is suppressed.
pub(crate) fn maybe_spawn_reconnect(
    shared: Arc<Shared>,
    config: GatewayConfig,
    store: SharedStore,
    trigger: ClientError,
) {
    if shared.reconnect_suppressed() {
        tracing::debug!("reconnection suppressed, staying down");
        shared.set_status(ConnectionStatus::Suspended);
        return;
    }
    if !trigger.is_retryable() || trigger.requires_reauth() {
        shared.set_status(ConnectionStatus::Failed {
            reason: trigger.to_string(),
            can_retry: !trigger.requires_reauth(),
        });
        return;
    }
    if shared
        .reconnect_active
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    tokio::spawn(async move {
        reconnect_loop(&shared, &config, &store, trigger).await;
        shared.reconnect_active.store(false, Ordering::SeqCst);
    });
}

async fn reconnect_loop(
    shared: &Arc<Shared>,
    config: &GatewayConfig,
    store: &SharedStore,
    mut last_error: ClientError,
) {
    let strategy = &config.reconnect;
    let mut attempt: u32 = 0;

    loop {
        if shared.reconnect_suppressed() {
            shared.set_status(ConnectionStatus::Suspended);
            return;
        }
        if !strategy.should_reconnect(attempt, &last_error).await {
            tracing::warn!(
                attempt,
                strategy = strategy.name(),
                error = %last_error,
                "giving up on reconnection"
            );
            shared.set_status(ConnectionStatus::Failed {
                reason: last_error.to_string(),
                can_retry: last_error.is_retryable() && !last_error.requires_reauth(),
            });
            return;
        }

        let delay = strategy.next_delay(attempt).await;
        shared.set_status(ConnectionStatus::Reconnecting {
            attempt,
            next_retry_ms: delay.as_millis() as u64,
            reason: last_error.to_string(),
        });
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting after delay");
        tokio::time::sleep(delay).await;

        if shared.reconnect_suppressed() {
            shared.set_status(ConnectionStatus::Suspended);
            return;
        }

        let result = {
            let _guard = shared.gate.lock().await;
            if shared.status.borrow().is_ready() {
                // Someone else connected while we slept.
                return;
            }
            match resolve_token(config, store).await {
                Ok(token) => attempt_session(shared, config, store, &token).await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(outcome) => {
                strategy.on_connected();
                tracing::info!(session_id = outcome.session_id, "reconnected");
                return;
            }
            Err(e) => {
                strategy.on_disconnected(&e);
                if e.requires_reauth() || !e.is_retryable() {
                    shared.set_status(ConnectionStatus::Failed {
                        reason: e.to_string(),
                        can_retry: !e.requires_reauth(),
                    });
                    return;
                }
                last_error = e;
                attempt += 1;
            }
        }
    }
}

/// Spawn the session's read loop.
///
/// The loop drives the correlator for exactly one session. It checks its
/// session id against the live counter before every action and exits
/// silently once stale; only the loop that still owns the live session runs
/// teardown.
fn spawn_read_loop(
    shared: Arc<Shared>,
    config: GatewayConfig,
    store: SharedStore,
    session_id: u64,
    mut reader: TransportReader,
    writer: mpsc::UnboundedSender<Outgoing>,
) {
    tokio::spawn(async move {
        let mut loss_reason = "stream ended".to_string();

        while let Some(result) = reader.next().await {
            if !shared.sessions.is_current(session_id) {
                tracing::debug!(session_id, "read loop is stale, exiting");
                return;
            }
            match result {
                Ok(Message::Text(text)) => match Frame::parse(&text) {
                    Ok(Frame::Response {
                        id,
                        ok,
                        payload,
                        error,
                        seq,
                        done,
                    }) => {
                        shared
                            .correlator
                            .handle_response(&id, ok, payload, error, seq, done);
                    }
                    Ok(Frame::Event(event)) => shared.correlator.handle_event(event),
                    Ok(Frame::Request { method, .. }) => {
                        tracing::debug!(session_id, method, "ignoring server-initiated request");
                    }
                    Err(e) => {
                        tracing::warn!(session_id, error = %e, "dropping unparseable frame");
                    }
                },
                Ok(Message::Ping(data)) => {
                    let _ = writer.send(Outgoing::Pong(data));
                }
                Ok(Message::Pong(_)) => {
                    shared
                        .health
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .pong_received();
                }
                Ok(Message::Close(frame)) => {
                    loss_reason = frame
                        .map(|f| format!("closed by gateway: {}", f.reason))
                        .unwrap_or_else(|| "closed by gateway".to_string());
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    loss_reason = e.to_string();
                    break;
                }
            }
        }

        if !shared.sessions.is_current(session_id) {
            return;
        }
        tracing::warn!(session_id, reason = %loss_reason, "gateway session lost");
        shared.sessions.invalidate();
        shared.correlator.unbind();
        maybe_spawn_reconnect(
            shared.clone(),
            config,
            store,
            TransportError::ConnectionLost {
                reason: loss_reason,
            }
            .into(),
        );
    });
}

/// Spawn the keepalive pinger for one session.
fn spawn_keepalive(
    shared: Arc<Shared>,
    interval: std::time::Duration,
    session_id: u64,
    writer: mpsc::UnboundedSender<Outgoing>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; skip it so pings start one interval in.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !shared.sessions.is_current(session_id) {
                return;
            }
            shared
                .health
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .ping_sent();
            if writer.send(Outgoing::Ping(Vec::new())).is_err() {
                return;
            }
        }
    });
}
