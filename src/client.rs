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

//! The public gateway client.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::GatewayConfig;
use crate::correlator::{EventStream, Streaming};
use crate::error::ClientError;
use crate::health::ConnectionQuality;
use crate::secrets::TokenStore;
use crate::session::{ConnectionStatus, Shared};
use crate::supervisor::{self, ConnectOutcome, SharedStore};

/// Handle to the gateway connection.
///
/// Cheap to clone; all clones share one connection, one correlator, and one
/// supervisor. Requests are only accepted while the connection is in the
/// ready state; anything issued earlier or during a reconnect fails
/// immediately with [`ClientError::NotReady`] rather than being queued.
///
/// # Examples
///
/// ```no_run
/// use moltgate::{GatewayClient, GatewayConfig};
///
/// # async fn run() -> Result<(), moltgate::ClientError> {
/// let config = GatewayConfig {
///     url: Some("ws://127.0.0.1:18789".to_string()),
///     token: Some("secret".to_string()),
///     ..Default::default()
/// };
/// let client = GatewayClient::new(config);
/// client.connect().await?;
/// let status = client.request("status.get", None).await?;
/// println!("{status:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GatewayClient {
    shared: Arc<Shared>,
    config: GatewayConfig,
    store: SharedStore,
}

impl GatewayClient {
    /// Create a client. No connection is made until [`Self::connect`].
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            config,
            store: None,
        }
    }

    /// Create a client that reads its bearer token from `store` when the
    /// configuration does not carry one.
    pub fn with_token_store(config: GatewayConfig, store: Arc<dyn TokenStore>) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            config,
            store: Some(store),
        }
    }

    /// Connect to the gateway and complete the handshake.
    ///
    /// Safe to call concurrently and repeatedly: sequences are serialized,
    /// and a call that finds the connection already ready returns the live
    /// session's outcome without touching the wire. An explicit connect
    /// also lifts any reconnection suppression left by
    /// [`Self::disconnect`] or [`Self::set_offline`].
    ///
    /// # Errors
    ///
    /// Returns the underlying transport or handshake error when no
    /// candidate produced a ready session.
    pub async fn connect(&self) -> Result<ConnectOutcome, ClientError> {
        self.shared.set_reconnect_suppressed(false);
        supervisor::connect_sequence(&self.shared, &self.config, &self.store).await
    }

    /// Disconnect and suppress automatic reconnection until the next
    /// explicit [`Self::connect`].
    ///
    /// In-flight requests fail with [`ClientError::ConnectionClosed`];
    /// event streams end.
    pub async fn disconnect(&self) {
        self.shared.set_reconnect_suppressed(true);
        // Invalidate first so the session's tasks go stale before the
        // correlator is torn down under them.
        self.shared.sessions.invalidate();
        self.shared.correlator.unbind();
        self.shared.set_status(ConnectionStatus::Disconnected);
        tracing::info!("disconnected from gateway");
    }

    /// Toggle offline mode.
    ///
    /// `true` behaves like [`Self::disconnect`] but reports the connection
    /// as [`ConnectionStatus::Suspended`]; `false` lifts suppression and
    /// reconnects.
    ///
    /// # Errors
    ///
    /// Returns the connect error when leaving offline mode fails.
    pub async fn set_offline(&self, offline: bool) -> Result<(), ClientError> {
        if offline {
            self.shared.set_reconnect_suppressed(true);
            self.shared.sessions.invalidate();
            self.shared.correlator.unbind();
            self.shared.set_status(ConnectionStatus::Suspended);
            Ok(())
        } else {
            self.connect().await.map(|_| ())
        }
    }

    /// Issue a unary request and wait for its terminal response.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotReady`] when no session is ready,
    /// [`ClientError::RequestTimeout`] when the configured request deadline
    /// passes, or the gateway's error for failed requests.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, ClientError> {
        self.request_with_timeout(method, params, self.config.request_timeout)
            .await
    }

    /// [`Self::request`] with an explicit deadline.
    ///
    /// # Errors
    ///
    /// As [`Self::request`].
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        deadline: Duration,
    ) -> Result<Option<serde_json::Value>, ClientError> {
        let (id, completion) = self.shared.correlator.send_request(method, params)?;
        match tokio::time::timeout(deadline, completion.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.shared.correlator.cancel(&id);
                Err(ClientError::RequestTimeout {
                    after: deadline,
                    request_id: Some(id),
                })
            }
        }
    }

    /// Issue a request whose response may stream in chunks.
    ///
    /// Chunks arrive in wire order on [`Streaming::chunks`]; the terminal
    /// result resolves [`Streaming::completion`] exactly once. No deadline
    /// is applied, since streamed responses are open-ended.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotReady`] when no session is ready.
    pub fn request_streaming(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<Streaming, ClientError> {
        let (_, streaming) = self
            .shared
            .correlator
            .send_request_streaming(method, params)?;
        Ok(streaming)
    }

    /// Subscribe to server-pushed events by name; `"*"` receives all.
    ///
    /// The stream ends when the session is torn down; subscribe again after
    /// reconnecting.
    pub fn events(&self, event: &str) -> EventStream {
        self.shared.correlator.subscribe(event)
    }

    /// Watch the connection lifecycle.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Current status snapshot.
    pub fn current_status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    /// Connection quality derived from recent keepalive round trips.
    pub fn quality(&self) -> ConnectionQuality {
        self.shared
            .health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .quality()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_before_connect_is_rejected() {
        let client = GatewayClient::new(GatewayConfig::default());
        let err = client.request("status.get", None).await.unwrap_err();
        assert!(matches!(err, ClientError::NotReady));
    }

    #[tokio::test]
    async fn streaming_request_before_connect_is_rejected() {
        let client = GatewayClient::new(GatewayConfig::default());
        let err = client.request_streaming("chat.send", None).unwrap_err();
        assert!(matches!(err, ClientError::NotReady));
    }

    #[tokio::test]
    async fn new_client_reports_disconnected() {
        let client = GatewayClient::new(GatewayConfig::default());
        assert_eq!(client.current_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn offline_toggle_suspends() {
        let client = GatewayClient::new(GatewayConfig::default());
        client.set_offline(true).await.unwrap();
        assert_eq!(client.current_status(), ConnectionStatus::Suspended);
    }
}
