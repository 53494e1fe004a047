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

//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{ExponentialBackoff, ReconnectionStrategy};
use crate::frame::ClientInfo;
use crate::transport::EstablishTimeouts;

/// Operating mode reported to the gateway in the handshake.
///
/// The gateway validates this against a fixed set; anything else is rejected
/// with an `invalid-handshake` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientMode {
    /// Browser-embedded chat surface.
    Webchat,
    /// Command-line client.
    Cli,
    /// Desktop UI client.
    #[default]
    Ui,
    /// Headless service integration.
    Backend,
    /// Health-check probe.
    Probe,
    /// Test harness.
    Test,
}

impl ClientMode {
    /// The wire spelling of this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientMode::Webchat => "webchat",
            ClientMode::Cli => "cli",
            ClientMode::Ui => "ui",
            ClientMode::Backend => "backend",
            ClientMode::Probe => "probe",
            ClientMode::Test => "test",
        }
    }
}

/// Configuration for a [`GatewayClient`](crate::client::GatewayClient).
///
/// The defaults match the desktop client: well-known local gateway
/// discovery, environment overrides honored, exponential backoff from one
/// second to sixty.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Explicit gateway URL; when absent, environment hints and well-known
    /// local ports are tried.
    pub url: Option<String>,
    /// Bearer token; when absent, the configured token store is consulted.
    pub token: Option<String>,
    /// Honor `MOLTZ_GATEWAY_URL` / `GATEWAY_URL` overrides.
    pub use_env_hints: bool,
    /// Stable client identifier sent in the handshake.
    pub client_id: String,
    /// Operating mode sent in the handshake.
    pub mode: ClientMode,
    /// BCP 47 locale tag sent in the handshake.
    pub locale: String,
    /// Establishment deadlines (per attempt and overall).
    pub establish_timeouts: EstablishTimeouts,
    /// Deadline for the connect handshake to be accepted.
    pub handshake_timeout: Duration,
    /// Default deadline for a unary request.
    pub request_timeout: Duration,
    /// Interval between keepalive pings on an idle connection.
    pub ping_interval: Duration,
    /// Retry policy after failures and lost sessions.
    pub reconnect: Arc<dyn ReconnectionStrategy>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            use_env_hints: true,
            client_id: "moltz-desktop".to_string(),
            mode: ClientMode::default(),
            locale: "en-US".to_string(),
            establish_timeouts: EstablishTimeouts::default(),
            handshake_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            reconnect: Arc::new(ExponentialBackoff::default()),
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("use_env_hints", &self.use_env_hints)
            .field("client_id", &self.client_id)
            .field("mode", &self.mode)
            .field("locale", &self.locale)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("reconnect", &self.reconnect.name())
            .finish()
    }
}

impl GatewayConfig {
    /// Configuration pointing at an explicit URL.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// The client descriptor sent in the handshake.
    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            id: self.client_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: platform_name().to_string(),
            mode: self.mode.as_str().to_string(),
        }
    }

    /// The user-agent string sent in the handshake.
    pub fn user_agent(&self) -> String {
        format!(
            "{}/{} ({})",
            self.client_id,
            env!("CARGO_PKG_VERSION"),
            platform_name()
        )
    }
}

fn platform_name() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "unknown"
    }
}
