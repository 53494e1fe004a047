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

//! Top-level client error type.
//!
//! Layered composition: transport failures, handshake failures, and protocol
//! failures each have their own type and fold into [`ClientError`]. The
//! classification predicates ([`ClientError::is_retryable`],
//! [`ClientError::requires_reauth`]) drive the supervisor's retry decisions,
//! so every new variant must answer both questions deliberately.

use std::time::Duration;
use thiserror::Error;

use crate::frame::{ErrorDetail, ProtocolError};
use crate::handshake::HandshakeError;
use crate::secrets::SecretError;
use crate::transport::TransportError;

/// Gateway error codes that mean the credential itself was rejected.
pub(crate) const AUTH_CODES: [&str; 5] = [
    "UNAUTHORIZED",
    "FORBIDDEN",
    "TOKEN_EXPIRED",
    "INVALID_TOKEN",
    "auth-failed",
];

/// Gateway error codes that describe transient server-side conditions.
const RETRYABLE_CODES: [&str; 6] = [
    "RATE_LIMITED",
    "SERVICE_UNAVAILABLE",
    "OVERLOADED",
    "TIMEOUT",
    "TEMPORARY_ERROR",
    "RETRY",
];

/// All errors surfaced by the gateway client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Resolution, dialing, TLS, or an established socket failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The connect handshake was rejected, timed out, or collapsed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// A wire frame could not be parsed or encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The gateway answered a request with an error response.
    #[error("gateway error {code}: {message}")]
    Gateway {
        /// Stable gateway error code.
        code: String,
        /// Human-readable description from the gateway.
        message: String,
        /// Optional structured context.
        details: Option<serde_json::Value>,
        /// Server retryability hint, when present.
        retryable: Option<bool>,
    },

    /// A request was issued while no session was in the ready state.
    #[error("not connected to the gateway")]
    NotReady,

    /// The session ended while requests were still in flight.
    #[error("connection closed with requests in flight")]
    ConnectionClosed,

    /// A request outlived its deadline without a terminal response.
    #[error("request timed out after {after:?}")]
    RequestTimeout {
        /// The deadline that elapsed.
        after: Duration,
        /// Correlation id of the abandoned request, when known.
        request_id: Option<String>,
    },

    /// No auth token was configured or stored.
    #[error("no gateway auth token available")]
    MissingToken,

    /// The platform secret store failed.
    #[error(transparent)]
    Secrets(#[from] SecretError),
}

impl ClientError {
    /// Build a [`ClientError::Gateway`] from a wire error body.
    pub fn from_error_detail(detail: ErrorDetail) -> Self {
        ClientError::Gateway {
            code: detail.code,
            message: detail.message,
            details: detail.details,
            retryable: detail.retryable,
        }
    }

    /// Whether the supervisor may retry after this error.
    ///
    /// Handshake rejections are deterministic and never retried; handshake
    /// timeouts and transport losses are environmental and are.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(e) => e.is_recoverable(),
            ClientError::Handshake(e) => e.is_retryable(),
            ClientError::Protocol(_) => false,
            ClientError::Gateway { code, retryable, .. } => retryable
                .unwrap_or_else(|| RETRYABLE_CODES.iter().any(|c| c.eq_ignore_ascii_case(code))),
            ClientError::NotReady => false,
            ClientError::ConnectionClosed => true,
            ClientError::RequestTimeout { .. } => true,
            ClientError::MissingToken => false,
            ClientError::Secrets(_) => false,
        }
    }

    /// Whether this error means the stored credential must be replaced
    /// before any further attempt can succeed.
    pub fn requires_reauth(&self) -> bool {
        match self {
            ClientError::Gateway { code, .. } => {
                AUTH_CODES.iter().any(|c| c.eq_ignore_ascii_case(code))
            }
            ClientError::Handshake(e) => e.requires_reauth(),
            ClientError::MissingToken => true,
            _ => false,
        }
    }

    /// A short message suitable for direct display in the client UI.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Transport(TransportError::ResolutionFailed { .. }) => {
                "Could not find a gateway to connect to.".to_string()
            }
            ClientError::Transport(_) => "Connection to the gateway failed.".to_string(),
            ClientError::Handshake(e) if e.requires_reauth() => {
                "Your session has expired. Please sign in again.".to_string()
            }
            ClientError::Handshake(_) => "The gateway refused the connection.".to_string(),
            ClientError::Gateway { code, message, .. } if self.requires_reauth() => {
                if message.is_empty() {
                    format!("Authentication failed ({code}). Please sign in again.")
                } else {
                    message.clone()
                }
            }
            ClientError::Gateway { message, .. } if !message.is_empty() => message.clone(),
            ClientError::Gateway { code, .. } => format!("The gateway reported an error ({code})."),
            ClientError::NotReady => "Not connected to the gateway yet.".to_string(),
            ClientError::ConnectionClosed => "The connection was interrupted.".to_string(),
            ClientError::RequestTimeout { .. } => "The gateway took too long to respond.".to_string(),
            ClientError::MissingToken => "No credentials found. Please sign in.".to_string(),
            ClientError::Protocol(_) => "Received an unintelligible reply from the gateway.".to_string(),
            ClientError::Secrets(_) => "Could not access the system credential store.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(code: &str, retryable: Option<bool>) -> ClientError {
        ClientError::Gateway {
            code: code.to_string(),
            message: String::new(),
            details: None,
            retryable,
        }
    }

    #[test]
    fn auth_codes_require_reauth_and_never_retry() {
        for code in ["UNAUTHORIZED", "FORBIDDEN", "TOKEN_EXPIRED", "INVALID_TOKEN"] {
            let err = gateway(code, None);
            assert!(err.requires_reauth(), "{code} should require reauth");
            assert!(!err.is_retryable(), "{code} should not be retryable");
        }
    }

    #[test]
    fn transient_codes_are_retryable() {
        for code in ["RATE_LIMITED", "SERVICE_UNAVAILABLE", "OVERLOADED", "retry"] {
            let err = gateway(code, None);
            assert!(err.is_retryable(), "{code} should be retryable");
            assert!(!err.requires_reauth());
        }
    }

    #[test]
    fn server_hint_overrides_code_classification() {
        assert!(gateway("WEIRD_CODE", Some(true)).is_retryable());
        assert!(!gateway("RATE_LIMITED", Some(false)).is_retryable());
    }

    #[test]
    fn closed_connection_is_retryable() {
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(!ClientError::ConnectionClosed.requires_reauth());
    }

    #[test]
    fn not_ready_is_terminal_for_the_request() {
        assert!(!ClientError::NotReady.is_retryable());
    }

    #[test]
    fn user_messages_are_nonempty() {
        let samples = [
            ClientError::NotReady,
            ClientError::ConnectionClosed,
            ClientError::MissingToken,
            gateway("UNAUTHORIZED", None),
            gateway("OVERLOADED", None),
        ];
        for err in samples {
            assert!(!err.user_message().is_empty());
        }
    }
}
