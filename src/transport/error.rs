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

//! Transport-level error types.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while resolving, establishing, or using a gateway transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No connection candidate could be produced from the available hints.
    #[error("no gateway address could be resolved: {reason}")]
    ResolutionFailed {
        /// Why resolution produced nothing.
        reason: String,
    },

    /// The candidate URL could not be parsed.
    #[error("invalid gateway URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Parse diagnostic.
        reason: String,
    },

    /// TCP or WebSocket establishment did not complete within the deadline.
    #[error("connection to {url} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Target URL.
        url: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The peer refused or dropped the connection attempt.
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailed {
        /// Target URL.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// TLS negotiation failed.
    #[error("TLS handshake with {host} failed: {reason}")]
    TlsFailed {
        /// Hostname presented for certificate verification.
        host: String,
        /// Underlying failure.
        reason: String,
    },

    /// An established connection was lost.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Underlying failure.
        reason: String,
    },

    /// Low-level I/O failure outside the cases above.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether reconnection is worth attempting after this error.
    ///
    /// URL-shape failures are deterministic and will fail the same way on
    /// every attempt. Everything else is environmental, including address
    /// resolution: DNS and discovery can start answering when a VPN comes
    /// up or the local gateway starts.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::InvalidUrl { .. } => false,
            TransportError::ResolutionFailed { .. }
            | TransportError::ConnectTimeout { .. }
            | TransportError::ConnectFailed { .. }
            | TransportError::TlsFailed { .. }
            | TransportError::ConnectionLost { .. }
            | TransportError::Io(_) => true,
        }
    }
}
