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

//! Gateway protocol client for the Moltz desktop chat client.
//!
//! This crate manages the WebSocket connection between the desktop app and
//! its gateway: finding an address to connect to, establishing the
//! transport (with an IPv4-only manual fallback for environments where the
//! standard resolver hangs), running the connect handshake, correlating
//! request/response traffic, and supervising reconnection with exponential
//! backoff.
//!
//! # Connection lifecycle
//!
//! A [`GatewayClient`] starts disconnected. [`GatewayClient::connect`]
//! resolves candidate addresses, establishes a transport, and performs the
//! handshake; only after the gateway's acceptance does the session become
//! ready and accept requests. Requests issued at any other time fail
//! immediately with [`ClientError::NotReady`]; the client never queues
//! traffic for a future session.
//!
//! Losing an established session fails all in-flight requests and hands
//! control to the reconnection supervisor, which retries with exponential
//! backoff (1s doubling to a 60s ceiling, with jitter) until it succeeds,
//! the strategy gives up, or reconnection is suppressed by an explicit
//! [`GatewayClient::disconnect`]. Rejected credentials are never retried.
//!
//! # Example
//!
//! ```no_run
//! use moltgate::{GatewayClient, GatewayConfig};
//!
//! # async fn run() -> Result<(), moltgate::ClientError> {
//! let client = GatewayClient::new(GatewayConfig {
//!     url: Some("ws://127.0.0.1:18789".to_string()),
//!     token: Some("secret".to_string()),
//!     ..Default::default()
//! });
//!
//! client.connect().await?;
//!
//! let mut events = client.events("chat");
//! let reply = client
//!     .request("chat.send", Some(serde_json::json!({"message": "hello"})))
//!     .await?;
//! # let _ = (events.recv().await, reply);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod backoff;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod health;
pub mod secrets;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use backoff::{ExponentialBackoff, NoReconnect, ReconnectionStrategy};
pub use client::GatewayClient;
pub use config::{ClientMode, GatewayConfig};
pub use correlator::{Completion, EventStream, StreamChunk, Streaming};
pub use error::ClientError;
pub use frame::{ErrorDetail, EventFrame, Frame, PROTOCOL_VERSION, ProtocolError};
pub use handshake::{HandshakeError, SessionInfo};
pub use health::ConnectionQuality;
pub use secrets::{KeyringStore, MemoryStore, SecretError, TokenStore};
pub use session::ConnectionStatus;
pub use supervisor::ConnectOutcome;
pub use transport::{Candidate, CandidateSource, TransportError, TransportMode};
