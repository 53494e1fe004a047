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

//! Connect handshake.
//!
//! [`perform`] owns the socket's read half until the gateway accepts or
//! rejects the session. Exactly one `connect` request is written per
//! transport connection, then frames are read inline until the matching
//! response arrives or the deadline passes. Because the read half is only
//! released to the session's read loop after acceptance, no application
//! request can observe the socket before the session is ready; the ordering
//! is structural, not a convention callers must remember.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::config::GatewayConfig;
use crate::error::{AUTH_CODES, ClientError};
use crate::frame::{
    AuthInfo, ConnectParams, Frame, HelloPayload, PROTOCOL_VERSION, ProtocolError,
};
use crate::session::Outgoing;
use crate::transport::RawTransport;

/// Read half of the socket, released to the read loop after acceptance.
pub(crate) type TransportReader = futures_util::stream::SplitStream<RawTransport>;

/// Errors ending a handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The gateway explicitly refused the session.
    #[error("gateway rejected the session ({cause}): {message}")]
    Rejected {
        /// Gateway rejection cause code.
        cause: String,
        /// Human-readable rejection reason.
        message: String,
    },

    /// No acceptance or rejection arrived within the deadline.
    #[error("handshake timed out after {after:?}")]
    TimedOut {
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The connection ended before the gateway answered.
    #[error("connection closed during handshake: {reason}")]
    ClosedBeforeAccept {
        /// What ended the connection.
        reason: String,
    },
}

impl HandshakeError {
    /// Whether retrying the handshake could help.
    ///
    /// An explicit rejection is deterministic; timeouts and dropped
    /// connections are environmental.
    pub fn is_retryable(&self) -> bool {
        match self {
            HandshakeError::Rejected { .. } => false,
            HandshakeError::TimedOut { .. } | HandshakeError::ClosedBeforeAccept { .. } => true,
        }
    }

    /// Whether the rejection was about the credential.
    pub fn requires_reauth(&self) -> bool {
        match self {
            HandshakeError::Rejected { cause, .. } => {
                AUTH_CODES.iter().any(|c| c.eq_ignore_ascii_case(cause))
            }
            _ => false,
        }
    }
}

/// What the gateway told us about the accepted session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Negotiated protocol version.
    pub protocol: i64,
    /// Full acceptance payload.
    pub hello: HelloPayload,
}

/// A handshake that reached acceptance.
pub(crate) struct HandshakeSuccess {
    /// Read half, positioned just past the acceptance frame.
    pub reader: TransportReader,
    /// Handle to the session's writer task.
    pub writer: mpsc::UnboundedSender<Outgoing>,
    /// Acceptance metadata.
    pub info: SessionInfo,
}

/// Run the connect handshake on a freshly established transport.
///
/// Spawns the session's writer task, sends the single `connect` request,
/// and reads inline until the gateway decides. On success the caller
/// receives the read half and the writer handle; on failure both halves are
/// dropped and the socket closes.
pub(crate) async fn perform(
    transport: RawTransport,
    config: &GatewayConfig,
    token: &str,
    session_id: u64,
) -> Result<HandshakeSuccess, ClientError> {
    let (mut write, mut read) = transport.split();

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Outgoing>();
    tokio::spawn(async move {
        while let Some(outgoing) = writer_rx.recv().await {
            let message = match outgoing {
                Outgoing::Frame(text) => Message::Text(text),
                Outgoing::Ping(data) => Message::Ping(data),
                Outgoing::Pong(data) => Message::Pong(data),
                // Explicit teardown: stop accepting writes and close below.
                Outgoing::Close => break,
            };
            if let Err(e) = write.send(message).await {
                tracing::debug!(session_id, error = %e, "writer task stopping");
                break;
            }
        }
        // Channel closed on teardown; closing the write half closes the
        // socket for the peer.
        let _ = write.close().await;
    });

    let connect = Frame::request(
        "connect",
        Some(serde_json::to_value(connect_params(config, token)).map_err(|e| {
            ProtocolError::InvalidJson {
                message: format!("failed to serialize connect params: {e}"),
            }
        })?),
    );
    let Frame::Request {
        id: connect_id, ..
    } = &connect
    else {
        unreachable!("Frame::request builds a request");
    };
    let connect_id = connect_id.clone();
    writer_tx
        .send(Outgoing::Frame(connect.encode()?))
        .map_err(|_| ClientError::ConnectionClosed)?;
    tracing::debug!(session_id, request_id = %connect_id, "connect request sent");

    let deadline = config.handshake_timeout;
    let decision = tokio::time::timeout(
        deadline,
        await_acceptance(&mut read, &writer_tx, &connect_id, session_id),
    )
    .await
    .map_err(|_| HandshakeError::TimedOut { after: deadline })??;

    Ok(HandshakeSuccess {
        reader: read,
        writer: writer_tx,
        info: decision,
    })
}

/// Read frames until the connect response arrives.
///
/// Frames other than the connect response are ignored here: events like a
/// connect challenge or early ticks carry nothing this layer acts on, and
/// application traffic cannot exist yet because nothing else holds the
/// writer.
async fn await_acceptance(
    read: &mut TransportReader,
    writer: &mpsc::UnboundedSender<Outgoing>,
    connect_id: &str,
    session_id: u64,
) -> Result<SessionInfo, ClientError> {
    loop {
        let message = match read.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                return Err(HandshakeError::ClosedBeforeAccept {
                    reason: e.to_string(),
                }
                .into());
            }
            None => {
                return Err(HandshakeError::ClosedBeforeAccept {
                    reason: "stream ended".to_string(),
                }
                .into());
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Ping(data) => {
                let _ = writer.send(Outgoing::Pong(data));
                continue;
            }
            Message::Close(frame) => {
                return Err(HandshakeError::ClosedBeforeAccept {
                    reason: frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "close frame".to_string()),
                }
                .into());
            }
            _ => continue,
        };

        let frame = match Frame::parse(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "unparseable frame during handshake");
                continue;
            }
        };

        let Frame::Response {
            id,
            ok,
            payload,
            error,
            ..
        } = frame
        else {
            tracing::trace!(session_id, "ignoring non-response frame during handshake");
            continue;
        };
        if id != connect_id {
            tracing::warn!(session_id, response_id = %id, "response to unknown request during handshake");
            continue;
        }

        if !ok {
            let (cause, message) = match error {
                Some(detail) => (detail.code, detail.message),
                None => ("unknown".to_string(), "connect refused".to_string()),
            };
            return Err(HandshakeError::Rejected { cause, message }.into());
        }

        let hello: HelloPayload = match payload {
            Some(value) => serde_json::from_value(value).unwrap_or(HelloPayload {
                kind: String::new(),
                protocol: None,
                session_id: None,
            }),
            None => HelloPayload {
                kind: String::new(),
                protocol: None,
                session_id: None,
            },
        };
        if !hello.is_accepted() {
            return Err(HandshakeError::Rejected {
                cause: "invalid-handshake".to_string(),
                message: format!("unexpected acceptance payload '{}'", hello.kind),
            }
            .into());
        }

        let protocol = hello.protocol.unwrap_or(PROTOCOL_VERSION);
        tracing::info!(session_id, protocol, "gateway accepted the session");
        return Ok(SessionInfo { protocol, hello });
    }
}

fn connect_params(config: &GatewayConfig, token: &str) -> ConnectParams {
    ConnectParams {
        min_protocol: PROTOCOL_VERSION,
        max_protocol: PROTOCOL_VERSION,
        client: config.client_info(),
        role: "operator".to_string(),
        scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
        caps: vec![],
        auth: AuthInfo {
            token: token.to_string(),
        },
        locale: config.locale.clone(),
        user_agent: config.user_agent(),
    }
}
