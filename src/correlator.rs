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

//! Request/response correlation.
//!
//! Outbound requests register a waiter keyed by their correlation id before
//! the frame is written, so a response can never arrive ahead of its waiter.
//! Streamed responses deliver partial chunks in arrival order on a channel
//! and resolve the completion exactly once on the terminal frame.
//!
//! The correlator is also the gate that keeps application traffic off the
//! wire outside a ready session: it only holds a sender while a session is
//! bound, and [`Correlator::send_request`] fails with
//! [`ClientError::NotReady`] when none is. Requests issued mid-handshake or
//! mid-reconnect are rejected immediately rather than queued, because by the
//! time a new session exists their context (model list, chat history,
//! session routing) may no longer be valid.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};

use crate::error::ClientError;
use crate::frame::{ErrorDetail, EventFrame, Frame};
use crate::session::Outgoing;

/// One partial payload of a streamed response.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// Server-assigned chunk sequence number, when present.
    pub seq: Option<i64>,
    /// Chunk payload.
    pub payload: serde_json::Value,
}

/// The terminal outcome of a request.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<Option<serde_json::Value>, ClientError>>,
}

impl Completion {
    /// Wait for the terminal response.
    ///
    /// # Errors
    ///
    /// Returns the gateway's error for failed requests, or
    /// [`ClientError::ConnectionClosed`] if the session ended first.
    pub async fn wait(self) -> Result<Option<serde_json::Value>, ClientError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // Sender dropped without resolving: the session was torn down.
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }
}

/// A streamed response: chunks in arrival order plus the terminal outcome.
#[derive(Debug)]
pub struct Streaming {
    /// Partial payloads, closed when the terminal frame arrives.
    pub chunks: mpsc::UnboundedReceiver<StreamChunk>,
    /// Resolves exactly once with the terminal result.
    pub completion: Completion,
}

/// A subscription to server-pushed events.
///
/// The stream ends when its session is torn down; subscribers re-subscribe
/// after reconnecting.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EventFrame>,
}

impl EventStream {
    /// Receive the next event, or `None` once the session ends.
    pub async fn recv(&mut self) -> Option<EventFrame> {
        self.rx.recv().await
    }
}

struct PendingEntry {
    method: String,
    done: oneshot::Sender<Result<Option<serde_json::Value>, ClientError>>,
    chunks: Option<mpsc::UnboundedSender<StreamChunk>>,
    last_seq: Option<i64>,
}

/// Correlates responses with in-flight requests for the bound session.
pub(crate) struct Correlator {
    ready: AtomicBool,
    sender: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    subscriptions: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<EventFrame>>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            sender: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Bind a ready session's writer. From here until [`Self::unbind`],
    /// requests are accepted.
    pub fn bind(&self, sender: mpsc::UnboundedSender<Outgoing>) {
        *self.sender.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Tear down the bound session: close the writer, reject future sends,
    /// fail every in-flight request, and end every event subscription.
    pub fn unbind(&self) {
        self.ready.store(false, Ordering::SeqCst);
        if let Some(sender) = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take() {
            // Wakes the writer so the socket actually closes even while the
            // read loop is still parked on it.
            let _ = sender.send(Outgoing::Close);
        }

        let drained: Vec<(String, PendingEntry)> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (id, entry) in drained {
            tracing::debug!(request_id = %id, method = %entry.method, "failing in-flight request: session closed");
            let _ = entry.done.send(Err(ClientError::ConnectionClosed));
        }

        // Dropping the senders closes every subscriber's stream.
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Whether a ready session is currently bound.
    pub fn is_bound(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Send a unary request on the bound session.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotReady`] when no ready session is bound.
    pub fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(String, Completion), ClientError> {
        self.dispatch(method, params, false)
            .map(|(id, completion, _)| (id, completion))
    }

    /// Send a request whose response may arrive as a chunk stream.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotReady`] when no ready session is bound.
    pub fn send_request_streaming(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(String, Streaming), ClientError> {
        let (id, completion, chunks) = self.dispatch(method, params, true)?;
        let chunks = chunks.unwrap_or_else(|| mpsc::unbounded_channel().1);
        Ok((id, Streaming { chunks, completion }))
    }

    fn dispatch(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        streaming: bool,
    ) -> Result<(String, Completion, Option<mpsc::UnboundedReceiver<StreamChunk>>), ClientError>
    {
        if !self.is_bound() {
            return Err(ClientError::NotReady);
        }

        let frame = Frame::request(method, params);
        let Frame::Request { id, .. } = &frame else {
            unreachable!("Frame::request builds a request");
        };
        let id = id.clone();
        let encoded = frame.encode()?;

        let (done_tx, done_rx) = oneshot::channel();
        let (chunk_tx, chunk_rx) = if streaming {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        // Register before writing so the response cannot outrun the waiter.
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id.clone(),
            PendingEntry {
                method: method.to_string(),
                done: done_tx,
                chunks: chunk_tx,
                last_seq: None,
            },
        );

        let sent = {
            let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            match sender.as_ref() {
                Some(tx) => tx.send(Outgoing::Frame(encoded)).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(ClientError::NotReady);
        }

        tracing::trace!(request_id = %id, method, streaming, "request dispatched");
        Ok((id, Completion { rx: done_rx }, chunk_rx))
    }

    /// Abandon an in-flight request, e.g. on caller timeout. The response,
    /// if it ever arrives, will be dropped as an orphan.
    pub fn cancel(&self, id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Route one response frame to its waiter.
    ///
    /// Partial frames (`done: false`) append a chunk and keep the waiter
    /// registered; anything else resolves the completion and retires the id.
    /// Responses with no registered waiter are logged and dropped.
    pub fn handle_response(
        &self,
        id: &str,
        ok: bool,
        payload: Option<serde_json::Value>,
        error: Option<ErrorDetail>,
        seq: Option<i64>,
        done: Option<bool>,
    ) {
        let is_partial = ok && done == Some(false);

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if is_partial {
            let Some(entry) = pending.get_mut(id) else {
                tracing::warn!(request_id = %id, "dropping chunk for unknown request");
                return;
            };
            if let (Some(prev), Some(cur)) = (entry.last_seq, seq)
                && cur <= prev
            {
                tracing::warn!(
                    request_id = %id,
                    method = %entry.method,
                    prev, cur,
                    "response chunk sequence went backwards"
                );
            }
            entry.last_seq = seq.or(entry.last_seq);
            if let (Some(chunks), Some(payload)) = (&entry.chunks, payload) {
                // Receiver may have been dropped by an uninterested caller.
                let _ = chunks.send(StreamChunk { seq, payload });
            }
            return;
        }

        let Some(entry) = pending.remove(id) else {
            tracing::warn!(request_id = %id, "dropping response for unknown request");
            return;
        };
        drop(pending);

        let outcome = if ok {
            Ok(payload)
        } else {
            Err(match error {
                Some(detail) => ClientError::from_error_detail(detail),
                None => ClientError::Gateway {
                    code: "UNKNOWN".to_string(),
                    message: "request failed without an error body".to_string(),
                    details: None,
                    retryable: None,
                },
            })
        };
        if entry.done.send(outcome).is_err() {
            tracing::debug!(request_id = %id, method = %entry.method, "response arrived after caller gave up");
        }
    }

    /// Subscribe to events by name. The name `"*"` receives every event.
    pub fn subscribe(&self, event: &str) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.to_string())
            .or_default()
            .push(tx);
        EventStream { rx }
    }

    /// Fan one event out to its subscribers, pruning closed ones.
    pub fn handle_event(&self, event: EventFrame) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        for key in [event.event.as_str(), "*"] {
            if let Some(senders) = subscriptions.get_mut(key) {
                senders.retain(|tx| tx.send(event.clone()).is_ok());
            }
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound() -> (Correlator, mpsc::UnboundedReceiver<Outgoing>) {
        let correlator = Correlator::new();
        let (tx, rx) = mpsc::unbounded_channel();
        correlator.bind(tx);
        (correlator, rx)
    }

    #[tokio::test]
    async fn unary_request_resolves_with_payload() {
        let (correlator, mut wire) = bound();
        let (id, completion) = correlator
            .send_request("status.get", None)
            .expect("bound correlator accepts requests");

        // The frame reached the writer before any response handling.
        assert!(matches!(wire.recv().await, Some(Outgoing::Frame(_))));

        correlator.handle_response(
            &id,
            true,
            Some(serde_json::json!({"uptime": 42})),
            None,
            None,
            None,
        );
        let payload = completion.wait().await.unwrap().unwrap();
        assert_eq!(payload["uptime"], 42);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn unbound_correlator_rejects_immediately() {
        let correlator = Correlator::new();
        let err = correlator.send_request("chat.send", None).unwrap_err();
        assert!(matches!(err, ClientError::NotReady));
    }

    #[tokio::test]
    async fn error_response_resolves_with_gateway_error() {
        let (correlator, _wire) = bound();
        let (id, completion) = correlator.send_request("chat.send", None).unwrap();

        correlator.handle_response(
            &id,
            false,
            None,
            Some(ErrorDetail {
                code: "RATE_LIMITED".to_string(),
                message: "slow down".to_string(),
                details: None,
                retryable: Some(true),
            }),
            None,
            None,
        );
        let err = completion.wait().await.unwrap_err();
        assert!(matches!(err, ClientError::Gateway { ref code, .. } if code == "RATE_LIMITED"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn streamed_chunks_arrive_in_order_then_terminal() {
        let (correlator, _wire) = bound();
        let (id, mut streaming) = correlator
            .send_request_streaming("chat.send", None)
            .unwrap();

        for seq in 1..=3 {
            correlator.handle_response(
                &id,
                true,
                Some(serde_json::json!({"text": format!("part {seq}")})),
                None,
                Some(seq),
                Some(false),
            );
        }
        correlator.handle_response(
            &id,
            true,
            Some(serde_json::json!({"text": "full"})),
            None,
            Some(4),
            Some(true),
        );

        for expected in 1..=3 {
            let chunk = streaming.chunks.recv().await.unwrap();
            assert_eq!(chunk.seq, Some(expected));
        }
        let terminal = streaming.completion.wait().await.unwrap().unwrap();
        assert_eq!(terminal["text"], "full");
        // Channel closed after the terminal frame.
        assert!(streaming.chunks.recv().await.is_none());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn orphan_response_is_dropped() {
        let (correlator, _wire) = bound();
        // Never registered.
        correlator.handle_response("ghost", true, None, None, None, None);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_terminal_is_ignored() {
        let (correlator, _wire) = bound();
        let (id, completion) = correlator.send_request("status.get", None).unwrap();

        correlator.handle_response(&id, true, Some(serde_json::json!(1)), None, None, None);
        // Second terminal for the same id is an orphan.
        correlator.handle_response(&id, true, Some(serde_json::json!(2)), None, None, None);

        let payload = completion.wait().await.unwrap().unwrap();
        assert_eq!(payload, serde_json::json!(1));
    }

    #[tokio::test]
    async fn unbind_fails_all_in_flight_requests() {
        let (correlator, _wire) = bound();
        let (_, unary) = correlator.send_request("status.get", None).unwrap();
        let (_, streaming) = correlator.send_request_streaming("chat.send", None).unwrap();

        correlator.unbind();

        assert!(matches!(
            unary.wait().await.unwrap_err(),
            ClientError::ConnectionClosed
        ));
        assert!(matches!(
            streaming.completion.wait().await.unwrap_err(),
            ClientError::ConnectionClosed
        ));
        assert!(matches!(
            correlator.send_request("status.get", None).unwrap_err(),
            ClientError::NotReady
        ));
    }

    #[tokio::test]
    async fn cancelled_request_drops_its_late_response() {
        let (correlator, _wire) = bound();
        let (id, completion) = correlator.send_request("status.get", None).unwrap();

        correlator.cancel(&id);
        correlator.handle_response(&id, true, Some(serde_json::json!({})), None, None, None);

        assert!(matches!(
            completion.wait().await.unwrap_err(),
            ClientError::ConnectionClosed
        ));
    }

    #[tokio::test]
    async fn events_fan_out_by_name_and_wildcard() {
        let (correlator, _wire) = bound();
        let mut chat = correlator.subscribe("chat");
        let mut all = correlator.subscribe("*");

        correlator.handle_event(EventFrame {
            event: "chat".to_string(),
            seq: Some(1),
            payload: None,
        });
        correlator.handle_event(EventFrame {
            event: "tick".to_string(),
            seq: None,
            payload: None,
        });

        assert_eq!(chat.recv().await.unwrap().event, "chat");
        assert_eq!(all.recv().await.unwrap().event, "chat");
        assert_eq!(all.recv().await.unwrap().event, "tick");

        correlator.unbind();
        assert!(chat.recv().await.is_none());
    }
}
