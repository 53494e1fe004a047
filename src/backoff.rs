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

//! Reconnection strategies.
//!
//! The supervisor delegates the retry policy to a pluggable
//! [`ReconnectionStrategy`]. The default, [`ExponentialBackoff`], doubles
//! the delay per attempt from one second up to a sixty-second ceiling with
//! a small jitter, and refuses to retry errors that credentials or
//! configuration make deterministic.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ClientError;

/// A strategy deciding whether, and after how long, to retry a lost or
/// failed connection.
///
/// # Examples
///
/// ```
/// use moltgate::backoff::ExponentialBackoff;
/// use std::time::Duration;
///
/// let strategy = ExponentialBackoff::builder()
///     .initial_delay(Duration::from_secs(1))
///     .max_delay(Duration::from_secs(60))
///     .max_attempts(Some(10))
///     .build();
/// ```
#[async_trait]
pub trait ReconnectionStrategy: Send + Sync {
    /// Whether another attempt should be made.
    ///
    /// `attempt` is 0-indexed; `last_error` is what ended the previous
    /// attempt or session.
    async fn should_reconnect(&self, attempt: u32, last_error: &ClientError) -> bool;

    /// Delay to wait before attempt number `attempt`.
    async fn next_delay(&self, attempt: u32) -> Duration;

    /// Called when a connection reaches the ready state.
    fn on_connected(&self);

    /// Called when a connection attempt fails or an established session is
    /// lost.
    fn on_disconnected(&self, error: &ClientError);

    /// Reset internal state, discarding accumulated failure history.
    fn reset(&self);

    /// Human-readable strategy name, for logging.
    fn name(&self) -> &str;
}

/// Counters describing reconnection behavior, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ReconnectionMetrics {
    /// Total attempts made.
    pub total_attempts: u64,
    /// Attempts that reached the ready state.
    pub successful_reconnections: u64,
    /// Attempts that failed.
    pub failed_reconnections: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Most recent failure, rendered.
    pub last_error: Option<String>,
}

impl ReconnectionMetrics {
    /// Record one attempt.
    pub fn record_attempt(&mut self) {
        self.total_attempts += 1;
    }

    /// Record a success and clear the failure streak.
    pub fn record_success(&mut self) {
        self.successful_reconnections += 1;
        self.consecutive_failures = 0;
        self.last_error = None;
    }

    /// Record a failure.
    pub fn record_failure(&mut self, error: &ClientError) {
        self.failed_reconnections += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
    }
}

/// Exponential backoff with jitter.
///
/// Delay for attempt `n` is `initial_delay * multiplier^n`, capped at
/// `max_delay`, then scaled by a random factor in `[0.9, 1.1]` so a fleet
/// of clients losing the same gateway does not retry in lockstep.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    max_attempts: Option<u32>,
    metrics: Mutex<ReconnectionMetrics>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ExponentialBackoff {
    /// Create a builder seeded with the client defaults: 1s initial delay,
    /// 60s cap, doubling, jitter on, 10 attempts.
    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder::default()
    }

    /// Snapshot of the current metrics.
    pub fn metrics(&self) -> ReconnectionMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = Duration::from_millis(base_ms as u64).min(self.max_delay);

        if self.jitter {
            let factor = 0.9 + rand::random::<f64>() * 0.2;
            Duration::from_millis((capped.as_millis() as f64 * factor) as u64)
        } else {
            capped
        }
    }
}

#[async_trait]
impl ReconnectionStrategy for ExponentialBackoff {
    async fn should_reconnect(&self, attempt: u32, last_error: &ClientError) -> bool {
        // Rejected credentials and bad configuration fail identically on
        // every attempt; retrying them only spams the gateway's auth log.
        if last_error.requires_reauth() || !last_error.is_retryable() {
            return false;
        }
        if let Some(max) = self.max_attempts
            && attempt >= max
        {
            return false;
        }
        true
    }

    async fn next_delay(&self, attempt: u32) -> Duration {
        self.calculate_delay(attempt)
    }

    fn on_connected(&self) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        metrics.record_success();
    }

    fn on_disconnected(&self, error: &ClientError) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        metrics.record_failure(error);
    }

    fn reset(&self) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        *metrics = ReconnectionMetrics::default();
    }

    fn name(&self) -> &str {
        "ExponentialBackoff"
    }
}

/// Builder for [`ExponentialBackoff`].
#[derive(Debug)]
pub struct ExponentialBackoffBuilder {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    max_attempts: Option<u32>,
}

impl Default for ExponentialBackoffBuilder {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            max_attempts: Some(10),
        }
    }
}

impl ExponentialBackoffBuilder {
    /// Delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Ceiling on the delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor per attempt.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Attempt limit; `None` retries forever.
    pub fn max_attempts(mut self, max: Option<u32>) -> Self {
        self.max_attempts = max;
        self
    }

    /// Build the strategy.
    pub fn build(self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
            max_attempts: self.max_attempts,
            metrics: Mutex::new(ReconnectionMetrics::default()),
        }
    }
}

/// A strategy that never reconnects.
///
/// Useful for probes and tests that want exactly one connection attempt.
#[derive(Debug, Default)]
pub struct NoReconnect;

#[async_trait]
impl ReconnectionStrategy for NoReconnect {
    async fn should_reconnect(&self, _attempt: u32, _last_error: &ClientError) -> bool {
        false
    }

    async fn next_delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }

    fn on_connected(&self) {}

    fn on_disconnected(&self, _error: &ClientError) {}

    fn reset(&self) {}

    fn name(&self) -> &str {
        "NoReconnect"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    fn lost() -> ClientError {
        ClientError::Transport(TransportError::ConnectionLost {
            reason: "peer reset".to_string(),
        })
    }

    #[tokio::test]
    async fn delays_double_up_to_the_cap() {
        let strategy = ExponentialBackoff::builder().jitter(false).build();
        assert_eq!(strategy.next_delay(0).await, Duration::from_secs(1));
        assert_eq!(strategy.next_delay(1).await, Duration::from_secs(2));
        assert_eq!(strategy.next_delay(2).await, Duration::from_secs(4));
        assert_eq!(strategy.next_delay(5).await, Duration::from_secs(32));
        assert_eq!(strategy.next_delay(6).await, Duration::from_secs(60));
        assert_eq!(strategy.next_delay(20).await, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn jitter_stays_within_ten_percent() {
        let strategy = ExponentialBackoff::builder().build();
        for _ in 0..50 {
            let delay = strategy.next_delay(2).await;
            assert!(delay >= Duration::from_millis(3600), "delay {delay:?} too short");
            assert!(delay <= Duration::from_millis(4400), "delay {delay:?} too long");
        }
    }

    #[tokio::test]
    async fn attempt_limit_is_honored() {
        let strategy = ExponentialBackoff::builder().max_attempts(Some(3)).build();
        assert!(strategy.should_reconnect(0, &lost()).await);
        assert!(strategy.should_reconnect(2, &lost()).await);
        assert!(!strategy.should_reconnect(3, &lost()).await);
    }

    #[tokio::test]
    async fn auth_rejection_stops_retries() {
        let strategy = ExponentialBackoff::default();
        let err = ClientError::Gateway {
            code: "UNAUTHORIZED".to_string(),
            message: "bad token".to_string(),
            details: None,
            retryable: Some(false),
        };
        assert!(!strategy.should_reconnect(0, &err).await);
    }

    #[tokio::test]
    async fn metrics_track_failure_streaks() {
        let strategy = ExponentialBackoff::default();
        strategy.on_disconnected(&lost());
        strategy.on_disconnected(&lost());
        assert_eq!(strategy.metrics().consecutive_failures, 2);
        strategy.on_connected();
        assert_eq!(strategy.metrics().consecutive_failures, 0);
        assert_eq!(strategy.metrics().successful_reconnections, 1);
    }

    #[tokio::test]
    async fn no_reconnect_never_retries() {
        let strategy = NoReconnect;
        assert!(!strategy.should_reconnect(0, &lost()).await);
    }
}
