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

//! Connection health tracking.
//!
//! Keepalive pings double as latency probes: the writer stamps each ping,
//! the read loop records the elapsed time when the pong arrives, and the
//! rolling window summarizes into a coarse [`ConnectionQuality`] for the UI.

use serde::Serialize;
use std::time::Instant;

/// Samples kept in the rolling latency window.
const WINDOW: usize = 10;

/// Coarse connection quality derived from recent round-trip latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// Average round trip under 100ms.
    Excellent,
    /// Average round trip under 300ms.
    Good,
    /// Average round trip under 1000ms.
    Fair,
    /// Average round trip at or above 1000ms.
    Poor,
    /// Not enough samples yet.
    Unknown,
}

/// Health state of the current session.
#[derive(Debug, Default)]
pub struct HealthMetrics {
    latencies_ms: Vec<u64>,
    ping_sent: Option<Instant>,
    pongs_received: u64,
    pings_unanswered: u64,
}

impl HealthMetrics {
    /// Record that a keepalive ping was just written.
    pub fn ping_sent(&mut self) {
        if self.ping_sent.is_some() {
            self.pings_unanswered += 1;
        }
        self.ping_sent = Some(Instant::now());
    }

    /// Record an arriving pong and fold its round trip into the window.
    pub fn pong_received(&mut self) {
        self.pongs_received += 1;
        if let Some(sent) = self.ping_sent.take() {
            let elapsed_ms = sent.elapsed().as_millis() as u64;
            self.latencies_ms.push(elapsed_ms);
            if self.latencies_ms.len() > WINDOW {
                self.latencies_ms.remove(0);
            }
        }
    }

    /// Average round-trip latency over the window, in milliseconds.
    pub fn average_latency_ms(&self) -> Option<u64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        Some(self.latencies_ms.iter().sum::<u64>() / self.latencies_ms.len() as u64)
    }

    /// Pings that went unanswered before the next ping was due.
    pub fn pings_unanswered(&self) -> u64 {
        self.pings_unanswered
    }

    /// Quality rating for the current window.
    pub fn quality(&self) -> ConnectionQuality {
        match self.average_latency_ms() {
            None => ConnectionQuality::Unknown,
            Some(ms) if ms < 100 => ConnectionQuality::Excellent,
            Some(ms) if ms < 300 => ConnectionQuality::Good,
            Some(ms) if ms < 1000 => ConnectionQuality::Fair,
            Some(_) => ConnectionQuality::Poor,
        }
    }

    /// Clear all samples, e.g. when a new session starts.
    pub fn reset(&mut self) {
        *self = HealthMetrics::default();
    }
}
