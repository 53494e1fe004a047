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

//! Gateway address resolution.
//!
//! Produces an ordered list of connection candidates from the available
//! hints: an address remembered from the last successful session, the
//! explicitly configured URL, environment overrides, and finally the
//! well-known local gateway ports. [`resolve`] is a pure function over
//! [`ResolveInputs`] so the ordering rules stay unit-testable; reading the
//! process environment is the caller's job via [`env_hint`].

use url::Url;

use crate::transport::TransportError;

/// Environment variables consulted for a gateway URL override, in priority
/// order.
pub const ENV_HINTS: [&str; 2] = ["MOLTZ_GATEWAY_URL", "GATEWAY_URL"];

/// Well-known local gateway addresses probed when no explicit hint exists.
const WELL_KNOWN: [&str; 4] = [
    "ws://127.0.0.1:18789",
    "ws://localhost:18789",
    "ws://127.0.0.1:8789",
    "ws://localhost:8789",
];

/// How the WebSocket connection to a candidate should be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Standard async connector with system DNS behavior.
    Standard,
    /// Manual IPv4-only TCP establishment with explicit TLS upgrade.
    ///
    /// Used where the standard connector's resolver hangs on hosts whose
    /// IPv6 path is advertised but unroutable, which is chronic on macOS
    /// and on tailnet (`.ts.net`) addresses.
    ManualFallback,
}

/// Where a candidate came from, for logging and last-good bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    /// Address remembered from the most recent successful connection.
    LastGood,
    /// Explicitly configured by the embedding application.
    Configured,
    /// Taken from an environment variable override.
    Environment,
    /// One of the well-known local gateway ports.
    WellKnown,
}

/// A single gateway address to attempt, with its establishment mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// WebSocket URL (`ws://` or `wss://`).
    pub url: String,
    /// Establishment path to use.
    pub mode: TransportMode,
    /// Provenance of this candidate.
    pub source: CandidateSource,
}

/// Hints available to [`resolve`].
#[derive(Debug, Clone, Default)]
pub struct ResolveInputs {
    /// URL configured by the embedding application, if any.
    pub configured: Option<String>,
    /// URL taken from the environment, if any. See [`env_hint`].
    pub env_hint: Option<String>,
    /// URL of the last successful connection, tried first when present.
    pub last_good: Option<String>,
}

/// Read the gateway URL override from the process environment.
pub fn env_hint() -> Option<String> {
    ENV_HINTS
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// Pick the establishment mode for a URL.
///
/// macOS gets the manual path unconditionally; elsewhere only tailnet hosts
/// need it.
pub fn mode_for(url: &str) -> TransportMode {
    if cfg!(target_os = "macos") {
        return TransportMode::ManualFallback;
    }
    match Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) if host.ends_with(".ts.net") => TransportMode::ManualFallback,
            _ => TransportMode::Standard,
        },
        Err(_) => TransportMode::Standard,
    }
}

/// The `wss://` spelling of a `ws://` URL, if the input is plain.
///
/// Scheme changes are upgrade-only: a `wss://` URL is never rewritten to
/// `ws://`, so a failed TLS attempt cannot be downgraded into a plaintext
/// connection by a misbehaving network.
pub fn upgrade_scheme(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() == "ws" {
        Some(format!("wss{}", url.strip_prefix("ws")?))
    } else {
        None
    }
}

/// Validate that a URL is a usable gateway address.
///
/// # Errors
///
/// Returns [`TransportError::InvalidUrl`] for unparseable URLs, non-WebSocket
/// schemes, or URLs with no host.
pub fn validate_url(url: &str) -> Result<(), TransportError> {
    let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(TransportError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            });
        }
    }
    if parsed.host_str().is_none() {
        return Err(TransportError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(())
}

/// Produce the ordered candidate list for one connection sequence.
///
/// Order: last-good, configured, environment, well-known ports. Duplicate
/// URLs keep their first (highest-priority) position. Hints that fail URL
/// validation are skipped rather than failing the whole resolution; the
/// result is empty only when every source was absent or invalid.
pub fn resolve(inputs: &ResolveInputs) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = Vec::new();

    if let Some(url) = &inputs.last_good {
        push_candidate(&mut candidates, url, CandidateSource::LastGood);
    }
    if let Some(url) = &inputs.configured {
        push_candidate(&mut candidates, url, CandidateSource::Configured);
    }
    if let Some(url) = &inputs.env_hint {
        push_candidate(&mut candidates, url, CandidateSource::Environment);
    }
    // Well-known ports are only probed when nothing explicit was given;
    // an explicit hint that is down should fail loudly, not silently land
    // on a different local gateway.
    if candidates.is_empty() {
        for url in WELL_KNOWN {
            push_candidate(&mut candidates, url, CandidateSource::WellKnown);
        }
    }

    candidates
}

fn push_candidate(candidates: &mut Vec<Candidate>, url: &str, source: CandidateSource) {
    if validate_url(url).is_err() {
        tracing::warn!(url, ?source, "skipping invalid gateway address hint");
        return;
    }
    if candidates.iter().any(|c| c.url == url) {
        return;
    }
    candidates.push(Candidate {
        url: url.to_string(),
        mode: mode_for(url),
        source,
    });
}
