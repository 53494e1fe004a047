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

//! WebSocket connection establishment.
//!
//! Two paths produce the same stream type. The standard path hands the URL
//! to the async connector and lets it resolve, dial, and negotiate TLS. The
//! manual path exists because that connector's resolver can hang for tens of
//! seconds on hosts with broken IPv6: it resolves on a blocking thread,
//! keeps only IPv4 addresses, dials with an explicit per-attempt timeout,
//! then upgrades to TLS by hand before speaking WebSocket. Crucially the TLS
//! layer is still given the original hostname for certificate verification,
//! so pinning resolution to an IP never weakens the TLS identity check.
//!
//! [`establish`] wraps either path with the scheme-variant fallback: when the
//! primary URL fails and an upgraded (`ws` to `wss`) spelling exists, the
//! alternate is tried with the time remaining in the overall window.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, client_async, connect_async};
use url::Url;

use crate::transport::resolver::{Candidate, TransportMode, upgrade_scheme};
use crate::transport::TransportError;

/// The established WebSocket stream, identical for both paths.
pub type RawTransport = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A successfully established connection plus how it was reached.
#[derive(Debug)]
pub struct Established {
    /// The live WebSocket stream, pre-handshake.
    pub stream: RawTransport,
    /// The URL that actually connected (may be the upgraded variant).
    pub used_url: String,
    /// Whether the `ws` to `wss` upgrade was what succeeded.
    pub scheme_upgraded: bool,
}

/// Deadlines governing one establishment sequence.
#[derive(Debug, Clone, Copy)]
pub struct EstablishTimeouts {
    /// Budget for a single URL attempt.
    pub per_attempt: Duration,
    /// Budget for the whole sequence including the scheme-variant fallback.
    pub overall: Duration,
}

impl Default for EstablishTimeouts {
    fn default() -> Self {
        Self {
            per_attempt: Duration::from_secs(5),
            overall: Duration::from_secs(10),
        }
    }
}

/// Establish a WebSocket connection to `candidate`, trying the upgraded
/// scheme variant if the primary URL fails within the overall window.
///
/// # Errors
///
/// Returns the error from the last attempted variant when every variant
/// fails or the overall window elapses.
pub async fn establish(
    candidate: &Candidate,
    timeouts: EstablishTimeouts,
) -> Result<Established, TransportError> {
    let started = Instant::now();

    tracing::debug!(url = %candidate.url, mode = ?candidate.mode, "attempting gateway connection");
    let primary = connect_once(&candidate.url, candidate.mode, timeouts.per_attempt).await;
    let primary_err = match primary {
        Ok(stream) => {
            return Ok(Established {
                stream,
                used_url: candidate.url.clone(),
                scheme_upgraded: false,
            });
        }
        Err(e) => e,
    };

    let Some(alternate) = upgrade_scheme(&candidate.url) else {
        return Err(primary_err);
    };
    let remaining = timeouts.overall.saturating_sub(started.elapsed());
    if remaining.is_zero() {
        return Err(primary_err);
    }

    tracing::debug!(
        url = %alternate,
        error = %primary_err,
        "plain connection failed, retrying with TLS"
    );
    let budget = remaining.min(timeouts.per_attempt);
    match connect_once(&alternate, candidate.mode, budget).await {
        Ok(stream) => Ok(Established {
            stream,
            used_url: alternate,
            scheme_upgraded: true,
        }),
        // The primary error describes the configured address; it is the one
        // worth surfacing.
        Err(_) => Err(primary_err),
    }
}

async fn connect_once(
    url: &str,
    mode: TransportMode,
    budget: Duration,
) -> Result<RawTransport, TransportError> {
    match mode {
        TransportMode::Standard => connect_standard(url, budget).await,
        TransportMode::ManualFallback => connect_manual(url, budget).await,
    }
}

async fn connect_standard(url: &str, budget: Duration) -> Result<RawTransport, TransportError> {
    let attempt = connect_async(url);
    match tokio::time::timeout(budget, attempt).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(TransportError::ConnectFailed {
            url: url.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(TransportError::ConnectTimeout {
            url: url.to_string(),
            timeout: budget,
        }),
    }
}

/// Manual establishment: blocking IPv4-only resolve and dial, then explicit
/// TLS for `wss`, then the WebSocket client handshake over the prepared
/// stream.
async fn connect_manual(url: &str, budget: Duration) -> Result<RawTransport, TransportError> {
    let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: "no port and no default for scheme".to_string(),
        })?;
    let use_tls = parsed.scheme() == "wss";

    let attempt = async {
        let tcp = dial_ipv4(host.clone(), port, budget).await?;
        tcp.set_nodelay(true)?;

        let stream = if use_tls {
            let tls = tls_upgrade(&host, tcp).await?;
            MaybeTlsStream::Rustls(tls)
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        let (ws, _response) =
            client_async(url, stream)
                .await
                .map_err(|e| TransportError::ConnectFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        Ok::<RawTransport, TransportError>(ws)
    };

    match tokio::time::timeout(budget, attempt).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::ConnectTimeout {
            url: url.to_string(),
            timeout: budget,
        }),
    }
}

/// Resolve and dial on a blocking thread, keeping only IPv4 addresses.
async fn dial_ipv4(host: String, port: u16, budget: Duration) -> Result<TcpStream, TransportError> {
    let target = format!("{host}:{port}");
    let std_stream = tokio::task::spawn_blocking(move || {
        let addr = target
            .to_socket_addrs()
            .map_err(|e| TransportError::ResolutionFailed {
                reason: format!("DNS resolution of {target} failed: {e}"),
            })?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| TransportError::ResolutionFailed {
                reason: format!("no IPv4 address resolved for {target}"),
            })?;

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket
            .connect_timeout(&addr.into(), budget)
            .map_err(|e| TransportError::ConnectFailed {
                url: target.clone(),
                reason: format!("TCP connect to {addr} failed: {e}"),
            })?;

        let stream: std::net::TcpStream = socket.into();
        stream.set_nonblocking(true)?;
        Ok::<std::net::TcpStream, TransportError>(stream)
    })
    .await
    .map_err(|e| TransportError::ConnectFailed {
        url: format!("{host}:{port}"),
        reason: format!("dial task failed: {e}"),
    })??;

    TcpStream::from_std(std_stream).map_err(TransportError::Io)
}

/// Upgrade a TCP stream to TLS, verifying the certificate against the
/// original hostname rather than the dialed IP.
async fn tls_upgrade(
    host: &str,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TransportError> {
    let mut roots = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs().map_err(|e| TransportError::TlsFailed {
        host: host.to_string(),
        reason: format!("failed to load system root certificates: {e}"),
    })?;
    for cert in certs {
        // Individually unparseable system certs are skipped, not fatal.
        let _ = roots.add(cert);
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = rustls::pki_types::ServerName::try_from(host.to_string()).map_err(|e| {
        TransportError::TlsFailed {
            host: host.to_string(),
            reason: format!("invalid server name: {e}"),
        }
    })?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::TlsFailed {
            host: host.to_string(),
            reason: e.to_string(),
        })
}
