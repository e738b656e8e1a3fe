use crate::socks::{self, SocksError, TargetAddress};
use serde::Deserialize;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};

/// Default bound on the TCP connect to an upstream
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One configured upstream SOCKS5 proxy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "UpstreamEntry")]
pub struct Upstream {
    pub name: Option<String>,
    pub address: String,
}

/// Config form: either `"host:port"` or `{"name": .., "address": ..}`
#[derive(Deserialize)]
#[serde(untagged)]
enum UpstreamEntry {
    Address(String),
    Detailed {
        #[serde(default)]
        name: Option<String>,
        address: String,
    },
}

impl From<UpstreamEntry> for Upstream {
    fn from(entry: UpstreamEntry) -> Self {
        match entry {
            UpstreamEntry::Address(address) => Upstream::new(address),
            UpstreamEntry::Detailed {
                name: Some(name),
                address,
            } if !name.is_empty() => Upstream::named(name, address),
            UpstreamEntry::Detailed { address, .. } => Upstream::new(address),
        }
    }
}

impl Upstream {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    pub fn named(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// Handshake step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialStage {
    Negotiate,
    Connect,
}

impl fmt::Display for DialStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialStage::Negotiate => f.write_str("negotiate"),
            DialStage::Connect => f.write_str("connect request"),
        }
    }
}

/// Error type for reaching a target through one upstream
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("{upstream}: dial proxy: {source}")]
    Dial {
        upstream: String,
        #[source]
        source: io::Error,
    },

    #[error("{upstream}: dial proxy timed out after {timeout:?}")]
    DialTimeout { upstream: String, timeout: Duration },

    #[error("{upstream}: handshake deadline exceeded")]
    Deadline { upstream: String },

    #[error("{upstream}: {stage}: {source}")]
    Handshake {
        upstream: String,
        stage: DialStage,
        #[source]
        source: SocksError,
    },
}

impl DialError {
    /// Reply code reported by the upstream, if it sent a failure reply
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            DialError::Handshake {
                source: SocksError::Reply(code),
                ..
            } => Some(*code),
            _ => None,
        }
    }
}

/// Opens tunnels through upstream SOCKS5 proxies
#[derive(Debug, Clone, Copy)]
pub struct UpstreamDialer {
    connect_timeout: Duration,
}

impl Default for UpstreamDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl UpstreamDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Connect to `upstream` and ask it for a tunnel to `target`.
    ///
    /// The TCP connect is bounded by the connect timeout and everything is
    /// bounded by `deadline`. A failed attempt never leaks its socket: the
    /// stream is dropped (closed) on every error path.
    pub async fn dial(
        &self,
        upstream: &Upstream,
        target: &TargetAddress,
        deadline: Instant,
    ) -> Result<TcpStream, DialError> {
        let name = || upstream.to_string();

        let connect = timeout(self.connect_timeout, TcpStream::connect(&upstream.address));
        let mut stream = match timeout_at(deadline, connect).await {
            Err(_) => return Err(DialError::Deadline { upstream: name() }),
            Ok(Err(_)) => {
                return Err(DialError::DialTimeout {
                    upstream: name(),
                    timeout: self.connect_timeout,
                })
            }
            Ok(Ok(Err(source))) => {
                return Err(DialError::Dial {
                    upstream: name(),
                    source,
                })
            }
            Ok(Ok(Ok(stream))) => stream,
        };
        let _ = stream.set_nodelay(true);

        let handshake = async {
            socks::client_negotiate(&mut stream)
                .await
                .map_err(|e| (DialStage::Negotiate, e))?;
            socks::client_connect(&mut stream, target)
                .await
                .map_err(|e| (DialStage::Connect, e))
        };

        match timeout_at(deadline, handshake).await {
            Err(_) => Err(DialError::Deadline { upstream: name() }),
            Ok(Err((stage, source))) => Err(DialError::Handshake {
                upstream: name(),
                stage,
                source,
            }),
            Ok(Ok(())) => Ok(stream),
        }
    }
}
