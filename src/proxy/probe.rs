//! Proxy probes
//!
//! A probe is one bounded request through a candidate proxy, used only to
//! decide whether the proxy is reachable.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{BoostError, Result};
use crate::models::ProxyAddress;
use crate::proxy::transport::ProxyTransport;

/// Default URL to test proxies against
pub const DEFAULT_PROBE_URL: &str = "http://httpbin.org/post";

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Passed { latency: Duration },
    Failed(String),
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, ProbeOutcome::Passed { .. })
    }
}

/// Classifies a proxy as reachable or not
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, address: &ProxyAddress, timeout: Duration) -> ProbeOutcome;

    fn name(&self) -> &'static str;
}

/// How the binary probes proxies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeMode {
    /// Full HTTP request through the proxy
    #[default]
    Http,
    /// Tunnel establishment only
    Connect,
}

impl ProbeMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(Self::Http),
            "connect" | "tunnel" => Some(Self::Connect),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Connect => "connect",
        }
    }
}

/// Sends a POST to a fixed endpoint through the proxy; any 2xx passes.
pub struct HttpProbe {
    url: String,
    user_agent: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: format!("proxy-boost/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    async fn send(&self, address: &ProxyAddress, limit: Duration) -> Result<reqwest::StatusCode> {
        let client = ProxyTransport::http_client(address, limit, &self.user_agent)?;
        let response = client.post(&self.url).send().await?;
        Ok(response.status())
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, address: &ProxyAddress, limit: Duration) -> ProbeOutcome {
        let start = Instant::now();
        match timeout(limit, self.send(address, limit)).await {
            Ok(Ok(status)) if status.is_success() => ProbeOutcome::Passed {
                latency: start.elapsed(),
            },
            Ok(Ok(status)) => ProbeOutcome::Failed(format!("HTTP status: {}", status)),
            Ok(Err(e)) if is_timeout(&e) => ProbeOutcome::TimedOut,
            Ok(Err(e)) => ProbeOutcome::Failed(e.to_string()),
            Err(_) => ProbeOutcome::TimedOut,
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

fn is_timeout(err: &BoostError) -> bool {
    matches!(err, BoostError::Http(e) if e.is_timeout())
}

/// Establishes a tunnel to the probe target and drops it.
///
/// Validates both connectivity to the proxy and its ability to reach the
/// target without spending a request.
pub struct TunnelProbe {
    target_host: String,
    target_port: u16,
}

impl TunnelProbe {
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let (host, port) = ProxyTransport::parse_target(url)?;
        Ok(Self::new(host, port))
    }
}

#[async_trait]
impl Probe for TunnelProbe {
    async fn probe(&self, address: &ProxyAddress, limit: Duration) -> ProbeOutcome {
        let start = Instant::now();
        let connect = ProxyTransport::connect(address, &self.target_host, self.target_port);

        match timeout(limit, connect).await {
            Ok(Ok(_stream)) => {
                debug!(
                    "Proxy {} is healthy (CONNECT to {}:{} successful)",
                    address, self.target_host, self.target_port
                );
                ProbeOutcome::Passed {
                    latency: start.elapsed(),
                }
            }
            Ok(Err(e)) => ProbeOutcome::Failed(format!("connect failed: {}", e)),
            Err(_) => ProbeOutcome::TimedOut,
        }
    }

    fn name(&self) -> &'static str {
        "connect"
    }
}
