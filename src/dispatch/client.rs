//! Dispatchers issue one unit of work through a proxy.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, USER_AGENT};
use reqwest::Method;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{BoostError, Result};
use crate::models::ProxyAddress;
use crate::proxy::transport::ProxyTransport;

/// Placeholder substituted with the work item's target id
pub const TARGET_PLACEHOLDER: &str = "{target}";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
];

/// Result of one dispatch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success { status: u16, latency: Duration },
    Rejected { status: u16 },
    Failed(String),
    TimedOut,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Success { .. })
    }
}

/// Issues one unit of work toward a target through a proxy
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        proxy: &ProxyAddress,
        target_id: &str,
        timeout: Duration,
    ) -> DispatchOutcome;

    fn name(&self) -> &'static str {
        "dispatcher"
    }
}

/// Sends one request to a URL template through the proxy.
///
/// 2xx and 3xx count as success; redirects are not followed.
pub struct HttpDispatcher {
    url_template: String,
    method: Method,
    cookie: Option<HeaderValue>,
}

impl HttpDispatcher {
    pub fn new(
        url_template: impl Into<String>,
        method: &str,
        cookie: Option<&str>,
    ) -> Result<Self> {
        let url_template = url_template.into();
        if !url_template.contains(TARGET_PLACEHOLDER) {
            return Err(BoostError::InvalidConfig(format!(
                "Dispatch URL must contain {}",
                TARGET_PLACEHOLDER
            )));
        }
        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| BoostError::InvalidConfig(format!("Invalid HTTP method: {}", method)))?;
        let cookie = cookie
            .filter(|c| !c.is_empty())
            .map(HeaderValue::from_str)
            .transpose()
            .map_err(|_| BoostError::InvalidConfig("Cookie contains invalid characters".into()))?;

        Ok(Self {
            url_template,
            method,
            cookie,
        })
    }

    pub fn url_for(&self, target_id: &str) -> String {
        self.url_template.replace(TARGET_PLACEHOLDER, target_id)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);
        headers.insert(USER_AGENT, HeaderValue::from_static(agent));
        if let Some(cookie) = &self.cookie {
            headers.insert(COOKIE, cookie.clone());
        }
        headers
    }

    async fn send(&self, proxy: &ProxyAddress, target_id: &str, limit: Duration) -> Result<u16> {
        let client = ProxyTransport::client_builder(proxy, limit)?
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let response = client
            .request(self.method.clone(), self.url_for(target_id))
            .headers(self.headers())
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        proxy: &ProxyAddress,
        target_id: &str,
        limit: Duration,
    ) -> DispatchOutcome {
        let start = Instant::now();
        match timeout(limit, self.send(proxy, target_id, limit)).await {
            Ok(Ok(status)) if (200..400).contains(&status) => DispatchOutcome::Success {
                status,
                latency: start.elapsed(),
            },
            Ok(Ok(status)) => {
                debug!(proxy = %proxy, status, "Dispatch rejected");
                DispatchOutcome::Rejected { status }
            }
            Ok(Err(BoostError::Http(e))) if e.is_timeout() => DispatchOutcome::TimedOut,
            Ok(Err(e)) => DispatchOutcome::Failed(e.to_string()),
            Err(_) => DispatchOutcome::TimedOut,
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
