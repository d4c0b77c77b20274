use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BoostError, Result};

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyProtocol::Http),
            "https" => Some(ProxyProtocol::Https),
            "socks4" => Some(ProxyProtocol::Socks4),
            "socks5" | "socks5h" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ProxyProtocol::Socks4 | ProxyProtocol::Socks5)
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Credentials for proxies that require them
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Network endpoint of a proxy. Equality is the dedup key of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyAddress {
    pub host: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<ProxyCredentials>,
}

impl ProxyAddress {
    pub fn new(host: impl Into<String>, port: u16, protocol: ProxyProtocol) -> Self {
        Self {
            host: host.into().to_lowercase(),
            port,
            protocol,
            credentials: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(ProxyCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Parse `host:port`, `host:port:scheme` or `scheme://host:port`, each
    /// optionally carrying `user:pass@` before the host.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let invalid = || BoostError::InvalidProxyAddress(raw.to_string());

        if raw.is_empty() {
            return Err(invalid());
        }

        let (protocol, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => (
                ProxyProtocol::from_str(scheme)
                    .ok_or_else(|| BoostError::UnsupportedProtocol(scheme.to_string()))?,
                rest.trim_end_matches('/'),
            ),
            None => (ProxyProtocol::Http, raw),
        };

        let (credentials, rest) = match rest.rsplit_once('@') {
            Some((userinfo, endpoint)) => {
                let (username, password) = userinfo.split_once(':').ok_or_else(invalid)?;
                if username.is_empty() {
                    return Err(invalid());
                }
                (Some((username, password)), endpoint)
            }
            None => (None, rest),
        };

        let mut parts = rest.split(':');
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let port = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .filter(|p| *p != 0)
            .ok_or_else(invalid)?;

        let protocol = match (parts.next(), raw.contains("://")) {
            (None, _) => protocol,
            (Some(scheme), false) => ProxyProtocol::from_str(scheme)
                .ok_or_else(|| BoostError::UnsupportedProtocol(scheme.to_string()))?,
            (Some(_), true) => return Err(invalid()),
        };

        if parts.next().is_some() {
            return Err(invalid());
        }

        let address = Self::new(host, port, protocol);
        Ok(match credentials {
            Some((username, password)) => address.with_credentials(username, password),
            None => address,
        })
    }

    /// `host:port` form, as dialed over TCP.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Proxy URL understood by HTTP clients.
    pub fn url(&self) -> String {
        let scheme = match self.protocol {
            ProxyProtocol::Http | ProxyProtocol::Https => "http",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5h",
        };
        match &self.credentials {
            Some(creds) => format!(
                "{}://{}:{}@{}:{}",
                scheme, creds.username, creds.password, self.host, self.port
            ),
            None => format!("{}://{}:{}", scheme, self.host, self.port),
        }
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Registry-local identifier of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProxyId(pub u64);

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    Fetched,
    Validating,
    Valid,
    InUse,
    Cooldown,
    Dead,
}

impl ProxyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyState::Fetched => "fetched",
            ProxyState::Validating => "validating",
            ProxyState::Valid => "valid",
            ProxyState::InUse => "in_use",
            ProxyState::Cooldown => "cooldown",
            ProxyState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProxyState::Dead)
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a leased proxy performed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure,
    /// The request was cut off by a hard abort; says nothing about the proxy.
    Abandoned,
}

/// Number of proxies per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub fetched: usize,
    pub validating: usize,
    pub valid: usize,
    pub in_use: usize,
    pub cooldown: usize,
    pub dead: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.fetched + self.validating + self.valid + self.in_use + self.cooldown + self.dead
    }

    /// Proxies ready now or on their way to being ready: fetched, validating or valid.
    pub fn supply(&self) -> usize {
        self.fetched + self.validating + self.valid
    }

    pub(crate) fn bump(&mut self, state: ProxyState) {
        match state {
            ProxyState::Fetched => self.fetched += 1,
            ProxyState::Validating => self.validating += 1,
            ProxyState::Valid => self.valid += 1,
            ProxyState::InUse => self.in_use += 1,
            ProxyState::Cooldown => self.cooldown += 1,
            ProxyState::Dead => self.dead += 1,
        }
    }
}
