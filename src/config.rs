use crate::coordinator::CoordinatorConfig;
use crate::dispatch::{DispatchConfig, HttpDispatcher, TARGET_PLACEHOLDER};
use crate::error::{BoostError, Result};
use crate::proxy::probe::{HttpProbe, Probe, ProbeMode, TunnelProbe, DEFAULT_PROBE_URL};
use crate::proxy::registry::RegistryConfig;
use crate::proxy::source::{
    ArchiveFeed, FileFeed, ProxyFeed, ProxySource, UrlFeed, DEFAULT_ARCHIVE_URL,
    DEFAULT_MAX_CANDIDATES, DEFAULT_PROXY_LIST_URL,
};
use crate::proxy::validation::ValidationConfig;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for every duration setting, in seconds (one year)
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker pool sizes
    pub pools: PoolConfig,
    /// Proxy lifecycle settings
    pub proxy: ProxyConfig,
    /// Where candidates come from
    pub source: SourceConfig,
    /// How candidates are validated
    pub probe: ProbeConfig,
    /// What a dispatch sends
    pub dispatch: DispatchTargetConfig,
    /// Progress reporting
    pub run: RunConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Validation workers (default: 75)
    pub validators: usize,
    /// Dispatch workers (default: 50)
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Idle seconds enforced after each use (default: 300)
    pub cooldown: u64,
    /// Consecutive failures tolerated before a proxy is retired (default: 3)
    pub failure_threshold: u32,
    /// Seconds a dispatch worker waits for an eligible proxy (default: 5)
    pub acquire_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Plain-text proxy list URLs
    pub urls: Vec<String>,
    /// Optional local proxy list
    pub file: Option<String>,
    /// Also walk the dated archive
    pub use_archive: bool,
    pub archive_url: String,
    /// Feed request timeout in seconds
    pub feed_timeout: u64,
    /// Poll feeds while supply is below this
    pub low_water_mark: usize,
    /// Seconds between feed polls
    pub poll_interval: u64,
    pub max_candidates: usize,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub url: String,
    pub mode: ProbeMode,
    /// Probe timeout in seconds
    pub timeout: u64,
}

#[derive(Debug, Clone)]
pub struct DispatchTargetConfig {
    /// Request URL; `{target}` is replaced by the target id
    pub url: String,
    pub method: String,
    /// Opaque `Cookie` header value
    pub cookie: Option<String>,
    /// Request timeout in seconds
    pub timeout: u64,
    /// Failed dispatches tolerated per target; 0 retries forever
    pub max_attempts: u64,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Seconds between progress reports
    pub progress_interval: u64,
    /// Seconds without live proxies before the run is flagged stalled
    pub stall_after: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            pools: PoolConfig {
                validators: parse_env("BOOST_VALIDATORS", "75")?,
                workers: parse_env("BOOST_WORKERS", "50")?,
            },
            proxy: ProxyConfig {
                cooldown: parse_env("BOOST_COOLDOWN", "300")?,
                failure_threshold: parse_env("BOOST_FAILURE_THRESHOLD", "3")?,
                acquire_timeout: parse_env("BOOST_ACQUIRE_TIMEOUT", "5")?,
            },
            source: SourceConfig {
                urls: split_list(&get_env_or("BOOST_PROXY_URLS", DEFAULT_PROXY_LIST_URL)),
                file: non_empty(get_env_or("BOOST_PROXY_FILE", "")),
                use_archive: parse_bool("BOOST_USE_ARCHIVE", false)?,
                archive_url: get_env_or("BOOST_ARCHIVE_URL", DEFAULT_ARCHIVE_URL),
                feed_timeout: parse_env("BOOST_FEED_TIMEOUT", "10")?,
                low_water_mark: parse_env("BOOST_LOW_WATER_MARK", "50")?,
                poll_interval: parse_env("BOOST_POLL_INTERVAL", "60")?,
                max_candidates: parse_env(
                    "BOOST_MAX_CANDIDATES",
                    &DEFAULT_MAX_CANDIDATES.to_string(),
                )?,
            },
            probe: ProbeConfig {
                url: get_env_or("BOOST_PROBE_URL", DEFAULT_PROBE_URL),
                mode: {
                    let raw = get_env_or("BOOST_PROBE_MODE", "http");
                    ProbeMode::from_str(&raw).ok_or_else(|| {
                        BoostError::InvalidConfig(format!(
                            "BOOST_PROBE_MODE must be http or connect, got {}",
                            raw
                        ))
                    })?
                },
                timeout: parse_env("BOOST_PROBE_TIMEOUT", "3")?,
            },
            dispatch: DispatchTargetConfig {
                url: get_env_or("BOOST_DISPATCH_URL", ""),
                method: get_env_or("BOOST_DISPATCH_METHOD", "POST"),
                cookie: non_empty(get_env_or("BOOST_DISPATCH_COOKIE", "")),
                timeout: parse_env("BOOST_DISPATCH_TIMEOUT", "3")?,
                max_attempts: parse_env("BOOST_MAX_ATTEMPTS", "0")?,
            },
            run: RunConfig {
                progress_interval: parse_env("BOOST_PROGRESS_INTERVAL", "2")?,
                stall_after: parse_env("BOOST_STALL_AFTER", "60")?,
            },
            log: LogConfig {
                level: get_env_or("BOOST_LOG_LEVEL", "info"),
                format: get_env_or("BOOST_LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Reject settings that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(BoostError::InvalidConfig(msg.to_string()));

        if self.pools.validators == 0 || self.pools.workers == 0 {
            return invalid("BOOST_VALIDATORS and BOOST_WORKERS must be at least 1");
        }
        if self.proxy.acquire_timeout == 0
            || self.probe.timeout == 0
            || self.dispatch.timeout == 0
            || self.source.feed_timeout == 0
        {
            return invalid("timeouts must be at least one second");
        }
        if self.source.poll_interval == 0 || self.run.progress_interval == 0 {
            return invalid("BOOST_POLL_INTERVAL and BOOST_PROGRESS_INTERVAL must be at least 1");
        }
        let durations = [
            self.proxy.cooldown,
            self.proxy.acquire_timeout,
            self.probe.timeout,
            self.dispatch.timeout,
            self.source.feed_timeout,
            self.source.poll_interval,
            self.run.progress_interval,
            self.run.stall_after,
        ];
        if durations.iter().any(|&secs| secs > MAX_DURATION_SECS) {
            return invalid("cooldown, timeouts and intervals must not exceed one year");
        }
        if !self.dispatch.url.contains(TARGET_PLACEHOLDER) {
            return invalid("BOOST_DISPATCH_URL must contain {target}");
        }
        if !self.has_feed() {
            return invalid(
                "no proxy feed: set BOOST_PROXY_URLS, BOOST_PROXY_FILE or BOOST_USE_ARCHIVE",
            );
        }
        Ok(())
    }

    pub fn has_feed(&self) -> bool {
        !self.source.urls.is_empty() || self.source.file.is_some() || self.source.use_archive
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            cooldown: Duration::from_secs(self.proxy.cooldown),
            failure_threshold: self.proxy.failure_threshold,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            validation: ValidationConfig {
                workers: self.pools.validators,
                probe_timeout: Duration::from_secs(self.probe.timeout),
                ..ValidationConfig::default()
            },
            dispatch: DispatchConfig {
                workers: self.pools.workers,
                acquire_timeout: Duration::from_secs(self.proxy.acquire_timeout),
                dispatch_timeout: Duration::from_secs(self.dispatch.timeout),
                ..DispatchConfig::default()
            },
            low_water_mark: self.source.low_water_mark,
            poll_interval: Duration::from_secs(self.source.poll_interval),
            progress_interval: Duration::from_secs(self.run.progress_interval),
            stall_after: Duration::from_secs(self.run.stall_after),
            max_failures_per_item: (self.dispatch.max_attempts > 0)
                .then_some(self.dispatch.max_attempts),
        }
    }

    /// Build the proxy source from the configured feeds
    pub fn build_source(&self) -> Result<ProxySource> {
        let timeout = Duration::from_secs(self.source.feed_timeout);
        let mut feeds: Vec<Arc<dyn ProxyFeed>> = Vec::new();

        for url in &self.source.urls {
            feeds.push(Arc::new(UrlFeed::new(url.clone(), timeout)?));
        }
        if let Some(path) = &self.source.file {
            feeds.push(Arc::new(FileFeed::new(path)));
        }
        if self.source.use_archive {
            feeds.push(Arc::new(ArchiveFeed::new(self.source.archive_url.clone(), timeout)?));
        }

        Ok(ProxySource::new(feeds).with_max_candidates(self.source.max_candidates))
    }

    pub fn build_probe(&self) -> Result<Arc<dyn Probe>> {
        let probe: Arc<dyn Probe> = match self.probe.mode {
            ProbeMode::Http => Arc::new(HttpProbe::new(self.probe.url.clone())),
            ProbeMode::Connect => Arc::new(TunnelProbe::from_url(&self.probe.url)?),
        };
        Ok(probe)
    }

    pub fn build_dispatcher(&self) -> Result<HttpDispatcher> {
        HttpDispatcher::new(
            self.dispatch.url.clone(),
            &self.dispatch.method,
            self.dispatch.cookie.as_deref(),
        )
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| BoostError::InvalidConfig(format!("{} must be a valid number", key)))
}

fn parse_bool(key: &str, default: bool) -> Result<bool> {
    match get_env_or(key, "").trim().to_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(BoostError::InvalidConfig(format!(
            "{} must be a boolean, got {}",
            key, other
        ))),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}
