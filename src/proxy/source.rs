//! Proxy candidate sources
//!
//! Feeds return raw address lines; [`ProxySource`] merges them, drops
//! malformed and duplicate entries and hands the batch to the registry.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{BoostError, Result};
use crate::models::ProxyAddress;
use crate::proxy::registry::ProxyRegistry;

/// Default public proxy list
pub const DEFAULT_PROXY_LIST_URL: &str =
    "https://raw.githubusercontent.com/Skillter/ProxyGather/refs/heads/master/proxies/working-proxies-all.txt";

/// Default dated archive endpoint; `{date}` becomes `YYYY-MM-DD`
pub const DEFAULT_ARCHIVE_URL: &str = "https://api.checkerproxy.net/v1/landing/archive/{date}";

/// Upper bound on candidates taken from one fetch
pub const DEFAULT_MAX_CANDIDATES: usize = 10_000;

/// External list of proxy candidates
#[async_trait]
pub trait ProxyFeed: Send + Sync {
    /// Raw `host:port[:scheme]` lines
    async fn fetch(&self) -> Result<Vec<String>>;

    fn name(&self) -> String;
}

/// Split a text list into candidate lines, skipping blanks and `#` comments.
pub fn parse_proxy_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn feed_error(feed: &dyn ProxyFeed, reason: impl Into<String>) -> BoostError {
    BoostError::Feed {
        feed: feed.name(),
        reason: reason.into(),
    }
}

/// Plain-text list served over HTTP
pub struct UrlFeed {
    url: String,
    client: reqwest::Client,
}

impl UrlFeed {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl ProxyFeed for UrlFeed {
    async fn fetch(&self) -> Result<Vec<String>> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(feed_error(self, format!("HTTP {}", response.status())));
        }
        let body = response.text().await?;
        Ok(parse_proxy_list(&body))
    }

    fn name(&self) -> String {
        self.url.clone()
    }
}

/// Plain-text list on disk
pub struct FileFeed {
    path: PathBuf,
}

impl FileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ProxyFeed for FileFeed {
    async fn fetch(&self) -> Result<Vec<String>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(parse_proxy_list(&content))
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

/// Dated JSON archive, walked back one day at a time
///
/// Takes the most recent day (starting yesterday) that lists more than
/// `min_proxies` entries under `data.proxyList`.
pub struct ArchiveFeed {
    url_template: String,
    lookback_days: u64,
    min_proxies: usize,
    client: reqwest::Client,
}

impl ArchiveFeed {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            url_template: url_template.into(),
            lookback_days: 30,
            min_proxies: 100,
            client,
        })
    }

    pub fn with_lookback_days(mut self, days: u64) -> Self {
        self.lookback_days = days;
        self
    }

    pub fn with_min_proxies(mut self, min: usize) -> Self {
        self.min_proxies = min;
        self
    }

    fn url_for(&self, day: NaiveDate) -> String {
        self.url_template
            .replace("{date}", &day.format("%Y-%m-%d").to_string())
    }

    async fn fetch_day(&self, day: NaiveDate) -> Result<Vec<String>> {
        let response = self.client.get(self.url_for(day)).send().await?;
        if !response.status().is_success() {
            return Err(feed_error(self, format!("HTTP {}", response.status())));
        }
        let body: Value = response.json().await?;
        parse_archive_body(&body).ok_or_else(|| feed_error(self, "missing data.proxyList"))
    }
}

/// Extract `data.proxyList`, which is either an array or an object of strings.
pub fn parse_archive_body(body: &Value) -> Option<Vec<String>> {
    match body.get("data")?.get("proxyList")? {
        Value::Array(items) => Some(non_empty_strings(items.iter())),
        Value::Object(map) => Some(non_empty_strings(map.values())),
        _ => None,
    }
}

fn non_empty_strings<'a>(values: impl Iterator<Item = &'a Value>) -> Vec<String> {
    values
        .filter_map(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ProxyFeed for ArchiveFeed {
    async fn fetch(&self) -> Result<Vec<String>> {
        let mut day = Utc::now().date_naive();
        for _ in 0..self.lookback_days {
            day = day
                .checked_sub_days(Days::new(1))
                .ok_or_else(|| feed_error(self, "date underflow"))?;

            match self.fetch_day(day).await {
                Ok(proxies) if proxies.len() > self.min_proxies => {
                    info!("Archive {} lists {} proxies", day, proxies.len());
                    return Ok(proxies);
                }
                Ok(proxies) => debug!("Archive {} only lists {} proxies", day, proxies.len()),
                Err(e) => debug!("Archive {} unavailable: {}", day, e),
            }
        }
        Err(feed_error(
            self,
            format!("no day in the last {} had enough proxies", self.lookback_days),
        ))
    }

    fn name(&self) -> String {
        self.url_template.clone()
    }
}

/// Fixed in-memory list
pub struct StaticFeed {
    lines: Vec<String>,
}

impl StaticFeed {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ProxyFeed for StaticFeed {
    async fn fetch(&self) -> Result<Vec<String>> {
        Ok(self.lines.clone())
    }

    fn name(&self) -> String {
        "static".to_string()
    }
}

/// Outcome of one fetch across all feeds
#[derive(Debug, Default)]
pub struct FetchReport {
    pub addresses: Vec<ProxyAddress>,
    /// Non-fatal feed failures
    pub errors: Vec<BoostError>,
    pub malformed: usize,
}

/// Pulls candidates from every configured feed
pub struct ProxySource {
    feeds: Vec<Arc<dyn ProxyFeed>>,
    max_candidates: usize,
}

impl ProxySource {
    pub fn new(feeds: Vec<Arc<dyn ProxyFeed>>) -> Self {
        Self {
            feeds,
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }

    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates = max;
        self
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    /// Fetch every feed concurrently and merge into one deduplicated batch.
    #[instrument(skip(self), fields(feeds = self.feeds.len()))]
    pub async fn fetch_candidates(&self) -> FetchReport {
        let results = futures::future::join_all(self.feeds.iter().map(|feed| async move {
            (feed.name(), feed.fetch().await)
        }))
        .await;

        let mut report = FetchReport::default();
        let mut seen = HashSet::new();

        for (name, result) in results {
            let lines = match result {
                Ok(lines) => lines,
                Err(e) => {
                    warn!("Failed to fetch proxies from {}: {}", name, e);
                    report.errors.push(e);
                    continue;
                }
            };

            let before = report.addresses.len();
            for line in lines {
                match ProxyAddress::parse(&line) {
                    Ok(address) => {
                        if seen.insert(address.clone()) {
                            report.addresses.push(address);
                        }
                    }
                    Err(_) => report.malformed += 1,
                }
            }
            info!(
                "Fetched {} new proxies from {}",
                report.addresses.len() - before,
                name
            );
        }

        if report.addresses.len() > self.max_candidates {
            info!(
                "More than {} proxies, randomly picking {}",
                self.max_candidates, self.max_candidates
            );
            report.addresses.shuffle(&mut rand::thread_rng());
            report.addresses.truncate(self.max_candidates);
        }

        report
    }

    /// Fetch and enqueue; returns how many addresses were new to the registry.
    pub async fn refill(&self, registry: &ProxyRegistry) -> usize {
        let report = self.fetch_candidates().await;
        let fetched = report.addresses.len();
        let added = report
            .addresses
            .into_iter()
            .filter(|address| registry.enqueue_candidate(address.clone()))
            .count();

        info!(
            fetched,
            added,
            malformed = report.malformed,
            errors = report.errors.len(),
            "Proxy source refill complete"
        );
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyProtocol;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `/archive/{date}` from `days`; unknown dates get a 404.
    async fn archive_server(
        days: HashMap<String, Vec<&'static str>>,
    ) -> (String, Arc<AtomicUsize>) {
        const NOT_FOUND: &str =
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 2048];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let date = request
                    .split_whitespace()
                    .nth(1)
                    .and_then(|path| path.rsplit('/').next())
                    .unwrap_or_default()
                    .to_string();
                counter.fetch_add(1, Ordering::SeqCst);

                let response = match days.get(&date) {
                    Some(list) => {
                        let body = json!({ "data": { "proxyList": list } }).to_string();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    }
                    None => NOT_FOUND.to_string(),
                };
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        (format!("http://127.0.0.1:{}/archive/{{date}}", port), hits)
    }

    fn days_ago(days: u64) -> String {
        let day = Utc::now().date_naive().checked_sub_days(Days::new(days)).unwrap();
        day.format("%Y-%m-%d").to_string()
    }

    struct FailingFeed;

    #[async_trait]
    impl ProxyFeed for FailingFeed {
        async fn fetch(&self) -> Result<Vec<String>> {
            Err(BoostError::Feed {
                feed: "down".to_string(),
                reason: "connection refused".to_string(),
            })
        }

        fn name(&self) -> String {
            "down".to_string()
        }
    }

    #[test]
    fn test_parse_proxy_list() {
        let content = "# comment\n1.2.3.4:80\n\n  5.6.7.8:1080:socks5  \n#9.9.9.9:1\n";
        assert_eq!(
            parse_proxy_list(content),
            vec!["1.2.3.4:80".to_string(), "5.6.7.8:1080:socks5".to_string()]
        );
    }

    #[test]
    fn test_parse_archive_body_shapes() {
        let array = json!({"data": {"proxyList": ["1.1.1.1:80", "", "2.2.2.2:80"]}});
        assert_eq!(
            parse_archive_body(&array).unwrap(),
            vec!["1.1.1.1:80".to_string(), "2.2.2.2:80".to_string()]
        );

        let object = json!({"data": {"proxyList": {"0": "1.1.1.1:80", "1": null}}});
        assert_eq!(
            parse_archive_body(&object).unwrap(),
            vec!["1.1.1.1:80".to_string()]
        );

        assert!(parse_archive_body(&json!({"data": {}})).is_none());
        assert!(parse_archive_body(&json!({"data": {"proxyList": 3}})).is_none());
    }

    #[test]
    fn test_archive_url_for_day() {
        let feed = ArchiveFeed::new(DEFAULT_ARCHIVE_URL, Duration::from_secs(1)).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            feed.url_for(day),
            "https://api.checkerproxy.net/v1/landing/archive/2024-03-09"
        );
    }

    #[tokio::test]
    async fn test_archive_feed_walks_back_to_a_full_day() {
        let days = HashMap::from([
            (days_ago(1), vec!["1.1.1.1:80"]),
            (days_ago(2), vec!["2.2.2.2:80", "3.3.3.3:80", "4.4.4.4:80"]),
        ]);
        let (template, hits) = archive_server(days).await;

        let feed = ArchiveFeed::new(template, Duration::from_secs(5))
            .unwrap()
            .with_min_proxies(2)
            .with_lookback_days(3);

        let proxies = feed.fetch().await.unwrap();
        assert_eq!(proxies, vec!["2.2.2.2:80", "3.3.3.3:80", "4.4.4.4:80"]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_archive_feed_gives_up_after_lookback() {
        let days = HashMap::from([
            (days_ago(1), vec!["1.1.1.1:80"]),
            // Exactly the minimum is not enough
            (days_ago(3), vec!["2.2.2.2:80", "3.3.3.3:80"]),
            (days_ago(4), vec!["4.4.4.4:80", "5.5.5.5:80", "6.6.6.6:80"]),
        ]);
        let (template, hits) = archive_server(days).await;

        let feed = ArchiveFeed::new(template, Duration::from_secs(5))
            .unwrap()
            .with_min_proxies(2)
            .with_lookback_days(3);

        let err = feed.fetch().await.unwrap_err();
        assert!(matches!(err, BoostError::Feed { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_merges_and_dedups_feeds() {
        let source = ProxySource::new(vec![
            Arc::new(StaticFeed::new(["1.1.1.1:80", "2.2.2.2:80", "1.1.1.1:80"])),
            Arc::new(StaticFeed::new(["2.2.2.2:80", "3.3.3.3:1080:socks5", "garbage"])),
        ]);

        let report = source.fetch_candidates().await;
        assert_eq!(report.addresses.len(), 3);
        assert_eq!(report.malformed, 1);
        assert!(report.errors.is_empty());
        assert_eq!(report.addresses[2].protocol, ProxyProtocol::Socks5);
    }

    #[tokio::test]
    async fn test_failing_feed_is_reported_not_fatal() {
        let source = ProxySource::new(vec![
            Arc::new(FailingFeed),
            Arc::new(StaticFeed::new(["1.1.1.1:80"])),
        ]);

        let report = source.fetch_candidates().await;
        assert_eq!(report.addresses.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].is_transient());
    }

    #[tokio::test]
    async fn test_batch_is_capped() {
        let lines: Vec<String> = (1..=20).map(|n| format!("10.0.0.{}:80", n)).collect();
        let source =
            ProxySource::new(vec![Arc::new(StaticFeed::new(lines))]).with_max_candidates(5);

        let report = source.fetch_candidates().await;
        assert_eq!(report.addresses.len(), 5);
        let unique: HashSet<_> = report.addresses.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn test_refill_only_counts_new_addresses() {
        let registry = ProxyRegistry::default();
        let source = ProxySource::new(vec![Arc::new(StaticFeed::new([
            "1.1.1.1:80",
            "2.2.2.2:80",
        ]))]);

        assert_eq!(source.refill(&registry).await, 2);
        assert_eq!(source.refill(&registry).await, 0);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_file_feed_reads_list() {
        let name = format!("proxy-boost-feed-{}.txt", std::process::id());
        let path = std::env::temp_dir().join(name);
        tokio::fs::write(&path, "# saved\n1.2.3.4:3128\n").await.unwrap();

        let lines = FileFeed::new(&path).fetch().await.unwrap();
        assert_eq!(lines, vec!["1.2.3.4:3128".to_string()]);

        tokio::fs::remove_file(&path).await.unwrap();
        assert!(FileFeed::new(&path).fetch().await.is_err());
    }

    #[tokio::test]
    async fn test_url_feed_fetches_text_list() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let body = "1.2.3.4:80\n5.6.7.8:8080\n";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let feed = UrlFeed::new(
            format!("http://127.0.0.1:{}/list.txt", port),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(feed.fetch().await.unwrap().len(), 2);
    }
}
