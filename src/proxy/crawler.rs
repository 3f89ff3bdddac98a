//! Proxy sources: the collaborators the scan scheduler polls for candidates
//!
//! A source only needs to say what it is called, how often it should be
//! polled and hand back candidate URIs. `TxtListSource` covers the common case
//! of plain-text `IP:PORT` lists published over HTTP.

use crate::proxy::models::ProxyType;
use crate::proxy::parser::ProxyParser;
use crate::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Most published lists refresh about twice a day
const TXT_LIST_SCAN_INTERVAL_MINUTES: u64 = 720;

const MAX_CONCURRENT_LISTS: usize = 8;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Regex pattern to match IP:PORT patterns in text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b")
        .expect("Invalid IP:PORT regex")
});

/// A provider of freshly observed candidate proxy URIs
#[async_trait]
pub trait Source: Send + Sync {
    fn label(&self) -> &str;

    /// Minutes between polls
    fn scan_interval(&self) -> u64;

    async fn gather(&self) -> Result<Vec<String>>;
}

/// Configuration for HTTP-backed sources
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Timeout for HTTP requests
    pub timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl CrawlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// One published proxy list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSource {
    pub url: String,
    /// Scheme given to every entry of the list
    pub proxy_type: ProxyType,
}

impl ListSource {
    pub fn new(url: &str, proxy_type: ProxyType) -> Self {
        Self {
            url: url.to_string(),
            proxy_type,
        }
    }
}

/// Extract `scheme://ip:port` URIs from arbitrary text, first occurrence wins
pub fn extract_uris(content: &str, proxy_type: ProxyType) -> Vec<String> {
    let mut seen = HashSet::new();
    IP_PORT_REGEX
        .captures_iter(content)
        .filter_map(|cap| {
            let ip: Ipv4Addr = cap.get(1)?.as_str().parse().ok()?;
            let port: u16 = cap.get(2)?.as_str().parse().ok()?;
            if port == 0 {
                return None;
            }
            Some(format!("{}://{}:{}", proxy_type, ip, port))
        })
        .filter(|uri| seen.insert(uri.clone()))
        .collect()
}

/// Polls a set of plain-text proxy lists
pub struct TxtListSource {
    client: Client,
    lists: Vec<ListSource>,
}

impl TxtListSource {
    pub fn new(lists: Vec<ListSource>) -> Result<Self> {
        Self::with_config(lists, CrawlerConfig::default())
    }

    pub fn with_config(lists: Vec<ListSource>, config: CrawlerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;
        Ok(Self { client, lists })
    }

    /// Widely mirrored public lists
    pub fn common_lists() -> Vec<ListSource> {
        vec![
            ListSource::new(
                "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt",
                ProxyType::Http,
            ),
            ListSource::new(
                "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/socks4.txt",
                ProxyType::Socks4,
            ),
            ListSource::new(
                "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/socks5.txt",
                ProxyType::Socks5,
            ),
            ListSource::new(
                "https://raw.githubusercontent.com/monosans/proxy-list/main/proxies/http.txt",
                ProxyType::Http,
            ),
            ListSource::new(
                "https://raw.githubusercontent.com/monosans/proxy-list/main/proxies/socks5.txt",
                ProxyType::Socks5,
            ),
            ListSource::new("https://free-proxy-list.net/", ProxyType::Http),
            ListSource::new("https://www.socks-proxy.net/", ProxyType::Socks4),
        ]
    }
}

async fn fetch_list(client: &Client, list: &ListSource) -> Result<Vec<String>> {
    let response = client.get(&list.url).send().await?.error_for_status()?;
    let content = response.text().await?;
    Ok(extract_uris(&content, list.proxy_type))
}

#[async_trait]
impl Source for TxtListSource {
    fn label(&self) -> &str {
        "TxtLists"
    }

    fn scan_interval(&self) -> u64 {
        TXT_LIST_SCAN_INTERVAL_MINUTES
    }

    async fn gather(&self) -> Result<Vec<String>> {
        let results: Vec<(String, Result<Vec<String>>)> = stream::iter(self.lists.clone())
            .map(|list| {
                let client = self.client.clone();
                async move {
                    let found = fetch_list(&client, &list).await;
                    (list.url, found)
                }
            })
            .buffer_unordered(MAX_CONCURRENT_LISTS)
            .collect()
            .await;

        let mut seen = HashSet::new();
        let mut uris = Vec::new();
        let mut failures = 0;
        for (url, result) in results {
            match result {
                Ok(found) => {
                    debug!("{} yielded {} candidates", url, found.len());
                    uris.extend(found.into_iter().filter(|u| seen.insert(u.clone())));
                }
                Err(e) => {
                    warn!("Could not download proxy list {}: {:#}", url, e);
                    failures += 1;
                }
            }
        }

        if failures > 0 && failures == self.lists.len() {
            anyhow::bail!("all {} proxy lists failed to download", failures);
        }
        Ok(uris)
    }
}

/// A fixed set of candidates, e.g. seeded from a file
pub struct StaticSource {
    label: String,
    interval: u64,
    uris: Vec<String>,
}

impl StaticSource {
    pub fn new(label: &str, interval: u64, uris: Vec<String>) -> Self {
        Self {
            label: label.to_string(),
            interval,
            uris,
        }
    }

    /// Read candidates from a proxy list file; bare `IP:PORT` lines get `default_type`
    pub fn from_file<P: AsRef<Path>>(path: P, interval: u64, default_type: ProxyType) -> Result<Self> {
        let label = path.as_ref().display().to_string();
        let uris = ProxyParser::parse_file(path, default_type)?;
        Ok(Self::new(&label, interval, uris))
    }
}

#[async_trait]
impl Source for StaticSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn scan_interval(&self) -> u64 {
        self.interval
    }

    async fn gather(&self) -> Result<Vec<String>> {
        Ok(self.uris.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_crawler_config_builder() {
        let config = CrawlerConfig::new()
            .with_timeout(Duration::from_secs(60))
            .with_user_agent("Custom Agent".to_string());

        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.user_agent, "Custom Agent");
    }

    #[test]
    fn test_extract_uris_simple_list() {
        let content = "192.168.1.1:8080\n192.168.1.2:3128\n# comment\n10.0.0.1:1080\n";
        let uris = extract_uris(content, ProxyType::Socks5);
        assert_eq!(
            uris,
            vec![
                "socks5://192.168.1.1:8080",
                "socks5://192.168.1.2:3128",
                "socks5://10.0.0.1:1080"
            ]
        );
    }

    #[test]
    fn test_extract_uris_from_html_like_content() {
        let content = r#"
<table><tr><td>192.168.1.1</td><td>8080</td></tr></table>
Some text with 10.0.0.1:3128 embedded
"#;
        let uris = extract_uris(content, ProxyType::Http);
        assert_eq!(uris, vec!["http://10.0.0.1:3128"]);
    }

    #[test]
    fn test_extract_uris_deduplicates_and_validates() {
        let content = "1.1.1.1:80\n1.1.1.1:80\n999.999.999.999:8080\n192.168.1.1:0\n";
        let uris = extract_uris(content, ProxyType::Http);
        assert_eq!(uris, vec!["http://1.1.1.1:80"]);
    }

    #[test]
    fn test_common_lists() {
        let lists = TxtListSource::common_lists();
        assert!(!lists.is_empty());
        assert!(lists.iter().all(|l| l.url.starts_with("https://")));
    }

    #[tokio::test]
    async fn test_txt_source_fails_when_every_list_fails() {
        let config = CrawlerConfig::new().with_timeout(Duration::from_secs(2));
        let source = TxtListSource::with_config(
            vec![ListSource::new("http://127.0.0.1:9/list.txt", ProxyType::Http)],
            config,
        )
        .unwrap();
        assert_eq!(source.label(), "TxtLists");
        assert_eq!(source.scan_interval(), 720);
        assert!(source.gather().await.is_err());
    }

    #[tokio::test]
    async fn test_static_source_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# seeds\n1.2.3.4:8080\nsocks5://5.6.7.8:1080").unwrap();

        let source = StaticSource::from_file(file.path(), 30, ProxyType::Http).unwrap();
        assert_eq!(source.scan_interval(), 30);
        assert_eq!(
            source.gather().await.unwrap(),
            vec!["http://1.2.3.4:8080", "socks5://5.6.7.8:1080"]
        );
    }
}
