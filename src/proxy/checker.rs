//! Proxy checker: liveness, anonymity and destination reachability
//!
//! A check first fetches a header-echo endpoint through the proxy, classifies
//! anonymity from what the endpoint saw, then probes each configured website.
//! Every attempt is appended to the ping log. `ProxyChecker::check` is total:
//! any failure, including a panic inside a probe, is reported as `Dead`.

use crate::error::{ErrorKind, ProbeError, ScannerError};
use crate::proxy::models::{Anonymity, CheckOutcome, HistoricalPing, Proxy, ValidationResult};
use crate::proxy::parser::ProxyParser;
use crate::scanner::settings::WebsiteCheck;
use crate::store::PingLog;
use async_trait::async_trait;
use futures::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Proxy as ReqwestProxy};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Default header-echo endpoint
pub const DEFAULT_ECHO_URL: &str = "https://httpbin.org/anything";

/// Default endpoint answering with the caller's public IP
pub const DEFAULT_PUBLIC_IP_URL: &str = "https://api.ipify.org/";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^((?:\d{1,3}\.){3}\d{1,3}):(\d{1,5})$").expect("Invalid IP:PORT regex")
});

/// What came back from one request made through a proxy
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Time until response headers arrived
    pub elapsed: Duration,
}

impl ProbeResponse {
    pub fn raw_headers(&self) -> String {
        self.headers
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// A destination counts as reachable unless the proxy itself refused or failed
    fn reached_destination(&self) -> bool {
        self.status < 500 && self.status != 407
    }
}

/// Issues single GET requests through a proxy
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn get(
        &self,
        proxy: &Proxy,
        url: &str,
        timeout: Duration,
        read_body: bool,
    ) -> Result<ProbeResponse, ProbeError>;
}

/// `ProbeTransport` backed by reqwest, one client per probe
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport;

impl ReqwestTransport {
    pub fn new() -> Self {
        Self
    }

    fn create_client(&self, proxy: &Proxy, timeout: Duration) -> Result<Client, ProbeError> {
        let reqwest_proxy = ReqwestProxy::all(proxy.url())
            .map_err(|e| ProbeError::new(ErrorKind::ProxyError, e.to_string()))?;

        Client::builder()
            .proxy(reqwest_proxy)
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProbeError::new(ErrorKind::Unknown, e.to_string()))
    }
}

#[async_trait]
impl ProbeTransport for ReqwestTransport {
    async fn get(
        &self,
        proxy: &Proxy,
        url: &str,
        timeout: Duration,
        read_body: bool,
    ) -> Result<ProbeResponse, ProbeError> {
        let client = self.create_client(proxy, timeout)?;
        let start = Instant::now();

        let response = match tokio::time::timeout(timeout, client.get(url).send()).await {
            Ok(result) => result?,
            Err(_) => return Err(ProbeError::new(ErrorKind::Timeout, "request timed out")),
        };
        let elapsed = start.elapsed();
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();

        let body = if read_body {
            let remaining = timeout.saturating_sub(elapsed);
            match tokio::time::timeout(remaining, response.text()).await {
                Ok(text) => text?,
                Err(_) => return Err(ProbeError::new(ErrorKind::Timeout, "body read timed out")),
            }
        } else {
            String::new()
        };

        Ok(ProbeResponse {
            status,
            headers,
            body,
            elapsed,
        })
    }
}

/// Ask a public-IP endpoint which address this host appears as
pub async fn detect_public_ip(url: &str) -> Result<String, ScannerError> {
    let client = Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ScannerError::PublicIp(e.to_string()))?;
    let text = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| ScannerError::PublicIp(e.to_string()))?
        .text()
        .await
        .map_err(|e| ScannerError::PublicIp(e.to_string()))?;

    parse_public_ip(&text)
}

/// Normalize a public IP given by an endpoint or by the user
///
/// Anonymity classification matches this address inside echoed headers, so
/// anything that is not a literal IP is refused.
pub fn parse_public_ip(text: &str) -> Result<String, ScannerError> {
    let ip = text.trim();
    let parsed: IpAddr = ip
        .parse()
        .map_err(|_| ScannerError::PublicIp(format!("not an IP address: {:?}", ip)))?;
    Ok(parsed.to_string())
}

/// Body of the header-echo endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EchoResponse {
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl EchoResponse {
    pub fn parse(body: &str) -> Result<Self, ProbeError> {
        serde_json::from_str(body)
            .map_err(|e| ProbeError::new(ErrorKind::MalformedResponse, e.to_string()))
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Decide how much of the checker's identity leaked through the proxy
pub fn classify_anonymity(echo: &EchoResponse, own_ip: &str) -> Anonymity {
    if echo.origin.contains(own_ip) {
        return Anonymity::None;
    }

    if let Some(forwarded_for) = echo.header("X-Forwarded-For") {
        if forwarded_for.contains(own_ip) {
            return Anonymity::None;
        }
        let foreign_ip_port = IP_PORT_REGEX
            .captures(forwarded_for.trim())
            .is_some_and(|caps| &caps[1] != own_ip);
        if foreign_ip_port {
            return Anonymity::Medium;
        }
        return Anonymity::Low;
    }

    let reveals_proxy = ["Forwarded", "X-Forwarded-Host", "X-Forwarded-Proto", "Via"]
        .iter()
        .any(|h| echo.header(h).is_some());
    if reveals_proxy {
        return Anonymity::Medium;
    }

    Anonymity::High
}

/// Configuration for proxy checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Header-echo endpoint used for the primary probe
    pub echo_url: String,
    /// This host's public IP as seen from the internet
    pub public_ip: String,
}

impl CheckerConfig {
    pub fn new(public_ip: impl Into<String>) -> Self {
        Self {
            echo_url: DEFAULT_ECHO_URL.to_string(),
            public_ip: public_ip.into(),
        }
    }

    pub fn with_echo_url(mut self, url: String) -> Self {
        self.echo_url = url;
        self
    }
}

/// Proxy checker for validating proxies
#[derive(Clone)]
pub struct ProxyChecker {
    config: CheckerConfig,
    transport: Arc<dyn ProbeTransport>,
    pings: Arc<dyn PingLog>,
}

impl ProxyChecker {
    pub fn new(
        config: CheckerConfig,
        transport: Arc<dyn ProbeTransport>,
        pings: Arc<dyn PingLog>,
    ) -> Self {
        Self {
            config,
            transport,
            pings,
        }
    }

    /// Check one proxy URI; never fails, every attempt is logged
    pub async fn check(
        &self,
        uri: &str,
        websites: &[WebsiteCheck],
        timeout: Duration,
    ) -> CheckOutcome {
        let attempt = AssertUnwindSafe(self.probe_all(uri, websites, timeout))
            .catch_unwind()
            .await;

        match attempt {
            Ok(Ok((result, raw_headers))) => {
                debug!("{} alive, {:.3}s, anonymity {}", uri, result.speed, result.anonymity);
                self.log_ping(HistoricalPing::success(uri, raw_headers, result.speed))
                    .await;
                CheckOutcome::Alive(result)
            }
            Ok(Err(e)) => {
                debug!("{} dead: {}", uri, e);
                self.log_ping(HistoricalPing::failure(uri, e.kind)).await;
                CheckOutcome::Dead(e.kind)
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!("Unknown error occurred while checking {}: {}", uri, reason);
                self.log_ping(HistoricalPing::failure(uri, ErrorKind::Unknown))
                    .await;
                CheckOutcome::Dead(ErrorKind::Unknown)
            }
        }
    }

    async fn probe_all(
        &self,
        uri: &str,
        websites: &[WebsiteCheck],
        timeout: Duration,
    ) -> Result<(ValidationResult, String), ProbeError> {
        let proxy = ProxyParser::parse_uri(uri)
            .ok_or_else(|| ProbeError::new(ErrorKind::ProxyError, "unparseable proxy URI"))?;

        let response = self
            .transport
            .get(&proxy, &self.config.echo_url, timeout, true)
            .await?;
        if !(200..300).contains(&response.status) {
            return Err(ProbeError::new(
                ErrorKind::ProxyError,
                format!("echo endpoint answered {}", response.status),
            ));
        }
        let echo = EchoResponse::parse(&response.body)?;
        let anonymity = classify_anonymity(&echo, &self.config.public_ip);

        let mut samples = vec![response.elapsed.as_secs_f64()];
        let mut accessible = Vec::new();
        let mut inaccessible = Vec::new();

        for site in websites {
            let reached = match self.transport.get(&proxy, &site.url, site.timeout(), false).await {
                Ok(r) if r.reached_destination() => Some(r.elapsed),
                Ok(r) => {
                    debug!("{} via {} answered {}", site.url, uri, r.status);
                    None
                }
                Err(e) => {
                    debug!("{} via {} failed: {}", site.url, uri, e);
                    None
                }
            };

            match reached {
                Some(elapsed) => {
                    accessible.push(site.url.clone());
                    samples.push(elapsed.as_secs_f64());
                }
                None => {
                    inaccessible.push(site.url.clone());
                    if site.mark_dead_on_fail {
                        return Err(ProbeError::new(
                            ErrorKind::CriticalDestinationFailure,
                            format!("{} unreachable", site.url),
                        ));
                    }
                }
            }
        }

        let speed = samples.iter().sum::<f64>() / samples.len() as f64;
        let result = ValidationResult {
            speed,
            anonymity,
            accessible,
            inaccessible,
        };
        Ok((result, response.raw_headers()))
    }

    async fn log_ping(&self, ping: HistoricalPing) {
        if let Err(e) = self.pings.save(&ping).await {
            warn!("Could not record ping for {}: {:#}", ping.uri, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{echo_body, Route, ScriptedTransport};

    const OWN_IP: &str = "203.0.113.7";
    const ECHO: &str = "http://echo.test/anything";
    const URI: &str = "http://198.51.100.20:8080";

    fn echo(origin: &str, headers: &[(&str, &str)]) -> EchoResponse {
        EchoResponse {
            origin: origin.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn checker(transport: Arc<ScriptedTransport>) -> (ProxyChecker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = CheckerConfig::new(OWN_IP).with_echo_url(ECHO.to_string());
        (ProxyChecker::new(config, transport, store.clone()), store)
    }

    #[test]
    fn test_origin_with_own_ip_is_transparent() {
        let e = echo("203.0.113.7, 198.51.100.20", &[]);
        assert_eq!(classify_anonymity(&e, OWN_IP), Anonymity::None);
    }

    #[test]
    fn test_forwarded_for_with_own_ip_is_transparent() {
        let e = echo("198.51.100.20", &[("X-Forwarded-For", "203.0.113.7")]);
        assert_eq!(classify_anonymity(&e, OWN_IP), Anonymity::None);
    }

    #[test]
    fn test_forwarded_for_foreign_ip_port_is_medium() {
        let e = echo("198.51.100.20", &[("X-Forwarded-For", "10.9.8.7:4321")]);
        assert_eq!(classify_anonymity(&e, OWN_IP), Anonymity::Medium);
    }

    #[test]
    fn test_forwarded_for_other_form_is_low() {
        let e = echo("198.51.100.20", &[("x-forwarded-for", "unknown")]);
        assert_eq!(classify_anonymity(&e, OWN_IP), Anonymity::Low);

        let bare_ip = echo("198.51.100.20", &[("X-Forwarded-For", "10.9.8.7")]);
        assert_eq!(classify_anonymity(&bare_ip, OWN_IP), Anonymity::Low);
    }

    #[test]
    fn test_forwarded_for_takes_precedence_over_via() {
        let e = echo(
            "198.51.100.20",
            &[("X-Forwarded-For", "garbage"), ("Via", "1.1 squid")],
        );
        assert_eq!(classify_anonymity(&e, OWN_IP), Anonymity::Low);
    }

    #[test]
    fn test_only_via_is_medium() {
        let e = echo("198.51.100.20", &[("Via", "1.1 squid")]);
        assert_eq!(classify_anonymity(&e, OWN_IP), Anonymity::Medium);
        let fwd = echo("198.51.100.20", &[("X-Forwarded-Proto", "https")]);
        assert_eq!(classify_anonymity(&fwd, OWN_IP), Anonymity::Medium);
    }

    #[test]
    fn test_no_forwarding_headers_is_high() {
        let e = echo("198.51.100.20", &[("Accept", "*/*"), ("Host", "httpbin.org")]);
        assert_eq!(classify_anonymity(&e, OWN_IP), Anonymity::High);
    }

    #[test]
    fn test_parse_public_ip() {
        assert_eq!(parse_public_ip(" 203.0.113.7\n").unwrap(), "203.0.113.7");
        assert_eq!(parse_public_ip("2001:db8::1").unwrap(), "2001:db8::1");
        assert!(matches!(parse_public_ip(""), Err(ScannerError::PublicIp(_))));
        assert!(matches!(parse_public_ip("   "), Err(ScannerError::PublicIp(_))));
        assert!(matches!(parse_public_ip("<html>"), Err(ScannerError::PublicIp(_))));
    }

    #[test]
    fn test_echo_parse_rejects_non_json() {
        let err = EchoResponse::parse("<html>blocked</html>").unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn test_alive_with_non_critical_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(ECHO, Route::ok_in(echo_body("198.51.100.20", &[]), 200));
        transport.route("https://critical.test", Route::ok_in(String::new(), 400));
        transport.route("https://optional.test", Route::fail(ErrorKind::Timeout));

        let (checker, store) = checker(transport);
        let websites = vec![
            WebsiteCheck::new("https://critical.test", 5, true),
            WebsiteCheck::new("https://optional.test", 5, false),
        ];
        let outcome = checker.check(URI, &websites, Duration::from_secs(5)).await;

        let CheckOutcome::Alive(result) = outcome else {
            panic!("expected alive, got {:?}", outcome);
        };
        assert_eq!(result.anonymity, Anonymity::High);
        assert_eq!(result.accessible, vec!["https://critical.test"]);
        assert_eq!(result.inaccessible, vec!["https://optional.test"]);
        assert!((result.speed - 0.3).abs() < 1e-9);

        let pings = store.find_by_uri(URI).await.unwrap();
        assert_eq!(pings.len(), 1);
        assert!(pings[0].is_success());
        assert!(pings[0].raw_headers.contains("content-type: application/json"));
    }

    #[tokio::test]
    async fn test_critical_destination_failure_is_dead() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(ECHO, Route::ok(echo_body("198.51.100.20", &[])));
        transport.route("https://critical.test", Route::fail(ErrorKind::ConnectionError));
        transport.route("https://after.test", Route::ok(String::new()));

        let (checker, store) = checker(Arc::clone(&transport));
        let websites = vec![
            WebsiteCheck::new("https://critical.test", 5, true),
            WebsiteCheck::new("https://after.test", 5, false),
        ];
        let outcome = checker.check(URI, &websites, Duration::from_secs(5)).await;

        assert_eq!(outcome, CheckOutcome::Dead(ErrorKind::CriticalDestinationFailure));
        // sweep stops at the critical failure
        assert_eq!(transport.calls("https://after.test"), 0);
        let pings = store.find_by_uri(URI).await.unwrap();
        assert_eq!(pings[0].error_type, "critical-destination-failure");
        assert_eq!(pings[0].speed, 0.0);
    }

    #[tokio::test]
    async fn test_primary_probe_failures_are_classified() {
        for kind in [ErrorKind::Timeout, ErrorKind::ProxyError, ErrorKind::ConnectionError] {
            let transport = Arc::new(ScriptedTransport::new());
            transport.route(ECHO, Route::fail(kind));
            let (checker, store) = checker(transport);

            let outcome = checker.check(URI, &[], Duration::from_secs(1)).await;
            assert_eq!(outcome, CheckOutcome::Dead(kind));
            assert_eq!(store.find_by_uri(URI).await.unwrap()[0].error_type, kind.as_str());
        }
    }

    #[tokio::test]
    async fn test_malformed_echo_is_dead() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(ECHO, Route::ok("not json".to_string()));
        let (checker, _) = checker(transport);

        let outcome = checker.check(URI, &[], Duration::from_secs(1)).await;
        assert_eq!(outcome, CheckOutcome::Dead(ErrorKind::MalformedResponse));
    }

    #[tokio::test]
    async fn test_panicking_transport_is_unknown() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(ECHO, Route::Panic);
        let (checker, store) = checker(transport);

        let outcome = checker.check(URI, &[], Duration::from_secs(1)).await;
        assert_eq!(outcome, CheckOutcome::Dead(ErrorKind::Unknown));
        assert_eq!(store.find_by_uri(URI).await.unwrap()[0].error_type, "unknown");
    }

    #[tokio::test]
    async fn test_unparseable_uri_is_dead() {
        let transport = Arc::new(ScriptedTransport::new());
        let (checker, _) = checker(transport);
        let outcome = checker.check("not-a-proxy", &[], Duration::from_secs(1)).await;
        assert_eq!(outcome, CheckOutcome::Dead(ErrorKind::ProxyError));
    }
}
