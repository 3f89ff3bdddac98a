//! In-crate fakes for the network collaborators, used by unit tests

use crate::error::{ErrorKind, ProbeError};
use crate::proxy::checker::{CheckerConfig, ProbeResponse, ProbeTransport, ProxyChecker};
use crate::proxy::crawler::Source;
use crate::proxy::geo::LocationProvider;
use crate::proxy::models::{Location, Proxy};
use crate::scanner::blacklist::Blacklist;
use crate::scanner::queue::CheckQueue;
use crate::scanner::reliability::ReliabilityScorer;
use crate::scanner::settings::ScannerSettings;
use crate::scanner::stats::ScanCounters;
use crate::scanner::worker::ScanContext;
use crate::store::MemoryStore;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ECHO_URL: &str = "http://echo.test/anything";
pub const OWN_IP: &str = "203.0.113.7";
/// Nothing listens on the discard port
pub const UNREACHABLE_PREFIX: &str = "http://127.0.0.1:9/";

/// Echo endpoint body as httpbin would return it
pub fn echo_body(origin: &str, headers: &[(&str, &str)]) -> String {
    let headers: HashMap<&str, &str> = headers.iter().cloned().collect();
    serde_json::json!({ "origin": origin, "headers": headers }).to_string()
}

#[derive(Debug, Clone)]
pub enum Route {
    Respond {
        status: u16,
        body: String,
        elapsed: Duration,
        delay: Duration,
    },
    Fail(ErrorKind),
    Panic,
}

impl Route {
    pub fn ok(body: String) -> Self {
        Self::ok_in(body, 100)
    }

    /// Successful response reporting `elapsed_ms` of probe time
    pub fn ok_in(body: String, elapsed_ms: u64) -> Self {
        Route::Respond {
            status: 200,
            body,
            elapsed: Duration::from_millis(elapsed_ms),
            delay: Duration::ZERO,
        }
    }

    /// Successful response that takes `delay` of real time to arrive
    pub fn slow(body: String, delay: Duration) -> Self {
        Route::Respond {
            status: 200,
            body,
            elapsed: delay,
            delay,
        }
    }

    pub fn fail(kind: ErrorKind) -> Self {
        Route::Fail(kind)
    }
}

/// Transport answering from a URL-keyed script; unknown URLs fail to connect
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, usize>>,
    completed: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, url: &str, route: Route) {
        self.routes.lock().insert(url.to_string(), route);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    /// Probes that ran to completion
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeTransport for ScriptedTransport {
    async fn get(
        &self,
        _proxy: &Proxy,
        url: &str,
        _timeout: Duration,
        _read_body: bool,
    ) -> std::result::Result<ProbeResponse, ProbeError> {
        *self.calls.lock().entry(url.to_string()).or_default() += 1;
        let route = self.routes.lock().get(url).cloned();

        let outcome = match route {
            Some(Route::Respond {
                status,
                body,
                elapsed,
                delay,
            }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(ProbeResponse {
                    status,
                    headers: vec![("content-type".to_string(), "application/json".to_string())],
                    body,
                    elapsed,
                })
            }
            Some(Route::Fail(kind)) => Err(ProbeError::new(kind, "scripted failure")),
            Some(Route::Panic) => panic!("scripted panic"),
            None => Err(ProbeError::new(ErrorKind::ConnectionError, "no route")),
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        outcome
    }
}

/// Source returning a fixed batch, or failing when `fail` is set
pub struct FakeSource {
    pub label: String,
    pub interval: u64,
    pub uris: Vec<String>,
    pub fail: bool,
    /// How long each gather takes
    pub delay: Duration,
    pub gathered: AtomicUsize,
}

impl FakeSource {
    pub fn new(label: &str, interval: u64, uris: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            interval,
            uris: uris.iter().map(|u| u.to_string()).collect(),
            fail: false,
            delay: Duration::ZERO,
            gathered: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(label: &str, interval: u64) -> Self {
        Self {
            fail: true,
            ..Self::new(label, interval, &[])
        }
    }

    pub fn gather_count(&self) -> usize {
        self.gathered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for FakeSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn scan_interval(&self) -> u64 {
        self.interval
    }

    async fn gather(&self) -> Result<Vec<String>> {
        self.gathered.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            anyhow::bail!("source {} is down", self.label);
        }
        Ok(self.uris.clone())
    }
}

/// Locator that places every IP in the same city
pub struct FixedLocator(pub Location);

impl LocationProvider for FixedLocator {
    fn get_info(&self, _ip: IpAddr) -> Option<Location> {
        Some(self.0.clone())
    }
}

/// Settings with no destination sweep, so only the echo probe decides liveness
pub fn echo_only_settings() -> ScannerSettings {
    ScannerSettings {
        websites: Vec::new(),
        blacklist_files: Vec::new(),
        ..Default::default()
    }
}

/// Worker context over a scripted transport with empty blacklists
pub fn scan_context(
    transport: Arc<ScriptedTransport>,
    store: Arc<MemoryStore>,
    locator: Arc<dyn LocationProvider>,
) -> Arc<ScanContext> {
    let config = CheckerConfig::new(OWN_IP).with_echo_url(ECHO_URL.to_string());
    let cache_dir = std::env::temp_dir().join("proxy-scanner-unused-cache");
    Arc::new(ScanContext {
        settings: Arc::new(RwLock::new(echo_only_settings())),
        counters: Arc::new(ScanCounters::new()),
        queue: CheckQueue::new(),
        blacklist: Arc::new(
            Blacklist::new(UNREACHABLE_PREFIX, cache_dir, Vec::new()).expect("blacklist client"),
        ),
        checker: ProxyChecker::new(config, transport, store.clone()),
        scorer: ReliabilityScorer::new(store.clone()),
        store,
        locator,
        in_flight: DashSet::new(),
        idle_wait: Duration::from_millis(50),
    })
}
