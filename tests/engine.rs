//! Discovery, validation and recheck through the public scanner API

use async_trait::async_trait;
use proxy_scanner::proxy::checker::ProbeResponse;
use proxy_scanner::{
    Anonymity, Database, ErrorKind, PingLog, ProbeError, ProbeTransport, Proxy, ProxyFilter,
    ProxyStore, Scanner, ScannerConfig, ScannerSettings, ScannerState, SettingsStore,
    StaticSource, WebsiteCheck,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ECHO_URL: &str = "http://echo.test/anything";
const DESTINATION: &str = "http://destination.test/";
const OWN_IP: &str = "203.0.113.7";
const PROXY_URI: &str = "http://198.51.100.7:3128";

/// Every probe succeeds while `alive` is set and times out otherwise
struct SwitchableTransport {
    alive: AtomicBool,
}

#[async_trait]
impl ProbeTransport for SwitchableTransport {
    async fn get(
        &self,
        _proxy: &Proxy,
        url: &str,
        _timeout: Duration,
        _read_body: bool,
    ) -> Result<ProbeResponse, ProbeError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ProbeError::new(ErrorKind::Timeout, "proxy went away"));
        }
        let body = if url == ECHO_URL {
            serde_json::json!({ "origin": "198.51.100.7", "headers": {} }).to_string()
        } else {
            String::new()
        };
        Ok(ProbeResponse {
            status: 200,
            headers: vec![("server".to_string(), "fake".to_string())],
            body,
            elapsed: Duration::from_millis(120),
        })
    }
}

fn settings(blacklists: &[&str]) -> ScannerSettings {
    ScannerSettings {
        num_scan_threads: 4,
        alive_check_interval_minutes: 15,
        dead_check_interval_minutes: 600,
        blacklist_files: blacklists.iter().map(|b| b.to_string()).collect(),
        websites: vec![WebsiteCheck::new(DESTINATION, 5, true)],
        ..Default::default()
    }
}

fn config(cache_dir: &Path) -> ScannerConfig {
    ScannerConfig::new()
        .with_echo_url(ECHO_URL.to_string())
        .with_public_ip(OWN_IP.to_string())
        .with_blacklist_prefix("http://127.0.0.1:9/".to_string())
        .with_cache_dir(cache_dir.to_path_buf())
        .with_tick(Duration::from_millis(100))
        .with_join_timeout(Duration::from_secs(5))
        .with_idle_wait(Duration::from_millis(50))
}

async fn wait_until<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_discovery_then_failed_recheck() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::memory().await.unwrap());
    SettingsStore::save(db.as_ref(), &settings(&[])).await.unwrap();

    let transport = Arc::new(SwitchableTransport {
        alive: AtomicBool::new(true),
    });
    let source = StaticSource::new("seed", 600, vec![PROXY_URI.to_string()]);
    let scanner = Scanner::builder(config(dir.path()))
        .store(db.clone())
        .source(Arc::new(source))
        .transport(transport.clone())
        .build()
        .unwrap();

    scanner.start().await.unwrap();
    assert_eq!(scanner.state(), ScannerState::Running);

    wait_until("discovery", || {
        let db = db.clone();
        async move {
            db.find_one_by(&ProxyFilter::by_uri(PROXY_URI))
                .await
                .unwrap()
                .is_some()
        }
    })
    .await;

    let pool = db.find_by(&ProxyFilter::new()).await.unwrap();
    assert_eq!(pool.len(), 1);
    let found = &pool[0];
    assert!(found.last_check_status);
    assert_eq!(found.reliability, 1.0);
    assert_eq!(found.anonymity, Anonymity::High);
    assert_eq!(found.accessible_websites, vec![DESTINATION]);
    assert!((found.speed - 0.12).abs() < 1e-9);

    // the next alive recheck finds the proxy down
    transport.alive.store(false, Ordering::SeqCst);
    wait_until("failed recheck", || {
        let db = db.clone();
        async move {
            let record = db.find_one_by(&ProxyFilter::by_uri(PROXY_URI)).await.unwrap();
            record.map_or(false, |r| !r.last_check_status)
        }
    })
    .await;

    let pool = db.find_by(&ProxyFilter::new()).await.unwrap();
    assert_eq!(pool.len(), 1);
    assert!(!pool[0].last_check_status);
    assert_eq!(pool[0].reliability, 0.5);

    let pings = db.find_by_uri(PROXY_URI).await.unwrap();
    assert_eq!(pings.len(), 2);
    assert_eq!(pings[1].error_type, "timeout");

    scanner.teardown().await;
    assert_eq!(scanner.state(), ScannerState::Stopped);
    let stats = scanner.get_statistics();
    assert_eq!(stats.active_workers, 0);
    assert_eq!(stats.check_queue_size, 0);
}

#[tokio::test]
async fn test_blacklisted_candidate_never_reaches_pool() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("local.netset"), "# local\n198.51.100.0/24\n").unwrap();

    let db = Arc::new(Database::memory().await.unwrap());
    SettingsStore::save(db.as_ref(), &settings(&["local.netset"]))
        .await
        .unwrap();

    let source = StaticSource::new(
        "seed",
        600,
        vec![PROXY_URI.to_string(), "socks5://192.0.2.10:1080".to_string()],
    );
    let scanner = Scanner::builder(config(dir.path()))
        .store(db.clone())
        .source(Arc::new(source))
        .transport(Arc::new(SwitchableTransport {
            alive: AtomicBool::new(true),
        }))
        .build()
        .unwrap();
    scanner.start().await.unwrap();

    wait_until("both candidates processed", || {
        let stats = scanner.get_statistics();
        async move { stats.blacklisted_ips + stats.non_blacklisted_ips >= 2 }
    })
    .await;
    wait_until("clean candidate recorded", || {
        let db = db.clone();
        async move { !db.find_by(&ProxyFilter::new()).await.unwrap().is_empty() }
    })
    .await;

    let stats = scanner.get_statistics();
    assert_eq!(stats.blacklisted_ips, 1);
    let pool = db.find_by(&ProxyFilter::new()).await.unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool[0].uri, "socks5://192.0.2.10:1080");
    assert!(db.find_by_uri(PROXY_URI).await.unwrap().is_empty());

    scanner.teardown().await;
}
