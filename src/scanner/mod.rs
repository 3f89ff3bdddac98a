//! The scanning engine
//!
//! `Scanner` owns the settings, statistics and lifecycle of every loop:
//! one scheduler per source, the recheck and blacklist-refresh schedulers,
//! and the pool of check workers draining the shared queue.
//!
//! ```text
//! Stopped -> Starting -> Running <-> Reconfiguring
//!                           |
//!                        Stopping -> Stopped
//! ```

pub mod blacklist;
pub mod queue;
pub mod reliability;
pub mod schedule;
pub mod settings;
pub mod stats;
pub mod worker;

use crate::error::ScannerError;
use crate::proxy::checker::{
    detect_public_ip, parse_public_ip, CheckerConfig, ProbeTransport, ProxyChecker, ReqwestTransport,
    DEFAULT_ECHO_URL, DEFAULT_PUBLIC_IP_URL,
};
use crate::proxy::crawler::Source;
use crate::proxy::geo::{LocationProvider, NoLocation};
use crate::store::{MemoryStore, PingLog, ProxyStore, SettingsStore};
use crate::Result;
use blacklist::{Blacklist, DEFAULT_BLOCKLIST_PREFIX};
use dashmap::DashSet;
use parking_lot::RwLock;
use queue::CheckQueue;
use reliability::ReliabilityScorer;
use serde::{Deserialize, Serialize};
use settings::{ScannerSettings, ScannerSettingsUpdate};
use stats::{ScanCounters, ScanningStatistics};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use worker::{ScanContext, WorkerPool};

/// Lifecycle state of the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerState {
    Stopped,
    Starting,
    Running,
    Reconfiguring,
    Stopping,
}

impl fmt::Display for ScannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScannerState::Stopped => "stopped",
            ScannerState::Starting => "starting",
            ScannerState::Running => "running",
            ScannerState::Reconfiguring => "reconfiguring",
            ScannerState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Process-level configuration, fixed for the lifetime of a `Scanner`
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Header-echo endpoint for the primary probe
    pub echo_url: String,
    /// Endpoint answering with this host's public IP
    pub public_ip_url: String,
    /// Skip detection and use this IP
    pub public_ip: Option<String>,
    pub blacklist_prefix: String,
    pub cache_dir: PathBuf,
    /// Scheduler resolution; intervals in settings count these
    pub tick: Duration,
    /// Upper bound on waiting for loops to exit at teardown
    pub join_timeout: Duration,
    pub idle_wait: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            echo_url: DEFAULT_ECHO_URL.to_string(),
            public_ip_url: DEFAULT_PUBLIC_IP_URL.to_string(),
            public_ip: None,
            blacklist_prefix: DEFAULT_BLOCKLIST_PREFIX.to_string(),
            cache_dir: PathBuf::from("cache/blacklists"),
            tick: Duration::from_secs(60),
            join_timeout: Duration::from_secs(10),
            idle_wait: Duration::from_secs(1),
        }
    }
}

impl ScannerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_echo_url(mut self, url: String) -> Self {
        self.echo_url = url;
        self
    }

    pub fn with_public_ip_url(mut self, url: String) -> Self {
        self.public_ip_url = url;
        self
    }

    pub fn with_public_ip(mut self, ip: String) -> Self {
        self.public_ip = Some(ip);
        self
    }

    pub fn with_blacklist_prefix(mut self, prefix: String) -> Self {
        self.blacklist_prefix = prefix;
        self
    }

    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = dir;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }
}

/// Assembles a `Scanner` from its collaborators; anything unset falls back
/// to an in-memory store, the reqwest transport and no geolocation
pub struct ScannerBuilder {
    config: ScannerConfig,
    proxies: Option<Arc<dyn ProxyStore>>,
    pings: Option<Arc<dyn PingLog>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    sources: Vec<Arc<dyn Source>>,
    transport: Option<Arc<dyn ProbeTransport>>,
    locator: Option<Arc<dyn LocationProvider>>,
}

impl ScannerBuilder {
    /// Use one backend for proxies, pings and settings
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: ProxyStore + PingLog + SettingsStore + 'static,
    {
        self.proxies = Some(store.clone() as Arc<dyn ProxyStore>);
        self.pings = Some(store.clone() as Arc<dyn PingLog>);
        self.settings_store = Some(store as Arc<dyn SettingsStore>);
        self
    }

    pub fn proxy_store(mut self, store: Arc<dyn ProxyStore>) -> Self {
        self.proxies = Some(store);
        self
    }

    pub fn ping_log(mut self, log: Arc<dyn PingLog>) -> Self {
        self.pings = Some(log);
        self
    }

    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    pub fn source(mut self, source: Arc<dyn Source>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ProbeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn locator(mut self, locator: Arc<dyn LocationProvider>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn build(self) -> Result<Scanner> {
        let memory = Arc::new(MemoryStore::new());
        let blacklist = Blacklist::new(
            &self.config.blacklist_prefix,
            self.config.cache_dir.clone(),
            Vec::new(),
        )?;

        Ok(Scanner {
            proxies: self
                .proxies
                .unwrap_or_else(|| memory.clone() as Arc<dyn ProxyStore>),
            pings: self
                .pings
                .unwrap_or_else(|| memory.clone() as Arc<dyn PingLog>),
            settings_store: self
                .settings_store
                .unwrap_or_else(|| memory as Arc<dyn SettingsStore>),
            sources: self.sources,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(ReqwestTransport::new()) as Arc<dyn ProbeTransport>),
            locator: self
                .locator
                .unwrap_or_else(|| Arc::new(NoLocation) as Arc<dyn LocationProvider>),
            settings: Arc::new(RwLock::new(ScannerSettings::default())),
            counters: Arc::new(ScanCounters::new()),
            queue: CheckQueue::new(),
            blacklist: Arc::new(blacklist),
            state: RwLock::new(ScannerState::Stopped),
            control: Mutex::new(None),
            config: self.config,
        })
    }
}

/// Handles of a started engine
struct Running {
    pool: WorkerPool,
    stop: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

pub struct Scanner {
    config: ScannerConfig,
    proxies: Arc<dyn ProxyStore>,
    pings: Arc<dyn PingLog>,
    settings_store: Arc<dyn SettingsStore>,
    sources: Vec<Arc<dyn Source>>,
    transport: Arc<dyn ProbeTransport>,
    locator: Arc<dyn LocationProvider>,
    settings: Arc<RwLock<ScannerSettings>>,
    counters: Arc<ScanCounters>,
    queue: CheckQueue,
    blacklist: Arc<Blacklist>,
    state: RwLock<ScannerState>,
    /// Serializes lifecycle operations; holds the running engine
    control: Mutex<Option<Running>>,
}

impl Scanner {
    pub fn builder(config: ScannerConfig) -> ScannerBuilder {
        ScannerBuilder {
            config,
            proxies: None,
            pings: None,
            settings_store: None,
            sources: Vec::new(),
            transport: None,
            locator: None,
        }
    }

    pub fn state(&self) -> ScannerState {
        *self.state.read()
    }

    fn set_state(&self, state: ScannerState) {
        *self.state.write() = state;
    }

    /// Settings currently in effect
    pub fn settings(&self) -> ScannerSettings {
        self.settings.read().clone()
    }

    pub fn get_statistics(&self) -> ScanningStatistics {
        self.counters.snapshot(self.queue.len())
    }

    pub fn get_available_blacklist_names(&self) -> Vec<String> {
        self.blacklist.available_names()
    }

    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    pub fn proxies(&self) -> &Arc<dyn ProxyStore> {
        &self.proxies
    }

    /// Load settings, load the blacklist and launch every loop
    pub async fn start(&self) -> std::result::Result<(), ScannerError> {
        let mut control = self.control.lock().await;
        let state = self.state();
        if state != ScannerState::Stopped {
            return Err(ScannerError::InvalidState {
                action: "start",
                state,
            });
        }

        self.set_state(ScannerState::Starting);
        match self.launch().await {
            Ok(running) => {
                *control = Some(running);
                self.set_state(ScannerState::Running);
                info!("Scanner running");
                Ok(())
            }
            Err(e) => {
                self.set_state(ScannerState::Stopped);
                error!("Scanner failed to start: {}", e);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> std::result::Result<Running, ScannerError> {
        let settings = match self.settings_store.load().await? {
            Some(settings) => settings,
            None => {
                let defaults = ScannerSettings::default();
                self.settings_store.save(&defaults).await?;
                defaults
            }
        };
        settings.validate()?;
        *self.settings.write() = settings.clone();

        let public_ip = match &self.config.public_ip {
            Some(ip) => parse_public_ip(ip)?,
            None => detect_public_ip(&self.config.public_ip_url).await?,
        };
        info!("Checking proxies as {}", public_ip);

        let checker_config = CheckerConfig::new(public_ip).with_echo_url(self.config.echo_url.clone());
        let checker = ProxyChecker::new(checker_config, self.transport.clone(), self.pings.clone());

        self.blacklist
            .set_blocklist(settings.blacklist_files.clone())
            .await;

        let ctx = Arc::new(ScanContext {
            settings: self.settings.clone(),
            counters: self.counters.clone(),
            queue: self.queue.clone(),
            blacklist: self.blacklist.clone(),
            checker,
            scorer: ReliabilityScorer::new(self.pings.clone()),
            store: self.proxies.clone(),
            locator: self.locator.clone(),
            in_flight: DashSet::new(),
            idle_wait: self.config.idle_wait,
        });

        let (stop, stop_rx) = watch::channel(false);
        let tick = self.config.tick;
        let mut loops = Vec::with_capacity(self.sources.len() + 2);
        for source in &self.sources {
            info!("Scheduling {} every {} minutes", source.label(), source.scan_interval());
            loops.push(schedule::spawn_source_loop(
                ctx.clone(),
                source.clone(),
                tick,
                stop_rx.clone(),
            ));
        }

        let mut pool = WorkerPool::new(ctx.clone());
        pool.resize(settings.num_scan_threads, self.config.join_timeout)
            .await;

        loops.push(schedule::spawn_recheck_loop(ctx.clone(), tick, stop_rx.clone()));
        loops.push(schedule::spawn_blacklist_loop(ctx, tick, stop_rx));

        Ok(Running { pool, stop, loops })
    }

    /// Validate and apply a partial settings change
    ///
    /// A rejected update leaves the current settings in effect. Accepted
    /// settings are persisted; if the scanner is running the worker pool is
    /// resized and the blacklist reloaded as needed, everything else is picked
    /// up by the schedulers on their next tick.
    pub async fn hot_change_settings(
        &self,
        update: ScannerSettingsUpdate,
    ) -> std::result::Result<ScannerSettings, ScannerError> {
        let mut control = self.control.lock().await;
        let current = match control.as_ref() {
            Some(_) => self.settings(),
            None => self.settings_store.load().await?.unwrap_or_default(),
        };
        let next = current.apply(update)?;
        self.settings_store.save(&next).await?;

        let Some(running) = control.as_mut() else {
            *self.settings.write() = next.clone();
            return Ok(next);
        };

        self.set_state(ScannerState::Reconfiguring);
        *self.settings.write() = next.clone();

        if next.num_scan_threads != running.pool.len() {
            // retiring workers finish their current check, which may have started under either settings
            let grace = current
                .max_check_duration()
                .max(next.max_check_duration())
                .saturating_add(self.config.idle_wait)
                .saturating_add(self.config.join_timeout);
            running.pool.resize(next.num_scan_threads, grace).await;
        }
        if next.blacklist_files != current.blacklist_files {
            self.blacklist
                .set_blocklist(next.blacklist_files.clone())
                .await;
        }

        self.set_state(ScannerState::Running);
        info!("Scanner settings updated");
        Ok(next)
    }

    /// Stop every loop; calling it on a stopped scanner does nothing
    pub async fn teardown(&self) {
        let mut control = self.control.lock().await;
        let Some(mut running) = control.take() else {
            return;
        };

        self.set_state(ScannerState::Stopping);
        let _ = running.stop.send(true);
        let mut abandoned = self.queue.drain();

        running.pool.shutdown(self.config.join_timeout).await;

        let deadline = Instant::now() + self.config.join_timeout;
        for mut handle in running.loops {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Scheduler loop did not stop in time, aborting it");
                handle.abort();
            }
        }
        // a loop caught mid-tick may have queued more before exiting
        abandoned += self.queue.drain();
        if abandoned > 0 {
            info!("Abandoned {} queued checks", abandoned);
        }

        self.set_state(ScannerState::Stopped);
        info!("Scanner stopped");
    }
}
