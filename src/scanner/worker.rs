//! Check workers: pull URIs off the shared queue, filter, probe and record

use crate::proxy::checker::ProxyChecker;
use crate::proxy::geo::LocationProvider;
use crate::proxy::models::{CheckOutcome, ProxyFilter, ProxyRecord};
use crate::proxy::parser::ProxyParser;
use crate::scanner::blacklist::Blacklist;
use crate::scanner::queue::CheckQueue;
use crate::scanner::reliability::ReliabilityScorer;
use crate::scanner::settings::ScannerSettings;
use crate::scanner::stats::ScanCounters;
use crate::store::ProxyStore;
use crate::Result;
use dashmap::DashSet;
use futures::FutureExt;
use parking_lot::RwLock;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Everything a worker or scheduler loop needs, shared across all of them
pub struct ScanContext {
    pub settings: Arc<RwLock<ScannerSettings>>,
    pub counters: Arc<ScanCounters>,
    pub queue: CheckQueue,
    pub blacklist: Arc<Blacklist>,
    pub checker: ProxyChecker,
    pub scorer: ReliabilityScorer,
    pub store: Arc<dyn ProxyStore>,
    pub locator: Arc<dyn LocationProvider>,
    /// URIs currently being checked by some worker
    pub in_flight: DashSet<String>,
    /// How long an idle worker waits on the queue before re-checking its stop signal
    pub idle_wait: Duration,
}

/// Removes a URI from the in-flight set when its check ends, however it ends
struct InFlight<'a> {
    set: &'a DashSet<String>,
    uri: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(self.uri);
    }
}

impl ScanContext {
    /// Run one dequeued URI through blacklist, checker and store
    pub async fn process(&self, uri: &str) {
        if !self.in_flight.insert(uri.to_string()) {
            self.counters.duplicate_skipped();
            debug!("{} is already being checked, skipping", uri);
            return;
        }
        let _claim = InFlight {
            set: &self.in_flight,
            uri,
        };

        if self.blacklist.is_blacklisted(uri).await {
            self.counters.blacklisted();
            debug!("{} is blacklisted", uri);
            return;
        }
        self.counters.accepted();

        let (websites, timeout) = {
            let settings = self.settings.read();
            (settings.websites.clone(), settings.check_timeout())
        };
        let outcome = self.checker.check(uri, &websites, timeout).await;

        if let Err(e) = self.record(uri, outcome).await {
            warn!("Could not record check result for {}: {:#}", uri, e);
        }
    }

    /// Upsert the outcome; a failed first check never creates a record
    async fn record(&self, uri: &str, outcome: CheckOutcome) -> Result<()> {
        let existing = self.store.find_one_by(&ProxyFilter::by_uri(uri)).await?;
        let reliability = self.scorer.get_reliability_for(uri).await?;

        match (outcome, existing) {
            (CheckOutcome::Alive(result), None) => {
                let proxy_type = ProxyParser::parse_uri(uri)
                    .map(|p| p.proxy_type)
                    .unwrap_or_default();
                let record = ProxyRecord::discovered(
                    uri,
                    proxy_type,
                    result,
                    reliability,
                    self.locate(uri),
                );
                self.store.save(&record).await?;
                info!("New proxy {} ({:.3}s, {})", uri, record.speed, record.anonymity);
            }
            (CheckOutcome::Alive(result), Some(mut record)) => {
                record.mark_alive(result, reliability);
                if record.location.is_none() {
                    record.location = self.locate(uri);
                }
                self.store.save(&record).await?;
            }
            (CheckOutcome::Dead(kind), Some(mut record)) => {
                debug!("{} failed recheck ({}), reliability {:.2}", uri, kind, reliability);
                record.mark_dead(reliability);
                self.store.save(&record).await?;
            }
            (CheckOutcome::Dead(_), None) => {}
        }
        Ok(())
    }

    fn locate(&self, uri: &str) -> Option<crate::proxy::models::Location> {
        let ip = ProxyParser::extract_ipv4(uri)?;
        self.locator.get_info(IpAddr::V4(ip))
    }
}

/// Counts a worker as active from spawn until its task ends or is aborted
struct ActiveWorker(Arc<ScanCounters>);

impl ActiveWorker {
    fn new(counters: Arc<ScanCounters>) -> Self {
        counters.worker_started();
        Self(counters)
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.worker_stopped();
    }
}

async fn run_worker(ctx: Arc<ScanContext>, id: usize, mut stop: watch::Receiver<bool>, _active: ActiveWorker) {
    debug!("Worker {} started", id);
    while !*stop.borrow() {
        let next = tokio::select! {
            uri = ctx.queue.next(ctx.idle_wait) => uri,
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
                None
            }
        };
        let Some(uri) = next else {
            continue;
        };

        if let Err(panic) = AssertUnwindSafe(ctx.process(&uri)).catch_unwind().await {
            error!("Worker {} panicked while processing {}: {:?}", id, uri, panic);
        }
    }
    debug!("Worker {} stopped", id);
}

struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Resizable set of check workers
///
/// Workers only observe their stop signal between iterations, so a retired
/// worker always finishes the check it is running before it exits.
pub struct WorkerPool {
    ctx: Arc<ScanContext>,
    workers: Vec<Worker>,
    next_id: usize,
}

impl WorkerPool {
    pub fn new(ctx: Arc<ScanContext>) -> Self {
        Self {
            ctx,
            workers: Vec::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn spawn(&mut self, count: usize) {
        for _ in 0..count {
            let (stop, rx) = watch::channel(false);
            let active = ActiveWorker::new(self.ctx.counters.clone());
            let handle = tokio::spawn(run_worker(self.ctx.clone(), self.next_id, rx, active));
            self.workers.push(Worker { stop, handle });
            self.next_id += 1;
        }
    }

    /// Grow or shrink to `target` workers; retired workers are joined before returning
    pub async fn resize(&mut self, target: usize, join_timeout: Duration) {
        let current = self.workers.len();
        if target > current {
            info!("Starting {} check workers", target - current);
            self.spawn(target - current);
        } else if target < current {
            info!("Stopping {} check workers", current - target);
            let retiring = self.workers.split_off(target);
            retire(retiring, join_timeout).await;
        }
    }

    /// Stop every worker
    pub async fn shutdown(&mut self, join_timeout: Duration) {
        let retiring = std::mem::take(&mut self.workers);
        retire(retiring, join_timeout).await;
    }
}

/// Longest any resize or shutdown waits for retiring workers
const MAX_JOIN_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

async fn retire(workers: Vec<Worker>, join_timeout: Duration) {
    for worker in &workers {
        let _ = worker.stop.send(true);
    }

    let join_timeout = join_timeout.min(MAX_JOIN_WAIT);
    let deadline = Instant::now() + join_timeout;
    let mut aborted = 0;
    for mut worker in workers {
        if tokio::time::timeout_at(deadline, &mut worker.handle)
            .await
            .is_err()
        {
            worker.handle.abort();
            aborted += 1;
        }
    }
    if aborted > 0 {
        warn!("{} workers did not stop within {:?} and were aborted", aborted, join_timeout);
    }
}
