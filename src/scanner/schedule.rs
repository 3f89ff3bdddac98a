//! Minute-resolution schedulers feeding the check queue
//!
//! Each loop counts ticks from zero and decides on every tick whether its
//! interval has come round. Intervals are re-read from the live settings on
//! each tick, so a settings change applies without restarting the loop.

use crate::proxy::crawler::Source;
use crate::proxy::models::ProxyFilter;
use crate::scanner::worker::ScanContext;
use crate::Result;
use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const MINUTES_PER_HOUR: u64 = 60;

/// Call `on_tick(n)` every `tick` until `stop` flips; the first tick is immediate
async fn every_tick<F, Fut>(name: String, tick: Duration, mut stop: watch::Receiver<bool>, mut on_tick: F)
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut count: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *stop.borrow() {
            break;
        }

        if let Err(panic) = AssertUnwindSafe(on_tick(count)).catch_unwind().await {
            error!("{} loop panicked on tick {}: {:?}", name, count, panic);
        }
        count += 1;
    }
    debug!("{} loop stopped", name);
}

/// Enqueue the URIs of `uris` that the store does not know yet
pub async fn enqueue_new(ctx: &ScanContext, uris: Vec<String>) -> Result<usize> {
    let mut seen = HashSet::new();
    let mut queued = 0;
    for uri in uris {
        if !seen.insert(uri.clone()) {
            continue;
        }
        if ctx.store.find_one_by(&ProxyFilter::by_uri(&uri)).await?.is_some() {
            continue;
        }
        ctx.queue.push(uri);
        queued += 1;
    }
    Ok(queued)
}

async fn scan_source(ctx: &ScanContext, source: &dyn Source) -> Result<usize> {
    let uris = source.gather().await?;
    let found = uris.len();
    let queued = enqueue_new(ctx, uris).await?;
    info!("{} found {} proxies, {} new queued", source.label(), found, queued);
    Ok(queued)
}

/// One loop per source, polling it every `scan_interval()` ticks
pub fn spawn_source_loop(
    ctx: Arc<ScanContext>,
    source: Arc<dyn Source>,
    tick: Duration,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let name = format!("Source {}", source.label());
    tokio::spawn(every_tick(name, tick, stop, move |count| {
        let ctx = ctx.clone();
        let source = source.clone();
        async move {
            let every = source.scan_interval().max(1);
            if count % every != 0 {
                return;
            }
            debug!("Now scanning {}", source.label());
            if let Err(e) = scan_source(&ctx, source.as_ref()).await {
                warn!("Source {} failed this cycle: {:#}", source.label(), e);
            }
        }
    }))
}

/// Queue known proxies that are due on tick `count`: alive ones every
/// alive interval, dead ones only when the tick also hits the dead interval
pub async fn enqueue_due_rechecks(ctx: &ScanContext, count: u64) -> Result<usize> {
    let (alive_every, dead_every) = {
        let settings = ctx.settings.read();
        (
            settings.alive_check_interval_minutes.max(1),
            settings.dead_check_interval_minutes.max(1),
        )
    };
    if count % alive_every != 0 {
        return Ok(0);
    }

    let alive = ctx.store.find_by(&ProxyFilter::alive()).await?;
    let mut queued = ctx.queue.extend(alive.into_iter().map(|p| p.uri));

    if count % dead_every == 0 {
        let dead = ctx.store.find_by(&ProxyFilter::dead()).await?;
        queued += ctx.queue.extend(dead.into_iter().map(|p| p.uri));
    }
    Ok(queued)
}

pub fn spawn_recheck_loop(ctx: Arc<ScanContext>, tick: Duration, stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(every_tick("Recheck".to_string(), tick, stop, move |count| {
        let ctx = ctx.clone();
        async move {
            match enqueue_due_rechecks(&ctx, count).await {
                Ok(0) => {}
                Ok(n) => info!("Queued {} known proxies for recheck", n),
                Err(e) => warn!("Recheck scheduling failed: {:#}", e),
            }
        }
    }))
}

fn blacklist_refresh_due(hours: u64, count: u64) -> bool {
    let every = hours.max(1).saturating_mul(MINUTES_PER_HOUR);
    count != 0 && count % every == 0
}

/// Refresh the blacklist every `blacklist_refresh_hours`; tick zero is skipped
/// because the scanner loads the lists before any loop starts
pub fn spawn_blacklist_loop(ctx: Arc<ScanContext>, tick: Duration, stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(every_tick("Blacklist".to_string(), tick, stop, move |count| {
        let ctx = ctx.clone();
        async move {
            let hours = ctx.settings.read().blacklist_refresh_hours;
            if !blacklist_refresh_due(hours, count) {
                return;
            }
            ctx.blacklist.refresh().await;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::geo::NoLocation;
    use crate::proxy::models::{ProxyRecord, ProxyType, ValidationResult, Anonymity};
    use crate::store::{MemoryStore, ProxyStore};
    use crate::testing::{scan_context, FakeSource, ScriptedTransport};

    const TICK: Duration = Duration::from_millis(20);

    fn context() -> (Arc<ScanContext>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ctx = scan_context(Arc::new(ScriptedTransport::new()), store.clone(), Arc::new(NoLocation));
        (ctx, store)
    }

    async fn seed(store: &MemoryStore, uri: &str, alive: bool) {
        let result = ValidationResult {
            speed: 0.4,
            anonymity: Anonymity::High,
            accessible: vec![],
            inaccessible: vec![],
        };
        let mut record = ProxyRecord::discovered(uri, ProxyType::Http, result, 1.0, None);
        if !alive {
            record.mark_dead(0.5);
        }
        ProxyStore::save(store, &record).await.unwrap();
    }

    fn drain(ctx: &ScanContext) -> Vec<String> {
        std::iter::from_fn(|| ctx.queue.try_next()).collect()
    }

    #[tokio::test]
    async fn test_enqueue_new_skips_known_and_repeated() {
        let (ctx, store) = context();
        seed(&store, "http://1.1.1.1:80", true).await;

        let queued = enqueue_new(
            &ctx,
            vec![
                "http://1.1.1.1:80".to_string(),
                "http://2.2.2.2:80".to_string(),
                "http://2.2.2.2:80".to_string(),
                "socks5://3.3.3.3:1080".to_string(),
            ],
        )
        .await
        .unwrap();

        assert_eq!(queued, 2);
        assert_eq!(drain(&ctx), vec!["http://2.2.2.2:80", "socks5://3.3.3.3:1080"]);
    }

    #[tokio::test]
    async fn test_recheck_decay() {
        let (ctx, store) = context();
        {
            let mut settings = ctx.settings.write();
            settings.alive_check_interval_minutes = 15;
            settings.dead_check_interval_minutes = 60;
        }
        seed(&store, "http://1.1.1.1:80", true).await;
        seed(&store, "http://2.2.2.2:80", false).await;

        assert_eq!(enqueue_due_rechecks(&ctx, 0).await.unwrap(), 2);
        drain(&ctx);

        assert_eq!(enqueue_due_rechecks(&ctx, 7).await.unwrap(), 0);
        assert_eq!(enqueue_due_rechecks(&ctx, 15).await.unwrap(), 1);
        assert_eq!(drain(&ctx), vec!["http://1.1.1.1:80"]);

        assert_eq!(enqueue_due_rechecks(&ctx, 60).await.unwrap(), 2);
        drain(&ctx);

        // dead interval alone is not enough
        {
            let mut settings = ctx.settings.write();
            settings.alive_check_interval_minutes = 7;
            settings.dead_check_interval_minutes = 10;
        }
        assert_eq!(enqueue_due_rechecks(&ctx, 10).await.unwrap(), 0);
        assert_eq!(enqueue_due_rechecks(&ctx, 70).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_source_loop_polls_on_interval() {
        let (ctx, _store) = context();
        let source = Arc::new(FakeSource::new("fake", 3, &["http://9.9.9.9:3128"]));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn_source_loop(ctx.clone(), source.clone(), TICK, stop_rx);
        tokio::time::sleep(TICK * 8).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        // ticks 0, 3, 6 are due; scheduling jitter may add or drop one
        let polls = source.gather_count();
        assert!((2..=4).contains(&polls), "polled {} times", polls);
        assert_eq!(drain(&ctx)[0], "http://9.9.9.9:3128");
    }

    #[tokio::test]
    async fn test_failing_source_does_not_end_loop() {
        let (ctx, _store) = context();
        let source = Arc::new(FakeSource::failing("broken", 1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn_source_loop(ctx.clone(), source.clone(), TICK, stop_rx);
        tokio::time::sleep(TICK * 5).await;
        assert!(!handle.is_finished());
        assert!(source.gather_count() >= 2);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(ctx.queue.is_empty());
    }

    #[tokio::test]
    async fn test_stop_signal_ends_loop_promptly() {
        let (ctx, _store) = context();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_recheck_loop(ctx, Duration::from_secs(3600), stop_rx);

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[test]
    fn test_blacklist_refresh_due() {
        assert!(!blacklist_refresh_due(24, 0));
        assert!(!blacklist_refresh_due(24, 60));
        assert!(blacklist_refresh_due(24, 24 * 60));
        assert!(blacklist_refresh_due(1, 120));
        // out-of-range hours never refresh instead of overflowing
        assert!(!blacklist_refresh_due(u64::MAX, 60));
        assert!(!blacklist_refresh_due(u64::MAX, u64::MAX - 1));
    }
}
