//! Repository interfaces for the proxy pool, the ping log and settings.
//!
//! The engine only talks to these traits. `MemoryStore` keeps everything in
//! process; `crate::database::Database` persists to SQLite.

use crate::proxy::models::{HistoricalPing, ProxyFilter, ProxyRecord};
use crate::scanner::settings::ScannerSettings;
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Keyed (by URI) access to the proxy pool
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Records matching `filter`, fastest first, truncated to `filter.limit`
    async fn find_by(&self, filter: &ProxyFilter) -> Result<Vec<ProxyRecord>>;

    /// Upsert by URI
    async fn save(&self, proxy: &ProxyRecord) -> Result<()>;

    async fn delete(&self, uri: &str) -> Result<()>;

    async fn find_one_by(&self, filter: &ProxyFilter) -> Result<Option<ProxyRecord>> {
        let filter = filter.clone().with_limit(1);
        Ok(self.find_by(&filter).await?.into_iter().next())
    }
}

/// Append-only log of check attempts
#[async_trait]
pub trait PingLog: Send + Sync {
    async fn save(&self, ping: &HistoricalPing) -> Result<()>;

    async fn find_by_uri(&self, uri: &str) -> Result<Vec<HistoricalPing>>;
}

/// Persisted scanner settings
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Option<ScannerSettings>>;

    async fn save(&self, settings: &ScannerSettings) -> Result<()>;
}

pub(crate) fn by_speed(a: &ProxyRecord, b: &ProxyRecord) -> Ordering {
    a.speed.partial_cmp(&b.speed).unwrap_or(Ordering::Equal)
}

/// In-process implementation of every repository trait
#[derive(Default)]
pub struct MemoryStore {
    proxies: RwLock<HashMap<String, ProxyRecord>>,
    pings: RwLock<HashMap<String, Vec<HistoricalPing>>>,
    settings: RwLock<Option<ScannerSettings>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn ping_count(&self) -> usize {
        self.pings.read().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl ProxyStore for MemoryStore {
    async fn find_by(&self, filter: &ProxyFilter) -> Result<Vec<ProxyRecord>> {
        if let Some(uri) = &filter.uri {
            let found = self.proxies.read().get(uri).cloned();
            return Ok(found.into_iter().filter(|p| filter.matches(p)).collect());
        }

        let mut found: Vec<ProxyRecord> = self
            .proxies
            .read()
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        found.sort_by(by_speed);
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn save(&self, proxy: &ProxyRecord) -> Result<()> {
        self.proxies
            .write()
            .insert(proxy.uri.clone(), proxy.clone());
        Ok(())
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        self.proxies.write().remove(uri);
        Ok(())
    }
}

#[async_trait]
impl PingLog for MemoryStore {
    async fn save(&self, ping: &HistoricalPing) -> Result<()> {
        self.pings
            .write()
            .entry(ping.uri.clone())
            .or_default()
            .push(ping.clone());
        Ok(())
    }

    async fn find_by_uri(&self, uri: &str) -> Result<Vec<HistoricalPing>> {
        Ok(self.pings.read().get(uri).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn load(&self) -> Result<Option<ScannerSettings>> {
        Ok(self.settings.read().clone())
    }

    async fn save(&self, settings: &ScannerSettings) -> Result<()> {
        *self.settings.write() = Some(settings.clone());
        Ok(())
    }
}
