//! IP block-list matcher
//!
//! Each named list is fetched as text (one IP or CIDR per line), cached on
//! disk, and compiled into a sorted, non-overlapping array of `BlockEntry`
//! values so membership is a binary search. A query is blacklisted when any
//! active list contains it.

use crate::proxy::parser::ProxyParser;
use crate::Result;
use anyhow::Context;
use dashmap::DashSet;
use futures::stream::{self, StreamExt};
use ipnet::Ipv4Net;
use parking_lot::RwLock as SyncRwLock;
use reqwest::Client;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Raw firehol blocklist-ipsets repository
pub const DEFAULT_BLOCKLIST_PREFIX: &str =
    "https://raw.githubusercontent.com/firehol/blocklist-ipsets/refs/heads/master/";

/// Lists known to exist under `DEFAULT_BLOCKLIST_PREFIX`
pub const KNOWN_BLOCKLISTS: &[&str] = &[
    "firehol_level1.netset",
    "firehol_level2.netset",
    "firehol_level3.netset",
    "firehol_level4.netset",
    "firehol_abusers_1d.netset",
    "firehol_abusers_30d.netset",
    "firehol_anonymous.netset",
    "firehol_proxies.netset",
    "firehol_webclient.netset",
    "firehol_webserver.netset",
    "spamhaus_drop.netset",
    "spamhaus_edrop.netset",
    "dshield.netset",
];

const FETCH_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 5;
const MAX_CONCURRENT_FETCHES: usize = 4;
const MEMO_CAPACITY: usize = 4096;

/// A single address or an inclusive address range, as 32-bit integers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEntry {
    Single(u32),
    Range { low: u32, high: u32 },
}

impl BlockEntry {
    pub fn low(&self) -> u32 {
        match *self {
            BlockEntry::Single(ip) => ip,
            BlockEntry::Range { low, .. } => low,
        }
    }

    pub fn high(&self) -> u32 {
        match *self {
            BlockEntry::Single(ip) => ip,
            BlockEntry::Range { high, .. } => high,
        }
    }

    fn spanning(low: u32, high: u32) -> Self {
        if low == high {
            BlockEntry::Single(low)
        } else {
            BlockEntry::Range { low, high }
        }
    }

    /// Parse one list line: `a.b.c.d` or `a.b.c.d/len`
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        if line.contains('/') {
            let net: Ipv4Net = line.parse().ok()?;
            Some(Self::spanning(
                u32::from(net.network()),
                u32::from(net.broadcast()),
            ))
        } else {
            let ip: Ipv4Addr = line.parse().ok()?;
            Some(BlockEntry::Single(u32::from(ip)))
        }
    }

    /// Where this entry sits relative to `ip`; `Equal` means `ip` is inside it
    fn cmp_ip(&self, ip: u32) -> Ordering {
        if self.high() < ip {
            Ordering::Less
        } else if self.low() > ip {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// One compiled block-list: ascending and disjoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockList {
    entries: Vec<BlockEntry>,
}

impl BlockList {
    pub fn from_entries(mut entries: Vec<BlockEntry>) -> Self {
        entries.sort_by_key(|e| (e.low(), e.high()));

        let mut merged: Vec<BlockEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            match merged.last_mut() {
                Some(last) if entry.low() <= last.high().saturating_add(1) => {
                    let high = last.high().max(entry.high());
                    *last = BlockEntry::spanning(last.low(), high);
                }
                _ => merged.push(entry),
            }
        }
        Self { entries: merged }
    }

    /// Compile list text, skipping comments and unparseable lines
    pub fn parse(content: &str) -> Self {
        Self::from_entries(content.lines().filter_map(BlockEntry::parse).collect())
    }

    pub fn contains(&self, ip: u32) -> bool {
        self.entries.binary_search_by(|e| e.cmp_ip(ip)).is_ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }
}

/// Named block-lists with periodic refresh and an on-disk fallback cache
pub struct Blacklist {
    client: Client,
    prefix: String,
    cache_dir: PathBuf,
    names: SyncRwLock<Vec<String>>,
    /// Held for writing for the whole of a refresh, so queries wait for the new lists
    lists: RwLock<HashMap<String, BlockList>>,
    memo: DashSet<u32>,
    refresh_lock: Mutex<()>,
    downloading: AtomicBool,
}

impl Blacklist {
    pub fn new(prefix: &str, cache_dir: impl Into<PathBuf>, names: Vec<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(format!("proxy-scanner/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create blocklist HTTP client")?;

        Ok(Self {
            client,
            prefix: prefix.to_string(),
            cache_dir: cache_dir.into(),
            names: SyncRwLock::new(names),
            lists: RwLock::new(HashMap::new()),
            memo: DashSet::new(),
            refresh_lock: Mutex::new(()),
            downloading: AtomicBool::new(false),
        })
    }

    /// Install already-compiled lists, bypassing fetch
    pub async fn install(&self, lists: HashMap<String, BlockList>) {
        let mut guard = self.lists.write().await;
        *self.names.write() = lists.keys().cloned().collect();
        *guard = lists;
        self.memo.clear();
    }

    pub fn active_names(&self) -> Vec<String> {
        self.names.read().clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.downloading.load(AtomicOrdering::SeqCst)
    }

    /// Names of lists that can be selected: the known catalogue plus anything cached
    pub fn available_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = KNOWN_BLOCKLISTS.iter().map(|n| n.to_string()).collect();
        if let Ok(dir) = std::fs::read_dir(&self.cache_dir) {
            for entry in dir.flatten() {
                if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    if let Some(name) = entry.file_name().to_str() {
                        names.insert(name.to_string());
                    }
                }
            }
        }
        names.into_iter().collect()
    }

    /// Entry counts per loaded list
    pub async fn loaded(&self) -> Vec<(String, usize)> {
        let lists = self.lists.read().await;
        let mut loaded: Vec<_> = lists.iter().map(|(n, l)| (n.clone(), l.len())).collect();
        loaded.sort();
        loaded
    }

    /// Whether the IP of a proxy URI is on any active list
    ///
    /// URIs without a literal IPv4 host never match.
    pub async fn is_blacklisted(&self, uri: &str) -> bool {
        match ProxyParser::extract_ipv4(uri) {
            Some(ip) => self.contains_ip(ip).await,
            None => false,
        }
    }

    pub async fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        // the memo belongs to the list set being replaced
        if !self.is_refreshing() && self.memo.contains(&ip) {
            return true;
        }

        let lists = self.lists.read().await;
        let hit = lists.values().any(|list| list.contains(ip));
        if hit {
            if self.memo.len() >= MEMO_CAPACITY {
                self.memo.clear();
            }
            self.memo.insert(ip);
        }
        hit
    }

    /// Replace the active list names and reload immediately
    pub async fn set_blocklist(&self, names: Vec<String>) {
        info!("Blacklist set changed to {:?}", names);
        *self.names.write() = names;
        self.refresh().await;
    }

    /// Re-fetch every active list; lists that can be neither fetched nor
    /// read from cache are left out
    pub async fn refresh(&self) {
        let _serial = self.refresh_lock.lock().await;
        let mut lists = self.lists.write().await;
        self.downloading.store(true, AtomicOrdering::SeqCst);
        self.memo.clear();
        let started = Instant::now();
        let names = self.active_names();
        info!("Blacklist is refreshing {} lists", names.len());

        let fetched: Vec<(String, Option<String>)> = stream::iter(names)
            .map(|name| async move {
                let content = self.load_list(&name).await;
                (name, content)
            })
            .buffer_unordered(MAX_CONCURRENT_FETCHES)
            .collect()
            .await;

        let mut compiled = HashMap::new();
        for (name, content) in fetched {
            if let Some(content) = content {
                let list = BlockList::parse(&content);
                debug!("Compiled {} - {} entries", name, list.len());
                compiled.insert(name, list);
            }
        }

        *lists = compiled;
        self.memo.clear();
        self.downloading.store(false, AtomicOrdering::SeqCst);
        drop(lists);
        info!("Blacklist refreshed in {:?}", started.elapsed());
    }

    fn cache_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }

    async fn load_list(&self, name: &str) -> Option<String> {
        match self.fetch(name).await {
            Ok(content) => {
                if let Err(e) = write_cache(&self.cache_dir, &self.cache_path(name), &content).await {
                    warn!("Could not cache blocklist {}: {:#}", name, e);
                }
                Some(content)
            }
            Err(e) => {
                let path = self.cache_path(name);
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => {
                        warn!("Blocklist fetch for {} failed ({:#}), using cached copy", name, e);
                        Some(content)
                    }
                    Err(_) => {
                        warn!(
                            "Blocklist fetch for {} failed ({:#}) and no cached copy exists, skipping",
                            name, e
                        );
                        None
                    }
                }
            }
        }
    }

    async fn fetch(&self, name: &str) -> Result<String> {
        let url = format!("{}{}", self.prefix, name);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP status {}", status);
        }
        Ok(response.text().await?)
    }
}

async fn write_cache(dir: &Path, path: &Path, content: &str) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, content).await?;
    Ok(())
}
