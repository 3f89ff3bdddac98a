//! Proxy Scanner - continuous discovery and validation of public proxies
//!
//! Sources feed candidate URIs into a shared check queue; a resizable pool of
//! workers filters them against IP block-lists, probes them for liveness,
//! anonymity and destination reachability, and keeps a scored pool of proxies
//! in a store. Known proxies are rechecked on a decaying cadence.

pub mod database;
pub mod error;
pub mod proxy;
pub mod scanner;
pub mod store;
pub mod tui;

#[cfg(test)]
mod testing;

pub use database::Database;
pub use error::{ErrorKind, ProbeError, ScannerError, SettingsError};
pub use proxy::*;
pub use scanner::settings::{ScannerSettings, ScannerSettingsUpdate, WebsiteCheck};
pub use scanner::stats::ScanningStatistics;
pub use scanner::{Scanner, ScannerConfig, ScannerState};
pub use store::{MemoryStore, PingLog, ProxyStore, SettingsStore};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
