//! Proxy-level concerns
//!
//! This module provides:
//! - Proxy URI parsing and the records kept for validated proxies
//! - The checker that probes a proxy for liveness, anonymity and reachability
//! - Sources that gather candidate proxies
//! - Geolocation of proxy IPs

pub mod checker;
pub mod crawler;
pub mod geo;
pub mod models;
pub mod parser;

pub use checker::{CheckerConfig, ProbeTransport, ProxyChecker, ReqwestTransport};
pub use crawler::{ListSource, Source, StaticSource, TxtListSource};
pub use geo::{GeoLocator, LocationProvider, NoLocation};
pub use models::{
    Anonymity, CheckOutcome, HistoricalPing, Location, Proxy, ProxyAuth, ProxyFilter, ProxyRecord,
    ProxyType, ValidationResult,
};
pub use parser::ProxyParser;
