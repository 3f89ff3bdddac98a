//! Proxy data models

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Proxy type enumeration, implied by the URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyType {
    /// Map a URI scheme onto its protocol family
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(ProxyType::Http),
            "https" => Some(ProxyType::Https),
            "socks4" => Some(ProxyType::Socks4),
            "socks5" => Some(ProxyType::Socks5),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Http => write!(f, "http"),
            ProxyType::Https => write!(f, "https"),
            ProxyType::Socks4 => write!(f, "socks4"),
            ProxyType::Socks5 => write!(f, "socks5"),
        }
    }
}

/// Proxy authentication credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl ProxyAuth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

/// A parsed proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl Proxy {
    /// Create a new proxy without authentication
    pub fn new(host: String, port: u16, proxy_type: ProxyType) -> Self {
        Self {
            host,
            port,
            proxy_type,
            auth: None,
        }
    }

    /// Create a new proxy with authentication
    pub fn with_auth(
        host: String,
        port: u16,
        proxy_type: ProxyType,
        username: String,
        password: String,
    ) -> Self {
        Self {
            host,
            port,
            proxy_type,
            auth: Some(ProxyAuth::new(username, password)),
        }
    }

    /// Get the proxy URI string
    pub fn url(&self) -> String {
        let auth_part = self.auth.as_ref().map_or(String::new(), |auth| {
            format!("{}:{}@", auth.username, auth.password)
        });

        format!("{}://{}{}:{}", self.proxy_type, auth_part, self.host, self.port)
    }

    /// IPv4 address of the host, if the host is a literal IPv4 address
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// How much a proxy reveals the requester's identity to the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anonymity {
    None,
    Low,
    Medium,
    High,
}

impl Anonymity {
    pub fn as_i64(self) -> i64 {
        match self {
            Anonymity::None => 0,
            Anonymity::Low => 1,
            Anonymity::Medium => 2,
            Anonymity::High => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Anonymity::None),
            1 => Some(Anonymity::Low),
            2 => Some(Anonymity::Medium),
            3 => Some(Anonymity::High),
            _ => None,
        }
    }
}

impl fmt::Display for Anonymity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Anonymity::None => "none",
            Anonymity::Low => "low",
            Anonymity::Medium => "medium",
            Anonymity::High => "high",
        };
        f.write_str(label)
    }
}

/// Geographic location of a proxy, filled in once on first successful check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Location {
    pub country: String,
    pub region: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
}

/// A validated proxy as stored in the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub uri: String,
    pub proxy_type: ProxyType,
    /// Average probe time in seconds
    pub speed: f64,
    pub anonymity: Anonymity,
    pub reliability: f64,
    pub last_check: DateTime<Utc>,
    pub last_check_status: bool,
    pub location: Option<Location>,
    pub accessible_websites: Vec<String>,
    pub inaccessible_websites: Vec<String>,
}

impl ProxyRecord {
    /// Build the record for a proxy seen alive for the first time
    pub fn discovered(
        uri: &str,
        proxy_type: ProxyType,
        result: ValidationResult,
        reliability: f64,
        location: Option<Location>,
    ) -> Self {
        Self {
            uri: uri.to_string(),
            proxy_type,
            speed: result.speed,
            anonymity: result.anonymity,
            reliability,
            last_check: Utc::now(),
            last_check_status: true,
            location,
            accessible_websites: result.accessible,
            inaccessible_websites: result.inaccessible,
        }
    }

    /// Fold a successful check into an existing record
    pub fn mark_alive(&mut self, result: ValidationResult, reliability: f64) {
        self.speed = result.speed;
        self.anonymity = result.anonymity;
        self.reliability = reliability;
        self.last_check = Utc::now();
        self.last_check_status = true;
        self.accessible_websites = result.accessible;
        self.inaccessible_websites = result.inaccessible;
    }

    /// Fold a failed check into an existing record
    pub fn mark_dead(&mut self, reliability: f64) {
        self.reliability = reliability;
        self.last_check = Utc::now();
        self.last_check_status = false;
    }
}

/// Append-only log entry for one check attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPing {
    pub uri: String,
    pub raw_headers: String,
    pub speed: f64,
    pub error_type: String,
    pub ping_time: DateTime<Utc>,
}

impl HistoricalPing {
    pub fn success(uri: &str, raw_headers: String, speed: f64) -> Self {
        Self {
            uri: uri.to_string(),
            raw_headers,
            speed,
            error_type: String::new(),
            ping_time: Utc::now(),
        }
    }

    pub fn failure(uri: &str, kind: ErrorKind) -> Self {
        Self {
            uri: uri.to_string(),
            raw_headers: String::new(),
            speed: 0.0,
            error_type: kind.to_string(),
            ping_time: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.speed > 0.0
    }
}

/// Successful outcome of a check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub speed: f64,
    pub anonymity: Anonymity,
    pub accessible: Vec<String>,
    pub inaccessible: Vec<String>,
}

/// Outcome of a check: either validated or dead with the failure kind
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Alive(ValidationResult),
    Dead(ErrorKind),
}

/// Query over the proxy pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyFilter {
    pub uri: Option<String>,
    pub last_check_status: Option<bool>,
    pub countries: Option<Vec<String>>,
    pub min_reliability: Option<f64>,
    pub max_speed: Option<f64>,
    pub anonymities: Option<Vec<Anonymity>>,
    /// Every listed website must be in the proxy's accessible set
    pub accessible_websites: Option<Vec<String>>,
    pub limit: Option<usize>,
}

impl ProxyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_uri(uri: &str) -> Self {
        Self {
            uri: Some(uri.to_string()),
            ..Self::default()
        }
    }

    pub fn alive() -> Self {
        Self::new().with_status(true)
    }

    pub fn dead() -> Self {
        Self::new().with_status(false)
    }

    pub fn with_status(mut self, alive: bool) -> Self {
        self.last_check_status = Some(alive);
        self
    }

    pub fn with_countries(mut self, countries: Vec<String>) -> Self {
        self.countries = Some(countries);
        self
    }

    pub fn with_min_reliability(mut self, reliability: f64) -> Self {
        self.min_reliability = Some(reliability);
        self
    }

    pub fn with_max_speed(mut self, speed: f64) -> Self {
        self.max_speed = Some(speed);
        self
    }

    pub fn with_anonymities(mut self, levels: Vec<Anonymity>) -> Self {
        self.anonymities = Some(levels);
        self
    }

    pub fn with_accessible_websites(mut self, websites: Vec<String>) -> Self {
        self.accessible_websites = Some(websites);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record satisfies every set criterion
    pub fn matches(&self, record: &ProxyRecord) -> bool {
        if let Some(uri) = &self.uri {
            if &record.uri != uri {
                return false;
            }
        }
        if let Some(status) = self.last_check_status {
            if record.last_check_status != status {
                return false;
            }
        }
        if let Some(countries) = &self.countries {
            let country = record.location.as_ref().map(|l| l.country.as_str());
            if !country.is_some_and(|c| countries.iter().any(|wanted| wanted == c)) {
                return false;
            }
        }
        if let Some(min) = self.min_reliability {
            if record.reliability < min {
                return false;
            }
        }
        if let Some(max) = self.max_speed {
            if record.speed > max {
                return false;
            }
        }
        if let Some(levels) = &self.anonymities {
            if !levels.contains(&record.anonymity) {
                return false;
            }
        }
        if let Some(websites) = &self.accessible_websites {
            if !websites
                .iter()
                .all(|w| record.accessible_websites.contains(w))
            {
                return false;
            }
        }
        true
    }
}
