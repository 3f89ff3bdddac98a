//! Scanner settings and validated partial updates

use crate::error::SettingsError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MAX_SCAN_THREADS: usize = 1000;
pub const MAX_CHECK_TIMEOUT_SECS: u64 = 300;
pub const MAX_REFRESH_HOURS: u64 = 24 * 365;

/// One destination probed through every candidate proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsiteCheck {
    pub url: String,
    pub timeout_seconds: u64,
    /// A failure here makes the whole check report the proxy dead
    pub mark_dead_on_fail: bool,
}

impl WebsiteCheck {
    pub fn new(url: &str, timeout_seconds: u64, mark_dead_on_fail: bool) -> Self {
        Self {
            url: url.to_string(),
            timeout_seconds,
            mark_dead_on_fail,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |reason: &str| SettingsError::Website {
            url: self.url.clone(),
            reason: reason.to_string(),
        };
        let url = Url::parse(&self.url).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if self.timeout_seconds == 0 || self.timeout_seconds > MAX_CHECK_TIMEOUT_SECS {
            return Err(invalid(&format!(
                "timeout must be between 1 and {} seconds",
                MAX_CHECK_TIMEOUT_SECS
            )));
        }
        Ok(())
    }
}

/// Process-wide scanner configuration, replaceable while running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    pub num_scan_threads: usize,
    pub alive_check_interval_minutes: u64,
    pub dead_check_interval_minutes: u64,
    pub scan_check_timeout_seconds: u64,
    pub blacklist_files: Vec<String>,
    pub blacklist_refresh_hours: u64,
    pub websites: Vec<WebsiteCheck>,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            num_scan_threads: 100,
            alive_check_interval_minutes: 15,
            dead_check_interval_minutes: 60,
            scan_check_timeout_seconds: 10,
            blacklist_files: vec!["firehol_level1.netset".to_string()],
            blacklist_refresh_hours: 24,
            websites: vec![
                WebsiteCheck::new("https://google.com", 10, true),
                WebsiteCheck::new("https://reddit.com", 10, false),
            ],
        }
    }
}

impl ScannerSettings {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_check_timeout_seconds)
    }

    /// Upper bound on one full check: primary probe plus every destination
    pub fn max_check_duration(&self) -> Duration {
        self.websites
            .iter()
            .map(WebsiteCheck::timeout)
            .fold(self.check_timeout(), |acc, t| acc.saturating_add(t))
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.num_scan_threads == 0 || self.num_scan_threads > MAX_SCAN_THREADS {
            return Err(SettingsError::ThreadCount {
                value: self.num_scan_threads,
                max: MAX_SCAN_THREADS,
            });
        }
        if self.alive_check_interval_minutes == 0 {
            return Err(SettingsError::Interval {
                field: "alive_check_interval_minutes",
            });
        }
        if self.dead_check_interval_minutes == 0 {
            return Err(SettingsError::Interval {
                field: "dead_check_interval_minutes",
            });
        }
        if self.blacklist_refresh_hours == 0 || self.blacklist_refresh_hours > MAX_REFRESH_HOURS {
            return Err(SettingsError::RefreshHours {
                value: self.blacklist_refresh_hours,
                max: MAX_REFRESH_HOURS,
            });
        }
        if self.scan_check_timeout_seconds == 0
            || self.scan_check_timeout_seconds > MAX_CHECK_TIMEOUT_SECS
        {
            return Err(SettingsError::Timeout {
                value: self.scan_check_timeout_seconds,
                max: MAX_CHECK_TIMEOUT_SECS,
            });
        }
        for name in &self.blacklist_files {
            if !is_plain_file_name(name) {
                return Err(SettingsError::BlacklistName(name.clone()));
            }
        }
        for website in &self.websites {
            website.validate()?;
        }
        Ok(())
    }

    /// Produce the settings that result from `update`, or the reason it is rejected
    pub fn apply(&self, update: ScannerSettingsUpdate) -> Result<ScannerSettings, SettingsError> {
        let mut next = self.clone();
        if let Some(v) = update.num_scan_threads {
            next.num_scan_threads = v;
        }
        if let Some(v) = update.alive_check_interval_minutes {
            next.alive_check_interval_minutes = v;
        }
        if let Some(v) = update.dead_check_interval_minutes {
            next.dead_check_interval_minutes = v;
        }
        if let Some(v) = update.scan_check_timeout_seconds {
            next.scan_check_timeout_seconds = v;
        }
        if let Some(v) = update.blacklist_files {
            next.blacklist_files = v;
        }
        if let Some(v) = update.blacklist_refresh_hours {
            next.blacklist_refresh_hours = v;
        }
        if let Some(v) = update.websites {
            next.websites = v;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Block-list names double as cache file names
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Partial settings change; unset fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScannerSettingsUpdate {
    pub num_scan_threads: Option<usize>,
    pub alive_check_interval_minutes: Option<u64>,
    pub dead_check_interval_minutes: Option<u64>,
    pub scan_check_timeout_seconds: Option<u64>,
    pub blacklist_files: Option<Vec<String>>,
    pub blacklist_refresh_hours: Option<u64>,
    pub websites: Option<Vec<WebsiteCheck>>,
}
