//! Parsing of proxy URIs and proxy list lines

use crate::proxy::models::{Proxy, ProxyType};
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;
use std::path::Path;

static URI_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)(https?|socks[45])://(?:([^:@/]+):([^@/]+)@)?([^:/@]+):(\d{1,5})/?$")
        .expect("Invalid proxy URI regex")
});

static HOST_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^((?:\d{1,3}\.){3}\d{1,3}):(\d{1,5})$").expect("Invalid IP:PORT regex")
});

/// Parser for proxy URIs (`scheme://[user:pass@]host:port`) and list lines
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a full proxy URI; the scheme decides the protocol family
    pub fn parse_uri(uri: &str) -> Option<Proxy> {
        let caps = URI_REGEX.captures(uri.trim())?;
        let proxy_type = ProxyType::from_scheme(&caps[1])?;
        let host = caps[4].to_string();
        let port: u16 = caps[5].parse().ok()?;
        if port == 0 {
            return None;
        }

        match (caps.get(2), caps.get(3)) {
            (Some(user), Some(pass)) => Some(Proxy::with_auth(
                host,
                port,
                proxy_type,
                user.as_str().to_string(),
                pass.as_str().to_string(),
            )),
            _ => Some(Proxy::new(host, port, proxy_type)),
        }
    }

    /// Parse one line of a proxy list
    ///
    /// Accepts full URIs, and bare `IP:PORT` entries which get `default_type`.
    /// Blank lines and `#` comments yield `None`.
    pub fn parse_line(line: &str, default_type: ProxyType) -> Option<Proxy> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        if line.contains("://") {
            return Self::parse_uri(line);
        }

        let caps = HOST_PORT_REGEX.captures(line)?;
        let ip: Ipv4Addr = caps[1].parse().ok()?;
        let port: u16 = caps[2].parse().ok()?;
        if port == 0 {
            return None;
        }
        Some(Proxy::new(ip.to_string(), port, default_type))
    }

    /// IPv4 address named by a proxy URI, if any
    pub fn extract_ipv4(uri: &str) -> Option<Ipv4Addr> {
        Self::parse_uri(uri).and_then(|proxy| proxy.ipv4())
    }

    /// Parse every line of `content` into proxy URIs
    pub fn parse_string(content: &str, default_type: ProxyType) -> Vec<String> {
        content
            .lines()
            .filter_map(|line| Self::parse_line(line, default_type))
            .map(|proxy| proxy.url())
            .collect()
    }

    /// Parse proxy URIs from a file
    pub fn parse_file<P: AsRef<Path>>(path: P, default_type: ProxyType) -> Result<Vec<String>> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse_string(&content, default_type))
    }
}
