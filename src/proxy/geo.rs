//! Geolocation of proxy IPs using an MMDB city database

use crate::proxy::models::Location;
use crate::Result;
use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Resolves an IP to a location; `None` when nothing is known
pub trait LocationProvider: Send + Sync {
    fn get_info(&self, ip: IpAddr) -> Option<Location>;
}

/// Provider used when no database is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocation;

impl LocationProvider for NoLocation {
    fn get_info(&self, _ip: IpAddr) -> Option<Location> {
        None
    }
}

/// Short display string for a location
pub fn short_display(location: &Location) -> String {
    match (location.country.is_empty(), location.city.is_empty()) {
        (false, false) => format!("{}, {}", location.city, location.country),
        (false, true) => location.country.clone(),
        (true, false) => location.city.clone(),
        (true, true) => String::from("Unknown"),
    }
}

/// GeoLocator for looking up IP addresses in MMDB databases
#[derive(Clone)]
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Create a new GeoLocator from an MMDB file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Look up the location for an IpAddr
    pub fn lookup_ip(&self, ip: IpAddr) -> Result<Option<Location>> {
        let lookup_result = self.reader.lookup(ip)?;
        let city: Option<geoip2::City> = lookup_result.decode()?;

        let Some(city) = city else {
            return Ok(None);
        };

        let location = Location {
            country: city.country.iso_code.unwrap_or_default().to_string(),
            region: city
                .subdivisions
                .first()
                .and_then(|s| s.names.english)
                .unwrap_or_default()
                .to_string(),
            city: city.city.names.english.unwrap_or_default().to_string(),
            lat: city.location.latitude.unwrap_or_default(),
            lon: city.location.longitude.unwrap_or_default(),
        };

        if location.country.is_empty() && location.city.is_empty() {
            return Ok(None);
        }
        Ok(Some(location))
    }
}

impl LocationProvider for GeoLocator {
    fn get_info(&self, ip: IpAddr) -> Option<Location> {
        match self.lookup_ip(ip) {
            Ok(location) => location,
            Err(e) => {
                debug!("No location for {}: {:#}", ip, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(country: &str, city: &str) -> Location {
        Location {
            country: country.to_string(),
            city: city.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_short_display() {
        assert_eq!(short_display(&location("US", "")), "US");
        assert_eq!(short_display(&location("US", "New York")), "New York, US");
        assert_eq!(short_display(&location("", "London")), "London");
        assert_eq!(short_display(&Location::default()), "Unknown");
    }

    #[test]
    fn test_no_location() {
        assert!(NoLocation.get_info("8.8.8.8".parse().unwrap()).is_none());
    }

    #[test]
    fn test_missing_database_is_an_error() {
        assert!(GeoLocator::from_path("/nonexistent/GeoLite2-City.mmdb").is_err());
    }
}
