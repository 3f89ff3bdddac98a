//! Historical success ratio of a proxy

use crate::proxy::models::HistoricalPing;
use crate::store::PingLog;
use crate::Result;
use std::sync::Arc;

/// Fraction of successful pings; an untested proxy is assumed reliable
pub fn success_ratio(pings: &[HistoricalPing]) -> f64 {
    if pings.is_empty() {
        return 1.0;
    }
    let alive = pings.iter().filter(|p| p.is_success()).count();
    alive as f64 / pings.len() as f64
}

#[derive(Clone)]
pub struct ReliabilityScorer {
    log: Arc<dyn PingLog>,
}

impl ReliabilityScorer {
    pub fn new(log: Arc<dyn PingLog>) -> Self {
        Self { log }
    }

    pub async fn get_reliability_for(&self, uri: &str) -> Result<f64> {
        let pings = self.log.find_by_uri(uri).await?;
        Ok(success_ratio(&pings))
    }
}
