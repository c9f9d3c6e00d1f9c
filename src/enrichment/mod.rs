//! Enrichment module - cached contextual data attached to noise events

mod cache;
mod weather;
mod traffic;

pub use cache::{EnrichmentCache, SourcePolicy};
pub use weather::WeatherSource;
pub use traffic::TrafficSource;

use std::collections::BTreeMap;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EnrichmentConfig;
use crate::error::EnrichmentError;

pub type Fields = BTreeMap<String, serde_json::Value>;

/// Copy of one source's data at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentSnapshot {
    pub source: String,
    pub fields: Fields,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl EnrichmentSnapshot {
    pub fn new(source: &str, fields: Fields, ttl_secs: u64) -> Self {
        Self {
            source: source.to_string(),
            fields,
            fetched_at: Utc::now(),
            ttl_secs,
        }
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(|v| v.as_f64())
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }
}

/// Read-only client for one external data source
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Fields, EnrichmentError>;
}

/// Build the cache with every enabled source registered
pub fn build_cache(config: &EnrichmentConfig) -> EnrichmentCache {
    let mut cache = EnrichmentCache::new();

    let w = &config.weather;
    if w.enabled {
        cache = cache.with_source(
            std::sync::Arc::new(WeatherSource::new(w)),
            SourcePolicy {
                ttl: Duration::from_secs(w.ttl_secs),
                grace: Duration::from_secs(w.grace_secs),
                refresh_interval: Duration::from_secs(w.refresh_interval_secs.max(1)),
            },
        );
    }

    let t = &config.traffic;
    if t.enabled {
        cache = cache.with_source(
            std::sync::Arc::new(TrafficSource::new(t)),
            SourcePolicy {
                ttl: Duration::from_secs(t.ttl_secs),
                grace: Duration::from_secs(t.grace_secs),
                refresh_interval: Duration::from_secs(t.refresh_interval_secs.max(1)),
            },
        );
    }

    cache
}
