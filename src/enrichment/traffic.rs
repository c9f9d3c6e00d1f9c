// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Road segment counts from the Telraam API

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{EnrichmentSource, Fields};
use crate::config::TrafficConfig;
use crate::error::EnrichmentError;
use crate::sinks::http_client;

pub struct TrafficSource {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    segment_id: String,
}

impl TrafficSource {
    pub fn new(config: &TrafficConfig) -> Self {
        Self {
            client: http_client(config.request_timeout_secs),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            segment_id: config.segment_id.clone(),
        }
    }
}

#[async_trait]
impl EnrichmentSource for TrafficSource {
    fn name(&self) -> &str {
        "traffic"
    }

    async fn fetch(&self) -> Result<Fields, EnrichmentError> {
        let url = format!("{}/{}", self.api_url, self.segment_id);
        debug!("Fetching traffic counts from {}", url);

        let response = self
            .client
            .get(&url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EnrichmentError::Status(status.as_u16()));
        }

        let body: Value = response.json().await?;
        parse_segment(&body)
    }
}

/// Hourly counts from the first feature of a segment response
pub fn parse_segment(body: &Value) -> Result<Fields, EnrichmentError> {
    let props = &body["features"][0]["properties"];
    if !props.is_object() {
        return Err(EnrichmentError::Parse("segment has no properties".into()));
    }

    let mut fields = Fields::new();
    let mut vehicles = 0.0;
    for (key, name) in [("car", "cars"), ("heavy", "heavy_vehicles"), ("bike", "bikes"), ("pedestrian", "pedestrians")] {
        let count = props[key].as_f64().unwrap_or(0.0);
        if key == "car" || key == "heavy" {
            vehicles += count;
        }
        fields.insert(name.into(), json!(count));
    }
    fields.insert("vehicles".into(), json!(vehicles));

    if let Some(v85) = props["v85"].as_f64() {
        fields.insert("v85_kmh".into(), json!(v85));
    }
    if let Some(at) = props["last_data_package"].as_str() {
        fields.insert("measured_at".into(), json!(at));
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segment_counts() {
        let body = json!({
            "type": "FeatureCollection",
            "features": [{
                "properties": {
                    "car": 120.0, "heavy": 8.0, "bike": 14.0, "pedestrian": 30.0,
                    "v85": 42.5, "last_data_package": "2026-03-01T21:00:00Z"
                }
            }]
        });
        let fields = parse_segment(&body).unwrap();
        assert_eq!(fields["cars"], json!(120.0));
        assert_eq!(fields["vehicles"], json!(128.0));
        assert_eq!(fields["v85_kmh"], json!(42.5));
    }

    #[test]
    fn test_parse_segment_without_features() {
        assert!(parse_segment(&json!({"features": []})).is_err());
    }
}
