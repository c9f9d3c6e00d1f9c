// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! InfluxDB v2 storage sink using line protocol

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{check_response, flatten_enrichment, http_client, Delivered, Sink, SinkKind};
use crate::config::InfluxConfig;
use crate::detection::{LevelReport, NoiseEvent};
use crate::error::SinkError;

pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    token: String,
    org: String,
    bucket: String,
    realtime_bucket: String,
    measurement: String,
    device: String,
    location: String,
    durable: bool,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig, device: &str, location: &str) -> Self {
        Self {
            client: http_client(10),
            write_url: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            token: config.token.clone(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            realtime_bucket: config.realtime_bucket.clone(),
            measurement: config.measurement.clone(),
            device: device.to_string(),
            location: location.to_string(),
            durable: config.durable,
        }
    }

    async fn write(&self, bucket: &str, body: String) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.write_url)
            .query(&[("org", self.org.as_str()), ("bucket", bucket), ("precision", "ns")])
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;
        check_response(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for InfluxSink {
    fn name(&self) -> &str {
        "influxdb"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Storage
    }

    fn durable(&self) -> bool {
        self.durable
    }

    async fn deliver(&self, event: &NoiseEvent) -> Result<Delivered, SinkError> {
        let line = to_line(&self.measurement, event);
        debug!("InfluxDB write: {}", line);
        self.write(&self.bucket, line).await?;
        Ok(Delivered::done())
    }

    async fn publish_level(&self, report: &LevelReport) -> Result<(), SinkError> {
        if self.realtime_bucket.is_empty() {
            return Ok(());
        }
        let line = format!(
            "{}_realtime,device={},location={} level_db={:.1},sample_count={}i {}",
            escape_key(&self.measurement),
            escape_key(&self.device),
            escape_key(&self.location),
            report.peak_db,
            report.sample_count,
            report.timestamp.timestamp_nanos_opt().unwrap_or(0)
        );
        self.write(&self.realtime_bucket, line).await
    }
}

/// One point per event. Tags plus the start timestamp form the point identity,
/// so a retried write overwrites the same point.
pub fn to_line(measurement: &str, event: &NoiseEvent) -> String {
    let mut fields = vec![
        format!("event_id={}i", event.id),
        format!("level_db={:.1}", event.peak_db),
        format!("peak_db={:.1}", event.peak_db),
        format!("duration={}", event.duration_ms as f64 / 1000.0),
        format!("duration_ms={}i", event.duration_ms),
        format!("sample_count={}i", event.sample_count),
        format!("degraded={}", event.degraded.is_some()),
    ];
    if let Some(image) = &event.image_ref {
        fields.push(format!("image_ref=\"{}\"", escape_str(image)));
    }
    for (key, value) in flatten_enrichment(event) {
        let key = escape_key(&key);
        match value {
            Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    fields.push(format!("{}={}", key, f));
                }
            }
            Value::String(s) => fields.push(format!("{}=\"{}\"", key, escape_str(&s))),
            Value::Bool(b) => fields.push(format!("{}={}", key, b)),
            _ => {}
        }
    }

    format!(
        "{},device={},location={} {} {}",
        escape_key(measurement),
        escape_key(&event.device_name),
        escape_key(&event.location),
        fields.join(","),
        event.start.timestamp_nanos_opt().unwrap_or(0)
    )
}

fn escape_key(s: &str) -> String {
    let s = if s.is_empty() { "unknown" } else { s };
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_str(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::test_event;
    use crate::enrichment::EnrichmentSnapshot;

    #[test]
    fn test_line_carries_tags_fields_and_enrichment() {
        let mut event = test_event(42, 91.26);
        event.location = "main street".into();
        event.enrichment.push(EnrichmentSnapshot::new(
            "weather",
            [
                ("temperature".to_string(), serde_json::json!(12.5)),
                ("conditions".to_string(), serde_json::json!("light \"rain\"")),
            ]
            .into_iter()
            .collect(),
            600,
        ));

        let line = to_line("noise_buster_events", &event);
        assert!(line.starts_with("noise_buster_events,device=test-meter,location=main\\ street event_id=42i,"));
        assert!(line.contains("peak_db=91.3"));
        assert!(line.contains("duration_ms=2000i"));
        assert!(line.contains("weather_temperature=12.5"));
        assert!(line.contains("weather_conditions=\"light \\\"rain\\\"\""));
        assert!(line.ends_with(&event.start.timestamp_nanos_opt().unwrap().to_string()));
    }

    #[test]
    fn test_same_event_gives_identical_line() {
        let event = test_event(7, 85.0);
        assert_eq!(to_line("m", &event), to_line("m", &event));
    }

    #[test]
    fn test_event_id_does_not_create_series() {
        let first = test_event(7, 85.0);
        let mut second = test_event(8, 85.0);
        second.start = first.start;

        let series = |line: &str| line.split(' ').next().unwrap_or_default().to_string();
        let a = to_line("m", &first);
        let b = to_line("m", &second);
        assert_eq!(series(&a), series(&b));
        assert!(!series(&a).contains("event_id"));
        assert!(b.contains(" event_id=8i,"));
    }

    #[test]
    fn test_image_update_rewrites_same_point() {
        let event = test_event(7, 85.0);
        let with_image = event.with_image_ref(Some("/images/7.jpg".into()));
        let (a, b) = (to_line("m", &event), to_line("m", &with_image));

        let key = |line: &str| {
            let mut parts = line.split(' ');
            (parts.next().map(str::to_string), parts.last().map(str::to_string))
        };
        assert_eq!(key(&a), key(&b));
        assert!(b.contains("image_ref=\"/images/7.jpg\""));
    }
}
