//! Sinks module - downstream destinations for noise events

mod influx;
mod mqtt;
mod notify;
mod camera;
mod store;

pub use influx::{to_line, InfluxSink};
pub use mqtt::{MqttPublisher, MqttSink, Publisher, Topics};
pub use notify::{startup_notice, DiscordSink, PushoverSink, WebhookSink};
pub use camera::{cleanup_images, Camera, CameraSink, HttpSnapshotCamera};
pub use store::StoreSink;

use std::sync::Arc;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::detection::{LevelReport, NoiseEvent};
use crate::enrichment::EnrichmentSnapshot;
use crate::error::SinkError;

/// Sink variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkKind {
    Storage,
    PubSub,
    Notification,
    ImageTrigger,
}

/// Result of a successful delivery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivered {
    /// Reference to something the sink produced, e.g. a saved image path
    pub artifact: Option<String>,
}

impl Delivered {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_artifact(artifact: impl Into<String>) -> Self {
        Self {
            artifact: Some(artifact.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeKind {
    Startup,
    DeviceLost,
    DeviceRestored,
    Shutdown,
}

/// Operational message that is not tied to a noise event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        let title = match kind {
            NoticeKind::Startup => "Noise Buster started",
            NoticeKind::DeviceLost => "Sound meter lost",
            NoticeKind::DeviceRestored => "Sound meter reconnected",
            NoticeKind::Shutdown => "Noise Buster stopping",
        };
        Self {
            kind,
            title: title.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Uniform delivery contract. Implementations must treat `event.id` as a dedupe key.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SinkKind;

    /// Durable sinks are awaited by the dispatcher up to a bounded timeout
    fn durable(&self) -> bool {
        self.kind() == SinkKind::Storage
    }

    /// Whether a capture that finishes after delivery is sent again with its image reference
    fn takes_image_updates(&self) -> bool {
        self.kind() == SinkKind::Storage
    }

    /// Whether this sink takes part in delivering `event`
    fn wants(&self, _event: &NoiseEvent) -> bool {
        true
    }

    async fn deliver(&self, event: &NoiseEvent) -> Result<Delivered, SinkError>;

    async fn publish_level(&self, _report: &LevelReport) -> Result<(), SinkError> {
        Ok(())
    }

    async fn publish_enrichment(&self, _snapshot: &EnrichmentSnapshot) -> Result<(), SinkError> {
        Ok(())
    }

    async fn notice(&self, _notice: &Notice) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Turn a non-2xx response into the matching `SinkError`
pub(crate) async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(std::time::Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    Err(SinkError::from_status(status, retry_after, body))
}

pub(crate) fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
        .build()
        .unwrap_or_default()
}

/// Enrichment values keyed `<source>_<field>`
pub fn flatten_enrichment(event: &NoiseEvent) -> Vec<(String, serde_json::Value)> {
    event
        .enrichment
        .iter()
        .flat_map(|snap| {
            snap.fields
                .iter()
                .map(move |(k, v)| (format!("{}_{}", snap.source, k), v.clone()))
        })
        .collect()
}

/// JSON body shared by the pub/sub and webhook sinks
pub fn event_payload(event: &NoiseEvent) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "event_id": event.id,
        "start": event.start.to_rfc3339(),
        "end": event.end.to_rfc3339(),
        "peak_db": (event.peak_db * 10.0).round() / 10.0,
        "duration_ms": event.duration_ms,
        "sample_count": event.sample_count,
        "device": event.device_name,
        "location": event.location,
        "image_ref": event.image_ref,
        "degraded": event.degraded,
    });
    if let Some(obj) = payload.as_object_mut() {
        for (key, value) in flatten_enrichment(event) {
            obj.insert(key, value);
        }
    }
    payload
}

/// Instantiate every enabled sink
pub async fn build_sinks(config: &Config) -> Result<Vec<Arc<dyn Sink>>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    let s = &config.sinks;
    let device = &config.device.device_name;

    if s.influxdb.enabled {
        sinks.push(Arc::new(InfluxSink::new(&s.influxdb, device, &config.device.location)));
    }
    if s.sqlite.enabled {
        let db = Database::open(&s.sqlite)?;
        sinks.push(Arc::new(StoreSink::new(Arc::new(db), s.sqlite.durable)));
    }
    if s.mqtt.enabled {
        let publisher = MqttPublisher::connect(&s.mqtt, device)?;
        sinks.push(Arc::new(MqttSink::new(Arc::new(publisher), &s.mqtt, device)));
    }
    if s.discord.enabled {
        sinks.push(Arc::new(DiscordSink::new(&s.discord, config.timezone_offset_hours)));
    }
    if s.pushover.enabled {
        sinks.push(Arc::new(PushoverSink::new(&s.pushover, config.timezone_offset_hours)));
    }
    if s.webhook.enabled {
        sinks.push(Arc::new(WebhookSink::new(&s.webhook, config.timezone_offset_hours)));
    }
    if config.camera.enabled {
        let camera = HttpSnapshotCamera::new(&config.camera);
        sinks.push(Arc::new(CameraSink::new(Arc::new(camera))));
    }

    info!(
        "Sinks enabled: {}",
        sinks.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
    );
    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::test_event;
    use crate::enrichment::EnrichmentSnapshot;

    #[test]
    fn test_payload_carries_id_and_flattened_enrichment() {
        let mut event = test_event(9, 87.26);
        event.enrichment.push(EnrichmentSnapshot::new(
            "traffic",
            [("vehicles".to_string(), serde_json::json!(14))].into_iter().collect(),
            1800,
        ));

        let payload = event_payload(&event);
        assert_eq!(payload["event_id"], 9);
        assert_eq!(payload["peak_db"], 87.3);
        assert_eq!(payload["traffic_vehicles"], 14);
        assert!(payload["image_ref"].is_null());
    }

    #[tokio::test]
    async fn test_build_sinks_follows_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.sinks.sqlite.path = dir.path().join("events.db");
        config.sinks.discord.enabled = true;
        config.sinks.discord.webhook_url = "http://127.0.0.1:9/hook".into();
        config.camera.enabled = true;
        config.camera.snapshot_url = "http://127.0.0.1:9/snap.jpg".into();
        config.camera.image_save_path = dir.path().join("images");

        let sinks = build_sinks(&config).await.unwrap();
        let names: Vec<&str> = sinks.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["sqlite", "discord", "camera"]);
        assert!(sinks[0].durable());
        assert_eq!(sinks[2].kind(), SinkKind::ImageTrigger);
    }
}
