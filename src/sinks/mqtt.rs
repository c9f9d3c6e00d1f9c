// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! MQTT pub/sub sink with home-automation discovery

use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{event_payload, Delivered, Notice, NoticeKind, Sink, SinkKind};
use crate::config::MqttConfig;
use crate::detection::{LevelReport, NoiseEvent};
use crate::enrichment::EnrichmentSnapshot;
use crate::error::SinkError;

/// Topic layout under `<prefix>/sensor/<device>`
#[derive(Debug, Clone)]
pub struct Topics {
    base: String,
    device: String,
}

impl Topics {
    pub fn new(prefix: &str, device: &str) -> Self {
        let device = slug(device);
        Self {
            base: format!("{}/sensor/{}", prefix.trim_end_matches('/'), device),
            device,
        }
    }

    pub fn event_config(&self) -> String {
        format!("{}/noise_level/config", self.base)
    }

    pub fn realtime_config(&self) -> String {
        format!("{}/realtime_noise_level/config", self.base)
    }

    pub fn event_state(&self) -> String {
        format!("{}/noise_levels/state", self.base)
    }

    pub fn realtime_state(&self) -> String {
        format!("{}/realtime_noise_levels/state", self.base)
    }

    pub fn enrichment_state(&self, source: &str) -> String {
        format!("{}/enrichment/{}/state", self.base, slug(source))
    }

    pub fn availability(&self) -> String {
        format!("{}/availability", self.base)
    }

    /// Retained discovery configs for the two level sensors
    pub fn discovery(&self) -> Vec<(String, serde_json::Value)> {
        let device = json!({
            "identifiers": [format!("noisebuster_{}", self.device)],
            "name": format!("Noise Buster {}", self.device),
            "manufacturer": "Noise Buster",
        });
        vec![
            (
                self.event_config(),
                json!({
                    "name": "Noise Level",
                    "unique_id": format!("{}_noise_level", self.device),
                    "state_topic": self.event_state(),
                    "json_attributes_topic": self.event_state(),
                    "availability_topic": self.availability(),
                    "unit_of_measurement": "dB",
                    "device_class": "sound_pressure",
                    "value_template": "{{ value_json.peak_db }}",
                    "device": device.clone(),
                }),
            ),
            (
                self.realtime_config(),
                json!({
                    "name": "Realtime Noise Level",
                    "unique_id": format!("{}_realtime_noise_level", self.device),
                    "state_topic": self.realtime_state(),
                    "availability_topic": self.availability(),
                    "unit_of_measurement": "dB",
                    "device_class": "sound_pressure",
                    "state_class": "measurement",
                    "value_template": "{{ value_json.peak_db }}",
                    "device": device,
                }),
            ),
        ]
    }
}

fn slug(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Publishing seam so the sink can be tested without a broker
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), SinkError>;
}

/// rumqttc client; the event loop runs on its own task
pub struct MqttPublisher {
    client: AsyncClient,
    connected: Arc<RwLock<bool>>,
}

impl MqttPublisher {
    /// Start the client. Discovery configs and availability are (re)published on every ConnAck.
    pub fn connect(config: &MqttConfig, device: &str) -> Result<Self> {
        let topics = Topics::new(&config.discovery_prefix, device);
        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_last_will(LastWill::new(topics.availability(), "offline", QoS::AtLeastOnce, true));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        let connected = Arc::new(RwLock::new(false));

        let announce = client.clone();
        let flag = connected.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        *flag.write().await = true;
                        // The event loop must keep polling while these are queued
                        let client = announce.clone();
                        let topics = topics.clone();
                        tokio::spawn(async move {
                            if let Err(e) = announce_discovery(&client, &topics).await {
                                warn!("MQTT discovery publish failed: {}", e);
                            }
                        });
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        *flag.write().await = false;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        *flag.write().await = false;
                        warn!("MQTT error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        info!("MQTT client initialized for {}:{}", config.broker, config.port);
        Ok(Self { client, connected })
    }

    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }
}

async fn announce_discovery(client: &AsyncClient, topics: &Topics) -> Result<()> {
    for (topic, config) in topics.discovery() {
        client.publish(topic, QoS::AtLeastOnce, true, serde_json::to_vec(&config)?).await?;
    }
    client.publish(topics.availability(), QoS::AtLeastOnce, true, "online").await?;
    debug!("Published discovery configs under {}", topics.base);
    Ok(())
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), SinkError> {
        if !self.is_connected().await {
            return Err(SinkError::Unreachable("MQTT broker not connected".into()));
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| SinkError::Unreachable(format!("MQTT publish failed: {}", e)))
    }
}

/// Publishes event summaries, level windows and enrichment snapshots.
/// Payloads carry `event_id` so consumers can drop redelivered messages.
pub struct MqttSink {
    publisher: Arc<dyn Publisher>,
    topics: Topics,
    durable: bool,
}

impl MqttSink {
    pub fn new(publisher: Arc<dyn Publisher>, config: &MqttConfig, device: &str) -> Self {
        Self {
            publisher,
            topics: Topics::new(&config.discovery_prefix, device),
            durable: config.durable,
        }
    }

    async fn publish_json(&self, topic: String, payload: &serde_json::Value, retain: bool) -> Result<(), SinkError> {
        let bytes = serde_json::to_vec(payload)?;
        self.publisher.publish(&topic, bytes, retain).await
    }
}

#[async_trait]
impl Sink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::PubSub
    }

    fn durable(&self) -> bool {
        self.durable
    }

    async fn deliver(&self, event: &NoiseEvent) -> Result<Delivered, SinkError> {
        self.publish_json(self.topics.event_state(), &event_payload(event), false).await?;
        Ok(Delivered::done())
    }

    async fn publish_level(&self, report: &LevelReport) -> Result<(), SinkError> {
        let payload = json!({
            "timestamp": report.timestamp.to_rfc3339(),
            "peak_db": (report.peak_db * 10.0).round() / 10.0,
            "sample_count": report.sample_count,
        });
        self.publish_json(self.topics.realtime_state(), &payload, false).await
    }

    async fn publish_enrichment(&self, snapshot: &EnrichmentSnapshot) -> Result<(), SinkError> {
        let payload = json!({
            "source": snapshot.source,
            "fetched_at": snapshot.fetched_at.to_rfc3339(),
            "fields": snapshot.fields,
        });
        self.publish_json(self.topics.enrichment_state(&snapshot.source), &payload, true).await
    }

    async fn notice(&self, notice: &Notice) -> Result<(), SinkError> {
        let availability = match notice.kind {
            NoticeKind::Startup | NoticeKind::DeviceRestored => "online",
            NoticeKind::DeviceLost | NoticeKind::Shutdown => "offline",
        };
        self.publisher
            .publish(&self.topics.availability(), availability.as_bytes().to_vec(), true)
            .await
    }
}
