// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Chat, push and webhook notification sinks

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::json;
use sysinfo::System;

use super::{check_response, event_payload, http_client, Delivered, Notice, NoticeKind, Sink, SinkKind};
use crate::config::{Config, DiscordConfig, PushoverConfig, WebhookConfig};
use crate::detection::NoiseEvent;
use crate::error::SinkError;

/// Human-readable message for an event
fn event_message(event: &NoiseEvent, timezone_offset_hours: i32) -> String {
    let mut text = event.summary(timezone_offset_hours);
    if let Some(image) = &event.image_ref {
        text.push_str(&format!("\nImage: {}", image));
    }
    if let Some(traffic) = event.snapshot("traffic") {
        if let Some(vehicles) = traffic.number("vehicles") {
            text.push_str(&format!("\nTraffic: {:.0} vehicles/h", vehicles));
        }
    }
    text
}

pub struct DiscordSink {
    client: reqwest::Client,
    webhook_url: String,
    timezone_offset_hours: i32,
}

impl DiscordSink {
    pub fn new(config: &DiscordConfig, timezone_offset_hours: i32) -> Self {
        Self {
            client: http_client(10),
            webhook_url: config.webhook_url.clone(),
            timezone_offset_hours,
        }
    }

    async fn post(&self, content: String) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "content": content }))
            .send()
            .await?;
        check_response(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for DiscordSink {
    fn name(&self) -> &str {
        "discord"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Notification
    }

    async fn deliver(&self, event: &NoiseEvent) -> Result<Delivered, SinkError> {
        self.post(event_message(event, self.timezone_offset_hours)).await?;
        Ok(Delivered::done())
    }

    async fn notice(&self, notice: &Notice) -> Result<(), SinkError> {
        self.post(format!("**{}**\n{}", notice.title, notice.message)).await
    }
}

pub struct PushoverSink {
    client: reqwest::Client,
    api_url: String,
    api_token: String,
    user_key: String,
    title: String,
    timezone_offset_hours: i32,
}

impl PushoverSink {
    pub fn new(config: &PushoverConfig, timezone_offset_hours: i32) -> Self {
        Self {
            client: http_client(10),
            api_url: config.api_url.clone(),
            api_token: config.api_token.clone(),
            user_key: config.user_key.clone(),
            title: config.title.clone(),
            timezone_offset_hours,
        }
    }

    async fn push(&self, title: &str, message: &str) -> Result<(), SinkError> {
        let form = [
            ("token", self.api_token.as_str()),
            ("user", self.user_key.as_str()),
            ("title", title),
            ("message", message),
        ];
        let response = self.client.post(&self.api_url).form(&form).send().await?;
        check_response(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for PushoverSink {
    fn name(&self) -> &str {
        "pushover"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Notification
    }

    async fn deliver(&self, event: &NoiseEvent) -> Result<Delivered, SinkError> {
        self.push(&self.title, &event_message(event, self.timezone_offset_hours)).await?;
        Ok(Delivered::done())
    }

    async fn notice(&self, notice: &Notice) -> Result<(), SinkError> {
        self.push(&notice.title, &notice.message).await
    }
}

/// Generic JSON webhook. The event id travels as `Idempotency-Key`.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    timezone_offset_hours: i32,
}

impl WebhookSink {
    pub fn new(config: &WebhookConfig, timezone_offset_hours: i32) -> Self {
        Self {
            client: http_client(10),
            url: config.url.clone(),
            timezone_offset_hours,
        }
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Notification
    }

    async fn deliver(&self, event: &NoiseEvent) -> Result<Delivered, SinkError> {
        let mut body = event_payload(event);
        body["message"] = json!(event_message(event, self.timezone_offset_hours));

        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", event.id.to_string())
            .json(&body)
            .send()
            .await?;
        check_response(response).await?;
        Ok(Delivered::done())
    }

    async fn notice(&self, notice: &Notice) -> Result<(), SinkError> {
        let response = self.client.post(&self.url).json(notice).send().await?;
        check_response(response).await?;
        Ok(())
    }
}

/// Start-up announcement listing host, thresholds and enabled outputs
pub fn startup_notice(config: &Config) -> Notice {
    let host = System::host_name().unwrap_or_else(|| "unknown host".to_string());
    let offset = config.timezone_offset_hours;
    let local = FixedOffset::east_opt(offset * 3600)
        .map(|tz| Utc::now().with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| Utc::now().format("%Y-%m-%d %H:%M:%S").to_string());

    let on_off = |enabled: bool| if enabled { "Enabled" } else { "Disabled" };
    let mut outputs = config.sinks.enabled_names();
    if config.camera.enabled {
        outputs.push("camera");
    }

    let message = [
        format!("Host: {}", host),
        format!("Device: {} ({})", config.device.device_name, config.device.location),
        format!(
            "Threshold: {:.1} dB, image capture at {:.1} dB",
            config.detection.threshold_db, config.detection.image_threshold_db
        ),
        format!("Outputs: {}", if outputs.is_empty() { "none".to_string() } else { outputs.join(", ") }),
        format!("Weather: {}", on_off(config.enrichment.weather.enabled)),
        format!("Traffic: {}", on_off(config.enrichment.traffic.enabled)),
        format!("Local time: {} (UTC{:+})", local, offset),
    ]
    .join("\n");

    Notice::new(NoticeKind::Startup, message)
}
