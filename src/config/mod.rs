// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Configuration module

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn, Level};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory
    pub data_dir: PathBuf,

    /// Default log level (error, warn, info, debug, trace)
    pub log_level: String,

    /// Enable demo mode (simulated meter)
    pub demo_mode: bool,

    /// Offset from UTC used for human-readable notification times
    pub timezone_offset_hours: i32,

    /// Sound level meter
    pub device: DeviceConfig,

    /// Event detection
    pub detection: DetectionConfig,

    /// Contextual data sources
    pub enrichment: EnrichmentConfig,

    /// Delivery pipeline
    pub dispatch: DispatchConfig,

    /// Downstream destinations
    pub sinks: SinksConfig,

    /// Image capture
    pub camera: CameraConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            demo_mode: true,
            timezone_offset_hours: 0,
            device: DeviceConfig::default(),
            detection: DetectionConfig::default(),
            enrichment: EnrichmentConfig::default(),
            dispatch: DispatchConfig::default(),
            sinks: SinksConfig::default(),
            camera: CameraConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            config.save(path)?;
            Ok(config)
        }
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("noisebuster"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Reject values the pipeline cannot run with
    /// Parsed `log_level`, falling back to info
    pub fn max_log_level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_level.parse::<Level>().is_err() {
            bail!("log_level {:?} is not one of error, warn, info, debug, trace", self.log_level);
        }

        let d = &self.detection;
        if d.max_gap_ms <= self.device.sample_interval_ms {
            bail!(
                "detection.max_gap_ms ({}) must exceed device.sample_interval_ms ({})",
                d.max_gap_ms,
                self.device.sample_interval_ms
            );
        }
        if d.max_event_duration_secs == 0 {
            bail!("detection.max_event_duration_secs must be positive");
        }
        if d.image_threshold_db < d.threshold_db {
            warn!(
                "image threshold {} dB is below event threshold {} dB; every event will request a capture",
                d.image_threshold_db, d.threshold_db
            );
        }

        let p = &self.dispatch;
        if p.max_attempts == 0 {
            bail!("dispatch.max_attempts must be at least 1");
        }
        if p.queue_capacity == 0 {
            bail!("dispatch.queue_capacity must be at least 1");
        }
        if p.circuit_failure_threshold == 0 {
            bail!("dispatch.circuit_failure_threshold must be at least 1");
        }

        let s = &self.sinks;
        if s.influxdb.enabled && s.influxdb.url.is_empty() {
            bail!("sinks.influxdb is enabled but has no url");
        }
        if s.mqtt.enabled && s.mqtt.broker.is_empty() {
            bail!("sinks.mqtt is enabled but has no broker");
        }
        if s.discord.enabled && s.discord.webhook_url.is_empty() {
            bail!("sinks.discord is enabled but has no webhook_url");
        }
        if s.pushover.enabled && (s.pushover.api_token.is_empty() || s.pushover.user_key.is_empty()) {
            bail!("sinks.pushover is enabled but api_token/user_key are missing");
        }
        if s.webhook.enabled && s.webhook.url.is_empty() {
            bail!("sinks.webhook is enabled but has no url");
        }
        if self.camera.enabled && self.camera.snapshot_url.is_empty() {
            bail!("camera is enabled but has no snapshot_url");
        }

        Ok(())
    }
}

/// Transport used to reach the meter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Usb,
    Serial,
    Simulated,
}

/// What to do when the meter drops while no event is open
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdleDisconnectPolicy {
    /// Log and keep reconnecting quietly
    Wait,
    /// Also raise an alert notice to notification sinks
    Alert,
}

/// Sound level meter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub transport: Transport,

    /// Name used in tags, topics and messages
    pub device_name: String,

    /// Location tag for storage
    pub location: String,

    /// Explicit USB vendor id (hex), overrides discovery
    pub usb_vendor_id: Option<String>,

    /// Explicit USB product id (hex), overrides discovery
    pub usb_product_id: Option<String>,

    /// Known meters, one `vendor,product # model` per line
    pub usb_ids_path: PathBuf,

    /// Serial port of the PWM bridge
    pub serial_port: Option<String>,
    pub baud_rate: u32,

    /// Nominal sampling interval
    pub sample_interval_ms: u64,

    /// Reconnect backoff floor and ceiling
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,

    /// Give up (fatal) after this many failed reconnects; `None` retries forever
    pub max_reconnect_attempts: Option<u32>,

    pub idle_disconnect_policy: IdleDisconnectPolicy,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Simulated,
            device_name: "noise_buster".to_string(),
            location: "noise_buster".to_string(),
            usb_vendor_id: None,
            usb_product_id: None,
            usb_ids_path: PathBuf::from("usb_ids"),
            serial_port: None,
            baud_rate: 9600,
            sample_interval_ms: 100,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: None,
            idle_disconnect_policy: IdleDisconnectPolicy::Alert,
        }
    }
}

impl DeviceConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Event detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Minimum level that opens an event
    pub threshold_db: f64,

    /// Peak level that requests an image capture
    pub image_threshold_db: f64,

    /// Time below threshold (from the last qualifying sample) before an event closes
    pub release_delay_ms: u64,

    /// Time the level must stay at or above threshold before an event opens; 0 opens instantly
    pub open_dwell_ms: u64,

    /// Sample silence that force-closes an open event
    pub max_gap_ms: u64,

    /// Upper bound on a single event
    pub max_event_duration_secs: u64,

    /// Realtime peak-level window
    pub level_window_secs: u64,

    /// Gap/release check cadence when no samples arrive
    pub tick_interval_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold_db: 80.0,
            image_threshold_db: 90.0,
            release_delay_ms: 2000,
            open_dwell_ms: 0,
            max_gap_ms: 3000,
            max_event_duration_secs: 300,
            level_window_secs: 10,
            tick_interval_ms: 250,
        }
    }
}

/// Enrichment sources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub weather: WeatherConfig,
    pub traffic: TrafficConfig,
}

/// Current-weather source (OpenWeatherMap compatible)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub enabled: bool,
    pub api_url: String,
    pub api_key: String,
    pub location: String,
    pub refresh_interval_secs: u64,
    pub ttl_secs: u64,
    pub grace_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: "https://api.openweathermap.org/data/2.5/weather".to_string(),
            api_key: String::new(),
            location: String::new(),
            refresh_interval_secs: 300,
            ttl_secs: 600,
            grace_secs: 120,
            request_timeout_secs: 10,
        }
    }
}

/// Road traffic counts source (Telraam compatible)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub enabled: bool,
    pub api_url: String,
    pub api_key: String,
    pub segment_id: String,
    pub refresh_interval_secs: u64,
    pub ttl_secs: u64,
    pub grace_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: "https://telraam-api.net/v1/segments/id".to_string(),
            api_key: String::new(),
            segment_id: String::new(),
            refresh_interval_secs: 900,
            ttl_secs: 1800,
            grace_secs: 300,
            request_timeout_secs: 10,
        }
    }
}

/// Delivery pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Bound on one delivery attempt
    pub attempt_timeout_ms: u64,

    /// Attempts per event per sink, including the first
    pub max_attempts: u32,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Consecutive failed events that open a sink's circuit
    pub circuit_failure_threshold: u32,

    /// How long an open circuit skips events before a trial event
    pub circuit_cooldown_secs: u64,

    /// Wait on durable sinks before an event counts as processed
    pub durable_timeout_ms: u64,

    /// Grace period for in-flight attempts at shutdown
    pub shutdown_grace_ms: u64,

    /// Per-sink job queue
    pub queue_capacity: usize,

    /// How long a late capture may still be attached to events already stored.
    /// Sinks never wait for the camera.
    pub image_wait_ms: u64,

    /// Delivered ids remembered per sink for deduplication
    pub dedupe_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 5000,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
            circuit_failure_threshold: 3,
            circuit_cooldown_secs: 60,
            durable_timeout_ms: 15_000,
            shutdown_grace_ms: 5000,
            queue_capacity: 64,
            image_wait_ms: 20_000,
            dedupe_capacity: 1024,
        }
    }
}

/// Downstream destinations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksConfig {
    pub influxdb: InfluxConfig,
    pub sqlite: DatabaseConfig,
    pub mqtt: MqttConfig,
    pub discord: DiscordConfig,
    pub pushover: PushoverConfig,
    pub webhook: WebhookConfig,
}

impl SinksConfig {
    pub fn enabled_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.influxdb.enabled { names.push("influxdb"); }
        if self.sqlite.enabled { names.push("sqlite"); }
        if self.mqtt.enabled { names.push("mqtt"); }
        if self.discord.enabled { names.push("discord"); }
        if self.pushover.enabled { names.push("pushover"); }
        if self.webhook.enabled { names.push("webhook"); }
        names
    }
}

/// InfluxDB v2 time-series storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub enabled: bool,
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub realtime_bucket: String,
    pub measurement: String,
    pub durable: bool,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://127.0.0.1:8086".to_string(),
            token: String::new(),
            org: "noise_buster".to_string(),
            bucket: "noise_buster".to_string(),
            realtime_bucket: "noise_buster_realtime".to_string(),
            measurement: "noise_buster_events".to_string(),
            durable: true,
        }
    }
}

/// Local SQLite event store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Enable database storage
    pub enabled: bool,

    /// Database path
    pub path: PathBuf,

    /// Retention period in days
    pub retention_days: u32,

    pub durable: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data/noisebuster.db"),
            retention_days: 30,
            durable: true,
        }
    }
}

/// MQTT broker for home-automation integration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub discovery_prefix: String,
    pub durable: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: "localhost".to_string(),
            port: 1883,
            client_id: "noisebuster".to_string(),
            username: None,
            password: None,
            discovery_prefix: "homeassistant".to_string(),
            durable: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub enabled: bool,
    pub webhook_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushoverConfig {
    pub enabled: bool,
    pub api_url: String,
    pub api_token: String,
    pub user_key: String,
    pub title: String,
}

impl Default for PushoverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: "https://api.pushover.net/1/messages.json".to_string(),
            api_token: String::new(),
            user_key: String::new(),
            title: "Noise Buster".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
}

/// IP camera snapshot capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub enabled: bool,
    pub snapshot_url: String,
    pub image_save_path: PathBuf,
    pub image_retention_hours: u64,
    pub request_timeout_secs: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            snapshot_url: String::new(),
            image_save_path: PathBuf::from("./data/images"),
            image_retention_hours: 24,
            request_timeout_secs: 10,
        }
    }
}
