// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Noise Buster - Noise Event Monitor
//!
//! Reads a sound level meter, turns sustained loud periods into discrete
//! noise events and delivers each event to a set of independent sinks:
//! - Hysteresis event detection with gap and duration caps
//! - Cached weather and traffic context attached at close time
//! - Per-sink retry, backoff and circuit breaking
//! - InfluxDB, SQLite, MQTT, Discord, Pushover, webhooks and camera snapshots
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Noise Buster Engine                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────┐  ┌───────────┐  ┌────────────┐  ┌───────────┐  │
//! │  │ Sampler │→ │ Detector  │→ │ Dispatcher │→ │   Sinks   │  │
//! │  └─────────┘  └───────────┘  └────────────┘  └───────────┘  │
//! │                     ↑              ↑                        │
//! │               ┌────────────┐       │                        │
//! │               │ Enrichment │───────┘                        │
//! │               │   Cache    │                                │
//! │               └────────────┘                                │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │                    Event Bus                         │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![allow(dead_code)]

pub mod core;
pub mod config;
pub mod error;
pub mod sensors;
pub mod detection;
pub mod enrichment;
pub mod dispatch;
pub mod sinks;
pub mod db;

// Re-exports for convenience
pub use config::Config;
pub use core::{Engine, EventBus};
pub use detection::{EventDetector, NoiseEvent};
pub use dispatch::{Dispatcher, SinkAttempt};
pub use enrichment::{EnrichmentCache, EnrichmentSnapshot};
pub use sensors::{Sample, Sampler, SoundMeter};
pub use sinks::{build_sinks, Sink};
pub use db::Database;

/// Noise Buster version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Noise Buster name
pub const NAME: &str = "Noise Buster";

/// Build info
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: VERSION.to_string(),
        target: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
        features: enabled_features(),
    }
}

/// Build information
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: String,
    pub target: String,
    pub os: String,
    pub features: Vec<String>,
}

fn enabled_features() -> Vec<String> {
    let mut features = vec![];

    #[cfg(feature = "usb")]
    features.push("usb".to_string());

    #[cfg(feature = "serial")]
    features.push("serial".to_string());

    features
}
