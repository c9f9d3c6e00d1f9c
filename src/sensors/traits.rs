// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Sound level meter traits and common types

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// Meter transport family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeterKind {
    Usb,          // Vendor control-transfer meters
    SerialBridge, // PWM to serial microcontroller
    Simulated,
}

/// Meter operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeterStatus {
    Disconnected,
    Connected,
    Error,
}

/// A single level reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub level_db: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, level_db: f64) -> Self {
        Self { timestamp, level_db }
    }

    pub fn now(level_db: f64) -> Self {
        Self::new(Utc::now(), level_db)
    }
}

/// Capability interface every meter transport implements
#[async_trait]
pub trait SoundMeter: Send {
    /// Human readable identity, e.g. model name
    fn name(&self) -> &str;

    fn kind(&self) -> MeterKind;

    fn status(&self) -> MeterStatus;

    /// Locate and open the device
    async fn open(&mut self) -> Result<(), DeviceError>;

    /// Read one level in dB
    async fn read(&mut self) -> Result<f64, DeviceError>;

    /// Drop the current handle and open again
    async fn reconnect(&mut self) -> Result<(), DeviceError> {
        self.close().await;
        self.open().await
    }

    /// Release the device
    async fn close(&mut self);
}
