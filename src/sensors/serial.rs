// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! PWM-to-serial bridge for meters without a supported USB protocol
//!
//! The bridge microcontroller prints one decimal dB value per line.

use async_trait::async_trait;

use super::{MeterKind, MeterStatus, SoundMeter};
use crate::error::DeviceError;

/// Parse one bridge line into a level
pub fn parse_line(line: &str) -> Result<f64, DeviceError> {
    let trimmed = line.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DeviceError::Transient(format!("unparseable bridge line: {:?}", trimmed)))
}

pub struct SerialBridgeMeter {
    name: String,
    port_name: String,
    baud_rate: u32,
    status: MeterStatus,
    #[cfg(feature = "serial")]
    reader: Option<std::sync::Arc<parking_lot::Mutex<std::io::BufReader<Box<dyn serialport::SerialPort>>>>>,
}

impl SerialBridgeMeter {
    pub fn new(port_name: &str, baud_rate: u32) -> Self {
        Self {
            name: format!("serial-bridge {}", port_name),
            port_name: port_name.to_string(),
            baud_rate,
            status: MeterStatus::Disconnected,
            #[cfg(feature = "serial")]
            reader: None,
        }
    }
}

#[cfg(feature = "serial")]
fn classify(e: serialport::Error) -> DeviceError {
    match e.kind() {
        serialport::ErrorKind::NoDevice | serialport::ErrorKind::Io(_) => DeviceError::Transient(e.to_string()),
        _ => DeviceError::Fatal(e.to_string()),
    }
}

#[async_trait]
impl SoundMeter for SerialBridgeMeter {
    fn name(&self) -> &str { &self.name }
    fn kind(&self) -> MeterKind { MeterKind::SerialBridge }
    fn status(&self) -> MeterStatus { self.status }

    #[cfg(feature = "serial")]
    async fn open(&mut self) -> Result<(), DeviceError> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(std::time::Duration::from_millis(1000))
            .open()
            .map_err(classify)?;
        self.reader = Some(std::sync::Arc::new(parking_lot::Mutex::new(std::io::BufReader::new(port))));
        self.status = MeterStatus::Connected;
        tracing::info!("Serial bridge opened on {} at {} baud", self.port_name, self.baud_rate);
        Ok(())
    }

    #[cfg(not(feature = "serial"))]
    async fn open(&mut self) -> Result<(), DeviceError> {
        let _ = self.baud_rate;
        self.status = MeterStatus::Error;
        Err(DeviceError::Fatal(format!(
            "cannot open {}: built without the `serial` feature",
            self.port_name
        )))
    }

    #[cfg(feature = "serial")]
    async fn read(&mut self) -> Result<f64, DeviceError> {
        use std::io::BufRead;

        let reader = self
            .reader
            .clone()
            .ok_or_else(|| DeviceError::Transient("port not open".to_string()))?;

        let line = tokio::task::spawn_blocking(move || {
            let mut line = String::new();
            reader.lock().read_line(&mut line).map(|_| line)
        })
        .await
        .map_err(|e| DeviceError::Transient(e.to_string()))?
        .map_err(|e| {
            self.status = MeterStatus::Error;
            match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    DeviceError::Fatal(e.to_string())
                }
                _ => DeviceError::Transient(e.to_string()),
            }
        })?;

        parse_line(&line)
    }

    #[cfg(not(feature = "serial"))]
    async fn read(&mut self) -> Result<f64, DeviceError> {
        Err(DeviceError::Fatal("built without the `serial` feature".to_string()))
    }

    async fn close(&mut self) {
        #[cfg(feature = "serial")]
        {
            self.reader = None;
        }
        self.status = MeterStatus::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bridge_lines() {
        assert_eq!(parse_line("72.6\r\n").unwrap(), 72.6);
        assert!(parse_line("").is_err());
        assert!(parse_line("nan").is_err());
        assert!(matches!(parse_line("ovf"), Err(DeviceError::Transient(_))));
    }
}
