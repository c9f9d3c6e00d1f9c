// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Sampler - owns the meter connection and produces timestamped samples

use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Sample, SimulatedMeter, SoundMeter, SerialBridgeMeter, UsbSoundMeter};
use super::usb::{load_usb_ids, parse_hex};
use crate::config::{DeviceConfig, Transport};
use crate::core::Backoff;
use crate::error::DeviceError;

/// What the sampler hands to the detector
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerItem {
    Sample(Sample),
    /// The meter stopped answering; no samples until `Reconnected`
    Disconnected { error: DeviceError },
    Reconnected,
}

/// Produces samples at a fixed cadence, reconnecting on transient failures
pub struct Sampler {
    meter: Box<dyn SoundMeter>,
    ticker: Interval,
    backoff: Backoff,
    max_reconnect_attempts: Option<u32>,
    connected: bool,
    stopped: bool,
}

impl Sampler {
    pub fn new(meter: Box<dyn SoundMeter>, config: &DeviceConfig) -> Self {
        let mut ticker = interval(config.sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            meter,
            ticker,
            backoff: Backoff::new(
                Duration::from_millis(config.reconnect_base_ms),
                Duration::from_millis(config.reconnect_max_ms),
            ),
            max_reconnect_attempts: config.max_reconnect_attempts,
            connected: false,
            stopped: false,
        }
    }

    /// Build the meter selected by the configuration
    pub fn meter_from_config(config: &DeviceConfig, demo_mode: bool) -> Box<dyn SoundMeter> {
        if demo_mode {
            return Box::new(SimulatedMeter::new(&config.device_name));
        }

        match config.transport {
            Transport::Usb => {
                let explicit = match (&config.usb_vendor_id, &config.usb_product_id) {
                    (Some(v), Some(p)) => parse_hex(v).zip(parse_hex(p)),
                    _ => None,
                };
                Box::new(UsbSoundMeter::new(explicit, load_usb_ids(&config.usb_ids_path)))
            }
            Transport::Serial => {
                let port = config.serial_port.clone().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
                Box::new(SerialBridgeMeter::new(&port, config.baud_rate))
            }
            Transport::Simulated => Box::new(SimulatedMeter::new(&config.device_name)),
        }
    }

    pub fn meter_name(&self) -> &str {
        self.meter.name()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Open the meter. A transient failure leaves the sampler in reconnect mode.
    pub async fn start(&mut self) -> Result<(), DeviceError> {
        match self.meter.open().await {
            Ok(()) => {
                info!("Sound meter ready: {}", self.meter.name());
                self.connected = true;
                Ok(())
            }
            Err(DeviceError::Transient(e)) => {
                warn!("Sound meter not available yet ({}), will keep retrying", e);
                self.connected = false;
                Ok(())
            }
            Err(fatal) => Err(fatal),
        }
    }

    /// Next item in the stream. `Ok(None)` after `stop`, `Err` only on fatal loss.
    pub async fn next(&mut self) -> Result<Option<SamplerItem>, DeviceError> {
        if self.stopped {
            return Ok(None);
        }

        if !self.connected {
            return self.reconnect().await.map(Some);
        }

        self.ticker.tick().await;

        match self.meter.read().await {
            Ok(level_db) => Ok(Some(SamplerItem::Sample(Sample::now(level_db)))),
            Err(DeviceError::Transient(e)) => {
                warn!("Transient read error from {}: {}", self.meter.name(), e);
                self.connected = false;
                Ok(Some(SamplerItem::Disconnected { error: DeviceError::Transient(e) }))
            }
            Err(fatal) => {
                error!("Fatal read error from {}: {}", self.meter.name(), fatal);
                Err(fatal)
            }
        }
    }

    async fn reconnect(&mut self) -> Result<SamplerItem, DeviceError> {
        loop {
            if let Some(max) = self.max_reconnect_attempts {
                if self.backoff.attempts() >= max {
                    return Err(DeviceError::Fatal(format!(
                        "device did not come back after {} reconnect attempts",
                        max
                    )));
                }
            }

            let delay = self.backoff.next_delay();
            debug!("Reconnecting to sound meter in {:?} (attempt {})", delay, self.backoff.attempts());
            tokio::time::sleep(delay).await;

            match self.meter.reconnect().await {
                Ok(()) => {
                    info!("Reconnected to {} after {} attempts", self.meter.name(), self.backoff.attempts());
                    self.backoff.reset();
                    self.connected = true;
                    self.ticker.reset();
                    return Ok(SamplerItem::Reconnected);
                }
                Err(DeviceError::Transient(e)) => {
                    debug!("Reconnect failed: {}", e);
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }

    /// Deliberate shutdown; the sampler cannot be restarted afterwards
    pub async fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.connected = false;
            self.meter.close().await;
            info!("Sampler stopped");
        }
    }

    /// Feed the pipeline until shutdown, channel closure or fatal loss
    pub async fn run(
        mut self,
        tx: mpsc::Sender<SamplerItem>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), DeviceError> {
        self.start().await?;

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break Ok(()),
                item = self.next() => match item {
                    Ok(Some(item)) => {
                        if tx.send(item).await.is_err() {
                            break Ok(());
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
            }
        };

        self.stop().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::simulator::ScriptedMeter;
    use std::sync::atomic::Ordering;

    fn config() -> DeviceConfig {
        DeviceConfig {
            sample_interval_ms: 100,
            reconnect_base_ms: 100,
            reconnect_max_ms: 400,
            ..DeviceConfig::default()
        }
    }

    fn level(item: Option<SamplerItem>) -> f64 {
        match item {
            Some(SamplerItem::Sample(s)) => s.level_db,
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_reconnects_and_resumes() {
        let meter = ScriptedMeter::new(vec![
            Ok(70.0),
            Err(DeviceError::Transient("busy".into())),
            Ok(85.0),
        ])
        .with_reconnects(vec![Err(DeviceError::Transient("still gone".into())), Ok(())]);
        let reconnects = meter.reconnects.clone();

        let mut sampler = Sampler::new(Box::new(meter), &config());
        sampler.start().await.unwrap();

        assert_eq!(level(sampler.next().await.unwrap()), 70.0);
        assert!(matches!(sampler.next().await.unwrap(), Some(SamplerItem::Disconnected { .. })));
        assert!(!sampler.is_connected());
        assert_eq!(sampler.next().await.unwrap(), Some(SamplerItem::Reconnected));
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);
        assert_eq!(level(sampler.next().await.unwrap()), 85.0);

        // Script exhausted -> fatal
        assert!(sampler.next().await.unwrap_err().is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_ceiling_turns_fatal() {
        let meter = ScriptedMeter::new(vec![Err(DeviceError::Transient("unplugged".into()))])
            .with_reconnects(vec![
                Err(DeviceError::Transient("gone".into())),
                Err(DeviceError::Transient("gone".into())),
                Err(DeviceError::Transient("gone".into())),
            ]);
        let reconnects = meter.reconnects.clone();

        let mut sampler = Sampler::new(
            Box::new(meter),
            &DeviceConfig { max_reconnect_attempts: Some(2), ..config() },
        );
        sampler.start().await.unwrap();

        assert!(matches!(sampler.next().await.unwrap(), Some(SamplerItem::Disconnected { .. })));
        let err = sampler.next().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_sampler_produces_nothing() {
        let mut sampler = Sampler::new(Box::new(ScriptedMeter::new(vec![Ok(60.0)])), &config());
        sampler.start().await.unwrap();
        sampler.stop().await;
        assert_eq!(sampler.next().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_forwards_until_fatal() {
        let meter = ScriptedMeter::new(vec![Ok(61.0), Ok(62.0)]);
        let sampler = Sampler::new(Box::new(meter), &config());
        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let result = sampler.run(tx, shutdown_rx).await;
        assert!(result.unwrap_err().is_fatal());

        assert_eq!(level(rx.recv().await), 61.0);
        assert_eq!(level(rx.recv().await), 62.0);
        assert!(rx.recv().await.is_none());
    }
}
