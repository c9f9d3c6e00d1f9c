// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Meter simulator for demo/testing

use async_trait::async_trait;
use rand::prelude::*;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

use super::{MeterKind, MeterStatus, SoundMeter};
use crate::error::DeviceError;

/// Simulates an outdoor meter: ambient drift plus occasional loud passes
pub struct SimulatedMeter {
    name: String,
    status: MeterStatus,
    rng: rand::rngs::StdRng,

    // Simulation state
    time: f64,
    ambient_db: f64,
    burst_probability: f64,
    burst_remaining: u32,
    burst_level: f64,
}

impl SimulatedMeter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: MeterStatus::Disconnected,
            rng: rand::rngs::StdRng::from_entropy(),
            time: 0.0,
            ambient_db: 55.0,
            burst_probability: 0.004,
            burst_remaining: 0,
            burst_level: 0.0,
        }
    }

    pub fn with_seed(name: &str, seed: u64) -> Self {
        Self {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
            ..Self::new(name)
        }
    }

    fn generate_level(&mut self) -> f64 {
        self.time += 0.1;

        // Slow day/night style drift around the ambient floor
        let mut level = self.ambient_db + 4.0 * (2.0 * PI * self.time / 600.0).sin();
        level += 1.5 * self.rng.sample::<f64, _>(StandardNormal);

        // Passing vehicle, horn, shout
        if self.burst_remaining == 0 && self.rng.gen::<f64>() < self.burst_probability {
            self.burst_remaining = self.rng.gen_range(10..80);
            self.burst_level = self.rng.gen_range(78.0..100.0);
        }

        if self.burst_remaining > 0 {
            self.burst_remaining -= 1;
            let jitter = self.rng.gen_range(-3.0..3.0);
            level = level.max(self.burst_level + jitter);
        }

        // Meter range is 30-130 dB
        level.clamp(30.0, 130.0)
    }
}

#[async_trait]
impl SoundMeter for SimulatedMeter {
    fn name(&self) -> &str { &self.name }
    fn kind(&self) -> MeterKind { MeterKind::Simulated }
    fn status(&self) -> MeterStatus { self.status }

    async fn open(&mut self) -> Result<(), DeviceError> {
        self.status = MeterStatus::Connected;
        Ok(())
    }

    async fn read(&mut self) -> Result<f64, DeviceError> {
        if self.status != MeterStatus::Connected {
            return Err(DeviceError::Transient("simulated meter closed".to_string()));
        }
        Ok(self.generate_level())
    }

    async fn close(&mut self) {
        self.status = MeterStatus::Disconnected;
    }
}

/// Replays a fixed script of readings and errors
#[cfg(test)]
pub(crate) struct ScriptedMeter {
    script: std::collections::VecDeque<Result<f64, DeviceError>>,
    reconnect_results: std::collections::VecDeque<Result<(), DeviceError>>,
    pub(crate) reconnects: std::sync::Arc<std::sync::atomic::AtomicU32>,
    status: MeterStatus,
}

#[cfg(test)]
impl ScriptedMeter {
    pub(crate) fn new(script: Vec<Result<f64, DeviceError>>) -> Self {
        Self {
            script: script.into(),
            reconnect_results: Default::default(),
            reconnects: Default::default(),
            status: MeterStatus::Disconnected,
        }
    }

    pub(crate) fn with_reconnects(mut self, results: Vec<Result<(), DeviceError>>) -> Self {
        self.reconnect_results = results.into();
        self
    }
}

#[cfg(test)]
#[async_trait]
impl SoundMeter for ScriptedMeter {
    fn name(&self) -> &str { "scripted" }
    fn kind(&self) -> MeterKind { MeterKind::Simulated }
    fn status(&self) -> MeterStatus { self.status }

    async fn open(&mut self) -> Result<(), DeviceError> {
        self.status = MeterStatus::Connected;
        Ok(())
    }

    async fn read(&mut self) -> Result<f64, DeviceError> {
        match self.script.pop_front() {
            Some(item) => item,
            // Script exhausted: behave like an unplugged meter
            None => Err(DeviceError::Fatal("script exhausted".to_string())),
        }
    }

    async fn reconnect(&mut self) -> Result<(), DeviceError> {
        self.reconnects.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.reconnect_results.pop_front().unwrap_or(Ok(()))
    }

    async fn close(&mut self) {
        self.status = MeterStatus::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_levels_stay_in_range() {
        let mut meter = SimulatedMeter::with_seed("sim", 7);
        assert!(meter.read().await.is_err());

        meter.open().await.unwrap();
        for _ in 0..5000 {
            let level = meter.read().await.unwrap();
            assert!((30.0..=130.0).contains(&level));
        }
    }
}
