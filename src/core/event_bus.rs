// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Event bus for observability of the running pipeline

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::detection::{LevelReport, NoiseEvent};
use crate::dispatch::SinkAttempt;
use crate::sensors::Sample;

/// Event types in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    NoiseEvent,
    Level,
    SinkAttempt,
    Alert,
    SystemStatus,
}

/// Generic event wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Noise(NoiseEvent),
    Level(LevelReport),
    Attempt(SinkAttempt),
    Alert { level: String, message: String },
    Status { key: String, value: String },
}

/// Central event bus for pub/sub communication
pub struct EventBus {
    sample_tx: broadcast::Sender<Sample>,
    noise_tx: broadcast::Sender<NoiseEvent>,
    event_tx: broadcast::Sender<Event>,
    event_counter: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sample_tx, _) = broadcast::channel(capacity);
        let (noise_tx, _) = broadcast::channel(capacity);
        let (event_tx, _) = broadcast::channel(capacity);

        Self {
            sample_tx,
            noise_tx,
            event_tx,
            event_counter: AtomicU64::new(0),
        }
    }

    /// Raw samples go only to the sample channel
    pub fn publish_sample(&self, sample: Sample) {
        let _ = self.sample_tx.send(sample);
    }

    pub fn publish_noise_event(&self, event: NoiseEvent) {
        let _ = self.noise_tx.send(event.clone());
        self.publish_event(EventType::NoiseEvent, EventPayload::Noise(event));
    }

    pub fn publish_level(&self, report: LevelReport) {
        self.publish_event(EventType::Level, EventPayload::Level(report));
    }

    pub fn publish_attempt(&self, attempt: SinkAttempt) {
        self.publish_event(EventType::SinkAttempt, EventPayload::Attempt(attempt));
    }

    pub fn publish_alert(&self, level: &str, message: &str) {
        self.publish_event(
            EventType::Alert,
            EventPayload::Alert {
                level: level.to_string(),
                message: message.to_string(),
            },
        );
    }

    pub fn publish_status(&self, key: &str, value: &str) {
        self.publish_event(
            EventType::SystemStatus,
            EventPayload::Status {
                key: key.to_string(),
                value: value.to_string(),
            },
        );
    }

    fn publish_event(&self, event_type: EventType, payload: EventPayload) {
        let id = self.event_counter.fetch_add(1, Ordering::Relaxed);
        let event = Event {
            id,
            event_type,
            timestamp: Utc::now(),
            payload,
        };
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe_samples(&self) -> broadcast::Receiver<Sample> {
        self.sample_tx.subscribe()
    }

    pub fn subscribe_noise_events(&self) -> broadcast::Receiver<NoiseEvent> {
        self.noise_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::test_event;

    #[tokio::test]
    async fn test_noise_event_reaches_both_channels() {
        let bus = EventBus::new(16);
        let mut noise = bus.subscribe_noise_events();
        let mut events = bus.subscribe_events();

        bus.publish_alert("warn", "meter lost");
        bus.publish_noise_event(test_event(3, 90.0));

        assert_eq!(noise.recv().await.unwrap().id, 3);
        let first = events.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::Alert);
        let second = events.recv().await.unwrap();
        assert_eq!(second.event_type, EventType::NoiseEvent);
        assert_eq!(second.id, first.id + 1);
    }
}
