//! Core engine module - wires sampler, detector and dispatcher together

mod backoff;
mod engine;
mod scheduler;
mod event_bus;

pub use backoff::Backoff;
pub use engine::Engine;
pub use scheduler::Scheduler;
pub use event_bus::{EventBus, Event, EventPayload, EventType};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System-wide state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub running: bool,
    pub device_connected: bool,
    pub total_samples: u64,
    pub total_events: u64,
    pub degraded_events: u64,
    pub delivery_failures: u64,
    pub uptime_seconds: u64,
    pub last_event: Option<DateTime<Utc>>,
    pub last_peak_db: Option<f64>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            running: false,
            device_connected: false,
            total_samples: 0,
            total_events: 0,
            degraded_events: 0,
            delivery_failures: 0,
            uptime_seconds: 0,
            last_event: None,
            last_peak_db: None,
        }
    }
}
