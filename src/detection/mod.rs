// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Detection module - noise event state machine and realtime level windows

mod detector;
mod window;

pub use detector::{DetectorState, EventDetector};
pub use window::{LevelReport, LevelWindow};

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::enrichment::EnrichmentSnapshot;

/// Why an event was closed before its level dropped back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradedReason {
    /// No samples for longer than the max gap
    SampleGap,
    /// Event hit the maximum duration cap
    MaxDuration,
    /// The meter was lost for good
    DeviceLost,
    /// Process shutting down with an event open
    Shutdown,
}

/// A completed noise event. Immutable once closed; `id` is the dedupe key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseEvent {
    pub id: u64,

    /// First qualifying sample
    pub start: DateTime<Utc>,

    /// Last qualifying sample
    pub end: DateTime<Utc>,

    /// When the detector decided the event was over
    pub closed_at: DateTime<Utc>,

    pub peak_db: f64,

    /// `end - start` in milliseconds
    pub duration_ms: i64,

    pub sample_count: u64,
    pub device_name: String,
    pub location: String,

    /// Snapshots copied from the enrichment cache at close time
    pub enrichment: Vec<EnrichmentSnapshot>,

    /// Peak crossed the image threshold
    pub image_requested: bool,
    pub image_ref: Option<String>,

    pub degraded: Option<DegradedReason>,
}

impl NoiseEvent {
    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.duration_ms)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn snapshot(&self, source: &str) -> Option<&EnrichmentSnapshot> {
        self.enrichment.iter().find(|s| s.source == source)
    }

    /// Copy carrying a captured image reference
    pub fn with_image_ref(&self, image_ref: Option<String>) -> NoiseEvent {
        NoiseEvent {
            image_ref,
            ..self.clone()
        }
    }

    /// One-line human readable summary for notifications
    pub fn summary(&self, timezone_offset_hours: i32) -> String {
        let local = FixedOffset::east_opt(timezone_offset_hours * 3600)
            .map(|tz| self.start.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| self.start.format("%Y-%m-%d %H:%M:%S UTC").to_string());

        let mut text = format!(
            "Noise event #{} on {}: peak {:.1} dB for {:.1}s at {}",
            self.id,
            self.device_name,
            self.peak_db,
            self.duration_ms as f64 / 1000.0,
            local
        );

        if let Some(weather) = self.snapshot("weather") {
            if let (Some(temp), Some(cond)) = (weather.number("temperature"), weather.text("conditions")) {
                text.push_str(&format!(" ({}, {:.1} C)", cond, temp));
            }
        }
        if let Some(reason) = self.degraded {
            text.push_str(&format!(" [partial: {:?}]", reason));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::EnrichmentSnapshot;
    use chrono::TimeZone;

    fn event() -> NoiseEvent {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 22, 15, 0).unwrap();
        NoiseEvent {
            id: 42,
            start,
            end: start + Duration::milliseconds(3500),
            closed_at: start + Duration::milliseconds(5500),
            peak_db: 91.26,
            duration_ms: 3500,
            sample_count: 35,
            device_name: "balcony".into(),
            location: "street".into(),
            enrichment: vec![EnrichmentSnapshot::new(
                "weather",
                [
                    ("temperature".to_string(), serde_json::json!(12.5)),
                    ("conditions".to_string(), serde_json::json!("light rain")),
                ]
                .into_iter()
                .collect(),
                600,
            )],
            image_requested: true,
            image_ref: None,
            degraded: None,
        }
    }

    #[test]
    fn test_summary_uses_local_time_and_weather() {
        let text = event().summary(2);
        assert!(text.contains("#42"));
        assert!(text.contains("91.3 dB"));
        assert!(text.contains("3.5s"));
        assert!(text.contains("2026-03-02 00:15:00"));
        assert!(text.contains("light rain, 12.5 C"));
    }

    #[test]
    fn test_with_image_ref_leaves_original_untouched() {
        let original = event();
        let copy = original.with_image_ref(Some("/img/a.jpg".into()));
        assert_eq!(copy.image_ref.as_deref(), Some("/img/a.jpg"));
        assert!(original.image_ref.is_none());
        assert_eq!(copy.id, original.id);
    }
}
