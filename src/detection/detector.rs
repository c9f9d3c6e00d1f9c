// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Threshold/hysteresis state machine turning samples into noise events

use std::sync::Arc;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{DegradedReason, NoiseEvent};
use crate::config::DetectionConfig;
use crate::enrichment::EnrichmentCache;
use crate::sensors::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorState {
    Idle,
    Active,
    Releasing,
}

#[derive(Debug, Clone)]
struct Accumulator {
    start: DateTime<Utc>,
    last_qualifying: DateTime<Utc>,
    last_sample: DateTime<Utc>,
    peak: f64,
    samples_seen: u64,
    samples_at_last_qualifying: u64,
}

impl Accumulator {
    fn open(sample: &Sample) -> Self {
        Self {
            start: sample.timestamp,
            last_qualifying: sample.timestamp,
            last_sample: sample.timestamp,
            peak: sample.level_db,
            samples_seen: 1,
            samples_at_last_qualifying: 1,
        }
    }

    fn observe(&mut self, sample: &Sample) {
        self.last_sample = sample.timestamp;
        self.samples_seen += 1;
    }

    fn qualify(&mut self, sample: &Sample) {
        self.last_qualifying = sample.timestamp;
        self.peak = self.peak.max(sample.level_db);
        self.samples_at_last_qualifying = self.samples_seen;
    }
}

/// Single-writer event detector. Time comes from sample timestamps and ticks.
pub struct EventDetector {
    threshold: f64,
    image_threshold: f64,
    release_delay: Duration,
    open_dwell: Duration,
    max_gap: Duration,
    max_duration: Duration,

    state: DetectorState,
    current: Option<Accumulator>,
    // Pending open while the dwell time runs
    candidate: Option<Accumulator>,

    next_id: u64,
    device_name: String,
    location: String,
    enrichment: Option<Arc<EnrichmentCache>>,
}

impl EventDetector {
    pub fn new(config: &DetectionConfig, device_name: &str, location: &str, first_id: u64) -> Self {
        Self {
            threshold: config.threshold_db,
            image_threshold: config.image_threshold_db,
            release_delay: Duration::milliseconds(config.release_delay_ms as i64),
            open_dwell: Duration::milliseconds(config.open_dwell_ms as i64),
            max_gap: Duration::milliseconds(config.max_gap_ms as i64),
            max_duration: Duration::seconds(config.max_event_duration_secs as i64),
            state: DetectorState::Idle,
            current: None,
            candidate: None,
            next_id: first_id,
            device_name: device_name.to_string(),
            location: location.to_string(),
            enrichment: None,
        }
    }

    /// Attach enrichment snapshots from this cache when events close
    pub fn with_enrichment(mut self, cache: Arc<EnrichmentCache>) -> Self {
        self.enrichment = Some(cache);
        self
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == DetectorState::Idle
    }

    /// Feed one sample; returns an event if this sample closed one
    pub fn on_sample(&mut self, sample: Sample) -> Option<NoiseEvent> {
        let mut closed = None;

        // Samples resumed after a silence the tick did not see
        let gap = self
            .current
            .as_ref()
            .is_some_and(|acc| sample.timestamp - acc.last_sample > self.max_gap);
        if gap {
            closed = self.close(sample.timestamp, Some(DegradedReason::SampleGap));
        }

        let qualifies = sample.level_db >= self.threshold;

        match self.state {
            DetectorState::Idle => {
                if qualifies {
                    self.arm(&sample);
                } else if self.candidate.take().is_some() {
                    debug!("Level dropped before dwell time elapsed, not opening");
                }
            }
            DetectorState::Active | DetectorState::Releasing => {
                if let Some(acc) = self.current.as_mut() {
                    acc.observe(&sample);
                    if qualifies {
                        acc.qualify(&sample);
                        self.state = DetectorState::Active;
                    } else {
                        self.state = DetectorState::Releasing;
                    }
                }

                if self.release_elapsed(sample.timestamp) {
                    closed = self.close(sample.timestamp, None);
                } else if self.duration_capped() {
                    closed = self.close(sample.timestamp, Some(DegradedReason::MaxDuration));
                }
            }
        }

        closed
    }

    /// Periodic check while samples may not be arriving
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Option<NoiseEvent> {
        if self
            .candidate
            .as_ref()
            .is_some_and(|c| now - c.last_sample > self.max_gap)
        {
            self.candidate = None;
        }

        let acc = self.current.as_ref()?;
        if now - acc.last_sample > self.max_gap {
            info!("No samples for {} ms, closing event early", (now - acc.last_sample).num_milliseconds());
            return self.close(now, Some(DegradedReason::SampleGap));
        }
        if self.release_elapsed(now) {
            return self.close(now, None);
        }
        None
    }

    /// Force-close whatever is open
    pub fn flush(&mut self, now: DateTime<Utc>, reason: DegradedReason) -> Option<NoiseEvent> {
        self.candidate = None;
        self.close(now, Some(reason))
    }

    fn arm(&mut self, sample: &Sample) {
        match self.candidate.as_mut() {
            Some(c) => {
                c.observe(sample);
                c.qualify(sample);
            }
            None => self.candidate = Some(Accumulator::open(sample)),
        }

        let dwelled = self
            .candidate
            .as_ref()
            .is_some_and(|c| c.last_qualifying - c.start >= self.open_dwell);
        if dwelled {
            if let Some(acc) = self.candidate.take() {
                debug!("Noise event opened at {} ({:.1} dB)", acc.start, acc.peak);
                self.current = Some(acc);
                self.state = DetectorState::Active;
            }
        }
    }

    fn release_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.state == DetectorState::Releasing
            && self
                .current
                .as_ref()
                .is_some_and(|acc| now - acc.last_qualifying >= self.release_delay)
    }

    fn duration_capped(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|acc| acc.last_qualifying - acc.start >= self.max_duration)
    }

    fn close(&mut self, closed_at: DateTime<Utc>, degraded: Option<DegradedReason>) -> Option<NoiseEvent> {
        let acc = self.current.take()?;
        self.state = DetectorState::Idle;

        let id = self.next_id;
        self.next_id += 1;

        let enrichment = self
            .enrichment
            .as_ref()
            .map(|cache| cache.snapshot_all())
            .unwrap_or_default();

        let event = NoiseEvent {
            id,
            start: acc.start,
            end: acc.last_qualifying,
            closed_at,
            peak_db: acc.peak,
            duration_ms: (acc.last_qualifying - acc.start).num_milliseconds(),
            sample_count: acc.samples_at_last_qualifying,
            device_name: self.device_name.clone(),
            location: self.location.clone(),
            enrichment,
            image_requested: acc.peak >= self.image_threshold,
            image_ref: None,
            degraded,
        };

        info!(
            "Noise event #{} closed: peak {:.1} dB, {} ms{}",
            event.id,
            event.peak_db,
            event.duration_ms,
            degraded.map(|r| format!(" (degraded: {:?})", r)).unwrap_or_default()
        );

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + Duration::milliseconds(ms)
    }

    fn config() -> DetectionConfig {
        DetectionConfig {
            threshold_db: 80.0,
            image_threshold_db: 90.0,
            release_delay_ms: 2000,
            open_dwell_ms: 0,
            max_gap_ms: 3000,
            max_event_duration_secs: 60,
            ..DetectionConfig::default()
        }
    }

    fn detector(config: &DetectionConfig) -> EventDetector {
        EventDetector::new(config, "meter", "street", 1)
    }

    /// Feed levels at a fixed interval and collect emitted events
    fn run(detector: &mut EventDetector, levels: &[f64], interval_ms: i64) -> Vec<NoiseEvent> {
        levels
            .iter()
            .enumerate()
            .filter_map(|(i, &db)| detector.on_sample(Sample::new(at(i as i64 * interval_ms), db)))
            .collect()
    }

    #[test]
    fn test_single_event_with_release_delay() {
        let mut d = detector(&config());
        let events = run(&mut d, &[60.0, 85.0, 90.0, 88.0, 60.0, 60.0], 1000);

        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.peak_db, 90.0);
        assert_eq!(e.start, at(1000));
        assert_eq!(e.end, at(3000));
        assert_eq!(e.closed_at, at(5000));
        assert_eq!(e.duration_ms, 2000);
        assert_eq!(e.sample_count, 3);
        assert!(e.image_requested);
        assert!(!e.is_degraded());
        assert_eq!(d.state(), DetectorState::Idle);
    }

    #[test]
    fn test_release_pending_until_delay_elapses() {
        let mut d = detector(&config());
        assert!(run(&mut d, &[60.0, 85.0, 60.0], 1000).is_empty());
        assert_eq!(d.state(), DetectorState::Releasing);
    }

    #[test]
    fn test_short_dip_does_not_split_event() {
        let mut d = detector(&config());
        let events = run(&mut d, &[85.0, 84.0, 70.0, 86.0, 82.0, 60.0, 60.0, 60.0], 1000);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].start, at(0));
        assert_eq!(events[0].end, at(4000));
        assert_eq!(events[0].peak_db, 86.0);
        // The dip sample sits inside the event
        assert_eq!(events[0].sample_count, 5);
        assert!(!events[0].image_requested);
    }

    #[test]
    fn test_long_dip_splits_into_two_events() {
        let mut d = detector(&config());
        let events = run(&mut d, &[85.0, 60.0, 60.0, 60.0, 95.0, 60.0, 60.0], 1000);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].peak_db, 85.0);
        assert_eq!(events[1].peak_db, 95.0);
        assert!(events[1].id > events[0].id);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut d = detector(&config());
        let events = run(&mut d, &[80.0, 79.9, 79.9, 79.9], 1000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].peak_db, 80.0);
        assert_eq!(events[0].duration_ms, 0);
    }

    #[test]
    fn test_gap_force_closes_degraded_event() {
        let mut d = detector(&config());
        assert!(run(&mut d, &[70.0, 88.0, 95.0], 1000).is_empty());
        assert_eq!(d.state(), DetectorState::Active);

        // Device went quiet after the 95 dB sample at t=2000
        assert!(d.on_tick(at(4000)).is_none());
        let event = d.on_tick(at(5001)).unwrap();

        assert_eq!(event.degraded, Some(DegradedReason::SampleGap));
        assert_eq!(event.peak_db, 95.0);
        assert_eq!(event.end, at(2000));
        assert_eq!(event.closed_at, at(5001));
        assert!(d.is_idle());
    }

    #[test]
    fn test_gap_detected_on_resumed_sample() {
        let mut d = detector(&config());
        run(&mut d, &[88.0], 1000);

        // No tick ran; the next sample arrives 10 s later and opens a fresh event
        let closed = d.on_sample(Sample::new(at(10_000), 90.0)).unwrap();
        assert_eq!(closed.degraded, Some(DegradedReason::SampleGap));
        assert_eq!(closed.peak_db, 88.0);
        assert_eq!(d.state(), DetectorState::Active);
    }

    #[test]
    fn test_tick_closes_release_without_samples() {
        let mut d = detector(&config());
        run(&mut d, &[85.0, 60.0], 1000);
        assert!(d.on_tick(at(1500)).is_none());
        let event = d.on_tick(at(2000)).unwrap();
        assert!(!event.is_degraded());
        assert_eq!(event.end, at(0));
    }

    #[test]
    fn test_max_duration_caps_continuous_noise() {
        let mut config = config();
        config.max_event_duration_secs = 5;
        let mut d = detector(&config);

        let events = run(&mut d, &[85.0; 9], 1000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].degraded, Some(DegradedReason::MaxDuration));
        assert_eq!(events[0].duration_ms, 5000);
        // The remaining loud samples opened a new event
        assert_eq!(d.state(), DetectorState::Active);
    }

    #[test]
    fn test_open_dwell_requires_sustained_level() {
        let mut config = config();
        config.open_dwell_ms = 1500;
        let mut d = detector(&config);

        // Single spikes never open
        assert!(run(&mut d, &[85.0, 60.0, 85.0, 60.0], 1000).is_empty());
        assert!(d.is_idle());

        let mut d = detector(&config);
        run(&mut d, &[85.0, 86.0, 92.0], 1000);
        assert_eq!(d.state(), DetectorState::Active);
        let event = d.flush(at(3000), DegradedReason::Shutdown).unwrap();
        // Start is the first crossing, not the moment the dwell completed
        assert_eq!(event.start, at(0));
        assert_eq!(event.peak_db, 92.0);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut d = EventDetector::new(&config(), "meter", "street", 1000);
        let events = run(&mut d, &[85.0, 60.0, 60.0, 85.0, 60.0, 60.0, 85.0, 60.0, 60.0], 1000);
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1000, 1001, 1002]);
    }

    #[test]
    fn test_event_invariants_hold_for_noisy_stream() {
        let levels: Vec<f64> = (0..500).map(|i| 70.0 + ((i * 37) % 23) as f64).collect();
        let mut d = detector(&config());
        for event in run(&mut d, &levels, 250) {
            assert!(event.end >= event.start);
            assert!(event.peak_db >= 80.0);
            assert_eq!(event.duration(), event.end - event.start);
        }
    }

    #[test]
    fn test_flush_when_idle_is_noop() {
        let mut d = detector(&config());
        assert!(d.flush(at(0), DegradedReason::DeviceLost).is_none());
    }
}
