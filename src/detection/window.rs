//! Fixed-window peak level aggregation for realtime publishing

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::sensors::Sample;

/// Peak level over one completed window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelReport {
    /// End of the window
    pub timestamp: DateTime<Utc>,
    pub peak_db: f64,
    pub sample_count: u64,
}

pub struct LevelWindow {
    length: Duration,
    started: Option<DateTime<Utc>>,
    peak: f64,
    count: u64,
}

impl LevelWindow {
    pub fn new(length_secs: u64) -> Self {
        Self {
            length: Duration::seconds(length_secs.max(1) as i64),
            started: None,
            peak: f64::MIN,
            count: 0,
        }
    }

    /// Add a sample; returns the previous window once it is complete
    pub fn push(&mut self, sample: &Sample) -> Option<LevelReport> {
        let report = match self.started {
            Some(start) if sample.timestamp - start >= self.length => {
                let report = LevelReport {
                    timestamp: sample.timestamp,
                    peak_db: self.peak,
                    sample_count: self.count,
                };
                self.reset();
                Some(report)
            }
            _ => None,
        };

        self.started.get_or_insert(sample.timestamp);
        self.peak = self.peak.max(sample.level_db);
        self.count += 1;

        report
    }

    /// Discard a partial window, e.g. after a disconnect
    pub fn reset(&mut self) {
        self.started = None;
        self.peak = f64::MIN;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_reports_peak_of_completed_window() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut window = LevelWindow::new(10);

        let mut reports = Vec::new();
        for (i, db) in [55.0, 71.5, 60.0, 58.0].iter().enumerate() {
            let sample = Sample::new(t0 + Duration::seconds(i as i64 * 4), *db);
            reports.extend(window.push(&sample));
        }

        // Samples at 0, 4, 8 form the first window; 12 s closes it
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].peak_db, 71.5);
        assert_eq!(reports[0].sample_count, 3);
        assert_eq!(reports[0].timestamp, t0 + Duration::seconds(12));
    }
}
