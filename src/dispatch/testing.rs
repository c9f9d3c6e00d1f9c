//! Fake sinks shared by dispatcher tests

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use crate::detection::{LevelReport, NoiseEvent};
use crate::error::SinkError;
use crate::sinks::{Delivered, Notice, Sink, SinkKind};

pub fn test_event(id: u64, peak_db: f64) -> NoiseEvent {
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 22, 0, 0).unwrap() + chrono::Duration::seconds(id as i64);
    NoiseEvent {
        id,
        start,
        end: start + chrono::Duration::milliseconds(2000),
        closed_at: start + chrono::Duration::milliseconds(4000),
        peak_db,
        duration_ms: 2000,
        sample_count: 20,
        device_name: "test-meter".into(),
        location: "lab".into(),
        enrichment: Vec::new(),
        image_requested: false,
        image_ref: None,
        degraded: None,
    }
}

/// Scripted sink storing delivered events keyed by id
pub struct FlakySink {
    name: String,
    kind: SinkKind,
    durable: bool,
    script: Mutex<VecDeque<Result<Delivered, SinkError>>>,
    always_fail: Option<SinkError>,
    hang: bool,
    delay: Duration,
    writes_before_failing: bool,
    pub calls: AtomicU32,
    pub records: Mutex<BTreeMap<u64, NoiseEvent>>,
    pub levels: Mutex<Vec<LevelReport>>,
    pub notices: Mutex<Vec<Notice>>,
}

impl FlakySink {
    pub fn new(name: &str, script: Vec<Result<Delivered, SinkError>>) -> Self {
        Self {
            name: name.to_string(),
            kind: SinkKind::Storage,
            durable: true,
            script: Mutex::new(script.into()),
            always_fail: None,
            hang: false,
            delay: Duration::ZERO,
            writes_before_failing: false,
            calls: AtomicU32::new(0),
            records: Mutex::new(BTreeMap::new()),
            levels: Mutex::new(Vec::new()),
            notices: Mutex::new(Vec::new()),
        }
    }

    pub fn ok(name: &str) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn always_failing(name: &str) -> Self {
        Self {
            always_fail: Some(SinkError::Unreachable("connection refused".into())),
            ..Self::ok(name)
        }
    }

    pub fn hanging(name: &str) -> Self {
        Self {
            hang: true,
            ..Self::ok(name)
        }
    }

    pub fn kind(mut self, kind: SinkKind) -> Self {
        self.kind = kind;
        self.durable = kind == SinkKind::Storage;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Record the event even on attempts that then report failure
    pub fn writes_before_failing(mut self) -> Self {
        self.writes_before_failing = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for FlakySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        self.kind
    }

    fn durable(&self) -> bool {
        self.durable
    }

    fn wants(&self, event: &NoiseEvent) -> bool {
        self.kind != SinkKind::ImageTrigger || event.image_requested
    }

    async fn deliver(&self, event: &NoiseEvent) -> Result<Delivered, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;

        if let Some(err) = &self.always_fail {
            return Err(err.clone());
        }

        let next = self.script.lock().pop_front().unwrap_or_else(|| Ok(Delivered::done()));
        if next.is_ok() || self.writes_before_failing {
            self.records.lock().insert(event.id, event.clone());
        }
        match (next, self.kind) {
            (Ok(_), SinkKind::ImageTrigger) => Ok(Delivered::with_artifact(format!("/images/{}.jpg", event.id))),
            (other, _) => other,
        }
    }

    async fn publish_level(&self, report: &LevelReport) -> Result<(), SinkError> {
        self.levels.lock().push(*report);
        Ok(())
    }

    async fn notice(&self, notice: &Notice) -> Result<(), SinkError> {
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}
