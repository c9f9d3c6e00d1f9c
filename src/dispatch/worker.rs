// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Per-sink delivery worker

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};

use super::circuit::{Admission, CircuitBreaker};
use super::retry::{deliver_with_retry, RetryPolicy};
use super::{AttemptStatus, SinkAttempt};
use crate::detection::{LevelReport, NoiseEvent};
use crate::enrichment::EnrichmentSnapshot;
use crate::sinks::{Notice, Sink, SinkKind};

/// Image reference shared between the capture worker and the other sinks of one event
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ImageSlot {
    Pending,
    Ready(Option<String>),
}

pub(crate) struct EventJob {
    pub event: Arc<NoiseEvent>,
    pub image: Arc<watch::Sender<ImageSlot>>,
    pub done: Option<oneshot::Sender<SinkAttempt>>,
}

pub(crate) enum Job {
    Event(EventJob),
    Level(LevelReport),
    Enrichment(EnrichmentSnapshot),
    Notice(Notice),
    /// Late image reference for an event the sink already holds
    ImageUpdate(Arc<NoiseEvent>),
}

impl Job {
    fn event_id(&self) -> Option<u64> {
        match self {
            Job::Event(job) => Some(job.event.id),
            _ => None,
        }
    }
}

/// Bounded memory of delivered event ids
struct DeliveredIds {
    capacity: usize,
    order: VecDeque<u64>,
    ids: HashSet<u64>,
}

impl DeliveredIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    fn contains(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }

    fn insert(&mut self, id: u64) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

pub(crate) struct WorkerSettings {
    pub retry: RetryPolicy,
    pub circuit_threshold: u32,
    pub circuit_cooldown: Duration,
    pub dedupe_capacity: usize,
}

/// Owns one sink; processes its queue in submission order
pub(crate) struct Worker {
    sink: Arc<dyn Sink>,
    rx: mpsc::Receiver<Job>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    delivered: DeliveredIds,
    attempts: broadcast::Sender<SinkAttempt>,
    abandon: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        sink: Arc<dyn Sink>,
        rx: mpsc::Receiver<Job>,
        settings: &WorkerSettings,
        attempts: broadcast::Sender<SinkAttempt>,
        abandon: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sink,
            rx,
            breaker: CircuitBreaker::new(settings.circuit_threshold, settings.circuit_cooldown),
            retry: settings.retry,
            delivered: DeliveredIds::new(settings.dedupe_capacity),
            attempts,
            abandon,
        }
    }

    /// Runs until the queue is closed and drained. Returns the number of abandoned jobs.
    pub async fn run(mut self) -> usize {
        let mut abandoned = 0;

        while let Some(job) = self.rx.recv().await {
            let event_id = job.event_id();

            if *self.abandon.borrow() {
                self.record_abandoned(event_id);
                abandoned += 1;
                continue;
            }

            let mut abandon = self.abandon.clone();
            let cut_short = tokio::select! {
                biased;
                _ = abandon_signalled(&mut abandon) => true,
                _ = self.handle(job) => false,
            };
            if cut_short {
                self.record_abandoned(event_id);
                abandoned += 1;
            }
        }

        debug!("Worker for sink {} stopped", self.sink.name());
        abandoned
    }

    async fn handle(&mut self, job: Job) {
        match job {
            Job::Event(job) => self.handle_event(job).await,
            Job::Level(report) => {
                if self.breaker.is_closed() {
                    let result = timeout(self.retry.attempt_timeout, self.sink.publish_level(&report)).await;
                    self.log_best_effort("level report", result.map_err(|_| ()));
                }
            }
            Job::Enrichment(snapshot) => {
                if self.breaker.is_closed() {
                    let result = timeout(self.retry.attempt_timeout, self.sink.publish_enrichment(&snapshot)).await;
                    self.log_best_effort("enrichment snapshot", result.map_err(|_| ()));
                }
            }
            Job::Notice(notice) => {
                if self.breaker.is_closed() {
                    let result = timeout(self.retry.attempt_timeout, self.sink.notice(&notice)).await;
                    self.log_best_effort("notice", result.map_err(|_| ()));
                }
            }
            Job::ImageUpdate(event) => self.handle_image_update(&event).await,
        }
    }

    /// Rewrites a stored event with its image reference. Never counts against the circuit.
    async fn handle_image_update(&self, event: &NoiseEvent) {
        let name = self.sink.name();
        if !self.breaker.is_closed() || !self.delivered.contains(event.id) {
            debug!("Sink {} skipped image update for event {}", name, event.id);
            return;
        }
        let outcome = deliver_with_retry(self.sink.as_ref(), event, &self.retry, self.retry.max_attempts, |_, _, _| {}).await;
        match outcome.result {
            Ok(_) => debug!("Sink {} attached image to event {}", name, event.id),
            Err(e) => warn!("Sink {} could not attach image to event {}: {}", name, event.id, e),
        }
    }

    fn log_best_effort(&self, what: &str, result: Result<Result<(), crate::error::SinkError>, ()>) {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Sink {} dropped {}: {}", self.sink.name(), what, e),
            Err(()) => debug!("Sink {} timed out on {}", self.sink.name(), what),
        }
    }

    async fn handle_event(&mut self, job: EventJob) {
        let attempt = self.deliver_event(&job.event, &job.image).await;

        if self.sink.kind() == SinkKind::ImageTrigger {
            let image_ref = attempt.image_ref.clone();
            job.image.send_if_modified(|slot| match slot {
                ImageSlot::Pending => {
                    *slot = ImageSlot::Ready(image_ref);
                    true
                }
                ImageSlot::Ready(_) => false,
            });
        }

        if let Some(done) = job.done {
            let _ = done.send(attempt);
        }
    }

    async fn deliver_event(&mut self, event: &NoiseEvent, image: &watch::Sender<ImageSlot>) -> SinkAttempt {
        let name = self.sink.name().to_string();

        if self.delivered.contains(event.id) {
            debug!("Sink {} already delivered event {}", name, event.id);
            return SinkAttempt::new(&name, event.id, AttemptStatus::Success, 0);
        }

        let max_attempts = match self.breaker.admit(Instant::now()) {
            Admission::Allow => self.retry.max_attempts,
            Admission::Trial => {
                debug!("Sink {} half-open, trying event {}", name, event.id);
                1
            }
            Admission::Reject => {
                let attempt = SinkAttempt::new(&name, event.id, AttemptStatus::SkippedCircuitOpen, 0);
                self.report(&attempt);
                return attempt;
            }
        };

        // Never wait on the camera; a capture that lands later arrives as an ImageUpdate
        let ready = match &*image.borrow() {
            ImageSlot::Ready(Some(image_ref)) if self.sink.kind() != SinkKind::ImageTrigger => Some(image_ref.clone()),
            _ => None,
        };
        let outgoing = match ready {
            Some(image_ref) => event.with_image_ref(Some(image_ref)),
            None => event.clone(),
        };

        let attempts = self.attempts.clone();
        let outcome = deliver_with_retry(self.sink.as_ref(), &outgoing, &self.retry, max_attempts, |n, e, delay| {
            let mut attempt = SinkAttempt::new(&name, event.id, AttemptStatus::Retrying, n);
            attempt.last_error = Some(e.to_string());
            warn!("Sink {} attempt {} for event {} failed, retrying in {:?}: {}", name, n, event.id, delay, e);
            let _ = attempts.send(attempt);
        })
        .await;

        let attempt = match outcome.result {
            Ok(delivered) => {
                self.breaker.record_success();
                self.delivered.insert(event.id);
                let mut attempt = SinkAttempt::new(&name, event.id, AttemptStatus::Success, outcome.attempts);
                attempt.image_ref = delivered.artifact;
                attempt
            }
            Err(e) => {
                if self.breaker.record_failure(Instant::now()) {
                    error!(
                        "Circuit opened for sink {} after {} consecutive failures",
                        name,
                        self.breaker.consecutive_failures()
                    );
                }
                let mut attempt = SinkAttempt::new(&name, event.id, AttemptStatus::Failed, outcome.attempts);
                attempt.last_error = Some(e.to_string());
                attempt
            }
        };

        self.report(&attempt);
        attempt
    }

    fn report(&self, attempt: &SinkAttempt) {
        attempt.log();
        let _ = self.attempts.send(attempt.clone());
    }

    fn record_abandoned(&self, event_id: Option<u64>) {
        match event_id {
            Some(id) => {
                let mut attempt = SinkAttempt::new(self.sink.name(), id, AttemptStatus::Failed, 0);
                attempt.last_error = Some("abandoned at shutdown".into());
                self.report(&attempt);
            }
            None => debug!("Sink {} abandoned a best-effort job at shutdown", self.sink.name()),
        }
    }
}

async fn abandon_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Dispatcher dropped without a shutdown; never abandon
            std::future::pending::<()>().await;
        }
    }
}

/// Wait up to `limit` for the capture worker to publish an image reference
pub(crate) async fn wait_for_image(mut rx: watch::Receiver<ImageSlot>, limit: Duration) -> Option<String> {
    let ready = timeout(limit, rx.wait_for(|slot| matches!(slot, ImageSlot::Ready(_)))).await;
    match ready {
        Ok(Ok(slot)) => match &*slot {
            ImageSlot::Ready(image_ref) => image_ref.clone(),
            ImageSlot::Pending => None,
        },
        _ => None,
    }
}

/// Hands a late image reference to sinks that already stored the event.
/// Gives up after `limit`, when the capture fails, or once shutdown abandons work.
pub(crate) async fn forward_image(
    event: Arc<NoiseEvent>,
    slot: watch::Receiver<ImageSlot>,
    followers: Vec<mpsc::Sender<Job>>,
    limit: Duration,
    mut abandon: watch::Receiver<bool>,
) {
    let image_ref = tokio::select! {
        biased;
        _ = abandon_signalled(&mut abandon) => return,
        image_ref = wait_for_image(slot, limit) => image_ref,
    };
    let Some(image_ref) = image_ref else {
        debug!("No image for event {} within {:?}", event.id, limit);
        return;
    };

    let update = Arc::new(event.with_image_ref(Some(image_ref)));
    for tx in followers {
        if let Err(e) = tx.try_send(Job::ImageUpdate(Arc::clone(&update))) {
            debug!("Dropped image update for event {}: {}", event.id, e);
        }
    }
}
