// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Dispatch module - isolated, retried fan-out of events to sinks

mod circuit;
mod retry;
mod worker;
#[cfg(test)]
pub(crate) mod testing;

pub use circuit::{Admission, CircuitBreaker, CircuitState};
pub use retry::{deliver_with_retry, RetryOutcome, RetryPolicy};

use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::detection::{LevelReport, NoiseEvent};
use crate::enrichment::EnrichmentSnapshot;
use crate::sinks::{Notice, Sink, SinkKind};
use worker::{forward_image, EventJob, ImageSlot, Job, Worker, WorkerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    Success,
    Retrying,
    Failed,
    SkippedCircuitOpen,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::Retrying)
    }
}

/// Audit record for one sink's handling of one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkAttempt {
    pub sink_name: String,
    pub event_id: u64,
    pub status: AttemptStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Set by the image capture sink
    pub image_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SinkAttempt {
    pub fn new(sink_name: &str, event_id: u64, status: AttemptStatus, attempt_count: u32) -> Self {
        Self {
            sink_name: sink_name.to_string(),
            event_id,
            status,
            attempt_count,
            last_error: None,
            image_ref: None,
            timestamp: Utc::now(),
        }
    }

    pub fn log(&self) {
        let err = self.last_error.as_deref().unwrap_or("");
        match self.status {
            AttemptStatus::Success => debug!(
                "Event {} delivered to {} after {} attempt(s)",
                self.event_id, self.sink_name, self.attempt_count
            ),
            AttemptStatus::Retrying => warn!(
                "Event {} to {}: attempt {} failed: {}",
                self.event_id, self.sink_name, self.attempt_count, err
            ),
            AttemptStatus::Failed => warn!(
                "Event {} to {} failed after {} attempt(s): {}",
                self.event_id, self.sink_name, self.attempt_count, err
            ),
            AttemptStatus::SkippedCircuitOpen => warn!(
                "Event {} skipped for {}: circuit open",
                self.event_id, self.sink_name
            ),
        }
    }
}

/// Terminal attempts collected while waiting on an event's durable sinks
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub attempts: Vec<SinkAttempt>,
    /// Durable sinks still working when the wait ended
    pub outstanding: Vec<String>,
}

impl DispatchOutcome {
    pub fn attempt(&self, sink_name: &str) -> Option<&SinkAttempt> {
        self.attempts.iter().find(|a| a.sink_name == sink_name)
    }
}

/// Durable-sink completions for one submitted event
pub struct DispatchHandle {
    pub event_id: u64,
    pending: Vec<(String, oneshot::Receiver<SinkAttempt>)>,
    completed: Vec<SinkAttempt>,
}

impl DispatchHandle {
    /// Wait for durable sinks up to `limit`. Work still running afterwards continues in the background.
    pub async fn wait(self, limit: Duration) -> DispatchOutcome {
        let deadline = Instant::now() + limit;
        let results = join_all(self.pending.into_iter().map(|(name, rx)| async move {
            match timeout_at(deadline, rx).await {
                Ok(Ok(attempt)) => Ok(attempt),
                _ => Err(name),
            }
        }))
        .await;

        let mut outcome = DispatchOutcome {
            attempts: self.completed,
            outstanding: Vec::new(),
        };
        for result in results {
            match result {
                Ok(attempt) => outcome.attempts.push(attempt),
                Err(name) => outcome.outstanding.push(name),
            }
        }
        if !outcome.outstanding.is_empty() {
            warn!(
                "Event {} still pending on {} after {:?}; continuing in background",
                self.event_id,
                outcome.outstanding.join(", "),
                limit
            );
        }
        outcome
    }
}

struct WorkerHandle {
    sink: Arc<dyn Sink>,
    tx: mpsc::Sender<Job>,
}

/// Fans events out to one worker task per sink
pub struct Dispatcher {
    workers: Vec<WorkerHandle>,
    tasks: Vec<JoinHandle<usize>>,
    attempts: broadcast::Sender<SinkAttempt>,
    abandon: watch::Sender<bool>,
    durable_timeout: Duration,
    image_wait: Duration,
}

impl Dispatcher {
    /// Spawns the sink workers; must be called inside a tokio runtime
    pub fn new(sinks: Vec<Arc<dyn Sink>>, config: &DispatchConfig) -> Self {
        let (attempts, _) = broadcast::channel(256);
        let (abandon, abandon_rx) = watch::channel(false);
        let settings = WorkerSettings {
            retry: RetryPolicy::from_config(config),
            circuit_threshold: config.circuit_failure_threshold,
            circuit_cooldown: Duration::from_secs(config.circuit_cooldown_secs),
            dedupe_capacity: config.dedupe_capacity,
        };

        let mut workers = Vec::with_capacity(sinks.len());
        let mut tasks = Vec::with_capacity(sinks.len());
        for sink in sinks {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            let worker = Worker::new(sink.clone(), rx, &settings, attempts.clone(), abandon_rx.clone());
            tasks.push(tokio::spawn(worker.run()));
            workers.push(WorkerHandle { sink, tx });
        }

        info!("Dispatcher started with {} sink(s)", workers.len());
        Self {
            workers,
            tasks,
            attempts,
            abandon,
            durable_timeout: Duration::from_millis(config.durable_timeout_ms),
            image_wait: Duration::from_millis(config.image_wait_ms),
        }
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.sink.name().to_string()).collect()
    }

    /// Every SinkAttempt produced by the workers
    pub fn subscribe_attempts(&self) -> broadcast::Receiver<SinkAttempt> {
        self.attempts.subscribe()
    }

    /// Enqueue `event` on every interested sink without waiting
    pub fn submit(&self, event: NoiseEvent) -> DispatchHandle {
        let event = Arc::new(event);

        let captures = event.image_requested
            && self
                .workers
                .iter()
                .any(|w| w.sink.kind() == SinkKind::ImageTrigger && w.sink.wants(&event));
        let initial = if captures { ImageSlot::Pending } else { ImageSlot::Ready(None) };
        let image = Arc::new(watch::channel(initial).0);

        let mut followers = Vec::new();
        let mut handle = DispatchHandle {
            event_id: event.id,
            pending: Vec::new(),
            completed: Vec::new(),
        };

        for worker in &self.workers {
            if !worker.sink.wants(&event) {
                continue;
            }
            let durable = worker.sink.durable();
            let (done_tx, done_rx) = if durable {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

            let job = Job::Event(EventJob {
                event: Arc::clone(&event),
                image: Arc::clone(&image),
                done: done_tx,
            });

            match worker.tx.try_send(job) {
                Ok(()) => {
                    if captures && worker.sink.takes_image_updates() {
                        followers.push(worker.tx.clone());
                    }
                    if let Some(rx) = done_rx {
                        handle.pending.push((worker.sink.name().to_string(), rx));
                    }
                }
                Err(e) => {
                    let reason = match e {
                        mpsc::error::TrySendError::Full(_) => "queue full",
                        mpsc::error::TrySendError::Closed(_) => "worker stopped",
                    };
                    let mut attempt = SinkAttempt::new(worker.sink.name(), event.id, AttemptStatus::Failed, 0);
                    attempt.last_error = Some(reason.to_string());
                    attempt.log();
                    let _ = self.attempts.send(attempt.clone());

                    if worker.sink.kind() == SinkKind::ImageTrigger {
                        image.send_replace(ImageSlot::Ready(None));
                    }
                    if durable {
                        handle.completed.push(attempt);
                    }
                }
            }
        }

        if captures && !followers.is_empty() {
            tokio::spawn(forward_image(
                Arc::clone(&event),
                image.subscribe(),
                followers,
                self.image_wait,
                self.abandon.subscribe(),
            ));
        }

        debug!("Event {} submitted to dispatcher", event.id);
        handle
    }

    /// Submit and wait for durable sinks up to the configured timeout
    pub async fn dispatch(&self, event: NoiseEvent) -> DispatchOutcome {
        self.submit(event).wait(self.durable_timeout).await
    }

    pub fn publish_level(&self, report: LevelReport) {
        self.broadcast_best_effort("level report", || Job::Level(report));
    }

    pub fn publish_enrichment(&self, snapshot: EnrichmentSnapshot) {
        self.broadcast_best_effort("enrichment snapshot", || Job::Enrichment(snapshot.clone()));
    }

    pub fn notice(&self, notice: Notice) {
        self.broadcast_best_effort("notice", || Job::Notice(notice.clone()));
    }

    fn broadcast_best_effort<F: Fn() -> Job>(&self, what: &str, job: F) {
        for worker in &self.workers {
            if let Err(e) = worker.tx.try_send(job()) {
                debug!("Dropped {} for {}: {}", what, worker.sink.name(), e);
            }
        }
    }

    /// Stop accepting work, give in-flight deliveries `grace` to finish, then abandon
    /// the rest. Returns the number of abandoned jobs.
    pub async fn shutdown(mut self, grace: Duration) -> usize {
        info!("Dispatcher shutting down, grace period {:?}", grace);
        self.workers.clear();

        let deadline = Instant::now() + grace;
        let mut abandoned = 0;
        let mut remaining = Vec::new();

        for mut task in std::mem::take(&mut self.tasks) {
            match timeout_at(deadline, &mut task).await {
                Ok(result) => abandoned += result.unwrap_or(0),
                Err(_) => remaining.push(task),
            }
        }

        if !remaining.is_empty() {
            warn!("Grace period elapsed, abandoning remaining deliveries");
            let _ = self.abandon.send(true);
            for task in remaining {
                abandoned += task.await.unwrap_or(0);
            }
        }

        if abandoned > 0 {
            warn!("{} delivery job(s) abandoned at shutdown", abandoned);
        }
        abandoned
    }
}
