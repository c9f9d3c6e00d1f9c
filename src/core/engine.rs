// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Main monitoring engine

use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::Result;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, IdleDisconnectPolicy};
use crate::db::Database;
use crate::detection::{DegradedReason, EventDetector, LevelReport, LevelWindow, NoiseEvent};
use crate::dispatch::{AttemptStatus, Dispatcher};
use crate::enrichment::{build_cache, EnrichmentSnapshot};
use crate::error::DeviceError;
use crate::sensors::{Sampler, SamplerItem, SoundMeter};
use crate::sinks::{cleanup_images, startup_notice, Notice, NoticeKind, Sink};
use super::{EventBus, Scheduler, SystemState};

const SAMPLE_QUEUE: usize = 256;
const COMMAND_QUEUE: usize = 128;
const BUS_CAPACITY: usize = 1024;

/// Work handed from the detection loop to the dispatcher task
enum Command {
    Event(NoiseEvent),
    Level(LevelReport),
    Notice(Notice),
}

/// Main Noise Buster engine
pub struct Engine {
    pub config: Arc<Config>,
    state: Arc<RwLock<SystemState>>,
    bus: Arc<EventBus>,
    shutdown: broadcast::Sender<()>,
    start_time: Option<Instant>,
}

impl Engine {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let (shutdown, _) = broadcast::channel(4);

        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(RwLock::new(SystemState::default())),
            bus: Arc::new(EventBus::new(BUS_CAPACITY)),
            shutdown,
            start_time: None,
        })
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Sending on this stops sampling; `run` then drains and returns
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub async fn state(&self) -> SystemState {
        let mut state = self.state.read().await.clone();
        state.uptime_seconds = self.uptime();
        state
    }

    pub fn uptime(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Run until shutdown is requested or the meter is lost for good.
    /// Returns an error only for fatal device loss.
    pub async fn run(&mut self, meter: Box<dyn SoundMeter>, sinks: Vec<Arc<dyn Sink>>) -> Result<()> {
        info!("Starting Noise Buster engine...");
        self.start_time = Some(Instant::now());
        self.state.write().await.running = true;

        let cache = Arc::new(build_cache(&self.config.enrichment));
        let mut background = cache.spawn_refreshers(&self.shutdown);

        let dispatcher = Dispatcher::new(sinks, &self.config.dispatch);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let dispatch_task = tokio::spawn(dispatch_loop(
            dispatcher,
            cmd_rx,
            cache.subscribe(),
            Arc::clone(&self.bus),
            Arc::clone(&self.state),
            Duration::from_millis(self.config.dispatch.durable_timeout_ms),
            Duration::from_millis(self.config.dispatch.shutdown_grace_ms),
        ));

        let _ = cmd_tx.send(Command::Notice(startup_notice(&self.config))).await;
        background.extend(self.housekeeping().await.start(&self.shutdown).await);

        let (sample_tx, mut sample_rx) = mpsc::channel(SAMPLE_QUEUE);
        let sampler = Sampler::new(meter, &self.config.device);
        let sampler_task = tokio::spawn(sampler.run(sample_tx, self.shutdown.subscribe()));

        let device = &self.config.device;
        let detection = &self.config.detection;
        let first_id = Utc::now().timestamp_micros().max(0) as u64;
        let mut detector = EventDetector::new(detection, &device.device_name, &device.location, first_id)
            .with_enrichment(Arc::clone(&cache));
        let mut window = LevelWindow::new(detection.level_window_secs);
        let mut ticker = interval(Duration::from_millis(detection.tick_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut lost_alerted = false;

        self.state.write().await.device_connected = true;
        info!("Noise Buster engine started");

        loop {
            tokio::select! {
                item = sample_rx.recv() => match item {
                    Some(SamplerItem::Sample(sample)) => {
                        self.bus.publish_sample(sample);
                        self.state.write().await.total_samples += 1;

                        if let Some(report) = window.push(&sample) {
                            self.bus.publish_level(report);
                            if cmd_tx.try_send(Command::Level(report)).is_err() {
                                debug!("Dispatcher busy, dropped level report");
                            }
                        }
                        if let Some(event) = detector.on_sample(sample) {
                            self.emit(&cmd_tx, event).await;
                        }
                    }
                    Some(SamplerItem::Disconnected { error }) => {
                        warn!("Sound meter disconnected: {}", error);
                        window.reset();
                        self.state.write().await.device_connected = false;
                        self.bus.publish_status("device", "disconnected");

                        if detector.is_idle()
                            && device.idle_disconnect_policy == IdleDisconnectPolicy::Alert
                            && !lost_alerted
                        {
                            let notice = Notice::new(
                                NoticeKind::DeviceLost,
                                format!("{} stopped answering ({}), reconnecting", device.device_name, error),
                            );
                            let _ = cmd_tx.send(Command::Notice(notice)).await;
                            lost_alerted = true;
                        }
                    }
                    Some(SamplerItem::Reconnected) => {
                        info!("Sound meter reconnected");
                        self.state.write().await.device_connected = true;
                        self.bus.publish_status("device", "connected");

                        if lost_alerted {
                            let notice = Notice::new(
                                NoticeKind::DeviceRestored,
                                format!("{} is sending samples again", device.device_name),
                            );
                            let _ = cmd_tx.send(Command::Notice(notice)).await;
                            lost_alerted = false;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Some(event) = detector.on_tick(Utc::now()) {
                        self.emit(&cmd_tx, event).await;
                    }
                }
            }
        }

        let sampler_result = sampler_task
            .await
            .unwrap_or_else(|e| Err(DeviceError::Fatal(format!("sampler task failed: {}", e))));

        let result = match sampler_result {
            Err(e) => {
                error!("Sound meter lost: {}", e);
                self.state.write().await.device_connected = false;
                if let Some(event) = detector.flush(Utc::now(), DegradedReason::DeviceLost) {
                    self.emit(&cmd_tx, event).await;
                }
                let message = format!("{} is gone: {}. Monitoring stopped.", device.device_name, e);
                self.bus.publish_alert("critical", &message);
                let _ = cmd_tx.send(Command::Notice(Notice::new(NoticeKind::DeviceLost, message))).await;
                Err(e.into())
            }
            Ok(()) => {
                if let Some(event) = detector.flush(Utc::now(), DegradedReason::Shutdown) {
                    self.emit(&cmd_tx, event).await;
                }
                let notice = Notice::new(
                    NoticeKind::Shutdown,
                    format!("{} monitoring stopped", device.device_name),
                );
                let _ = cmd_tx.send(Command::Notice(notice)).await;
                Ok(())
            }
        };

        drop(cmd_tx);
        if let Err(e) = dispatch_task.await {
            warn!("Dispatcher task failed: {}", e);
        }

        let _ = self.shutdown.send(());
        for handle in background {
            let _ = handle.await;
        }

        self.state.write().await.running = false;
        info!("Noise Buster engine stopped");
        result
    }

    async fn emit(&self, cmd_tx: &mpsc::Sender<Command>, event: NoiseEvent) {
        debug!("Handing event {} to the dispatcher", event.id);

        {
            let mut state = self.state.write().await;
            state.total_events += 1;
            if event.is_degraded() {
                state.degraded_events += 1;
            }
            state.last_event = Some(event.end);
            state.last_peak_db = Some(event.peak_db);
        }

        self.bus.publish_noise_event(event.clone());
        if cmd_tx.send(Command::Event(event)).await.is_err() {
            error!("Dispatcher stopped, event not delivered");
        }
    }

    async fn housekeeping(&self) -> Scheduler {
        let scheduler = Scheduler::new();

        if self.config.camera.enabled && self.config.camera.image_retention_hours > 0 {
            let dir = self.config.camera.image_save_path.clone();
            let max_age = Duration::from_secs(self.config.camera.image_retention_hours * 3600);
            scheduler
                .add_task("image_cleanup", Duration::from_secs(3600), move || {
                    match cleanup_images(&dir, max_age) {
                        Ok(0) => {}
                        Ok(n) => info!("Removed {} expired image(s)", n),
                        Err(e) => warn!("Image cleanup failed: {}", e),
                    }
                })
                .await;
        }

        let sqlite = self.config.sinks.sqlite.clone();
        if sqlite.enabled && sqlite.retention_days > 0 {
            scheduler
                .add_task("db_cleanup", Duration::from_secs(86_400), move || {
                    if let Err(e) = Database::open(&sqlite).and_then(|db| db.cleanup(sqlite.retention_days)) {
                        warn!("Database cleanup failed: {}", e);
                    }
                })
                .await;
        }

        scheduler
    }
}

/// Owns the dispatcher; the detection loop never waits on a sink
async fn dispatch_loop(
    dispatcher: Dispatcher,
    mut commands: mpsc::Receiver<Command>,
    mut enrichment: broadcast::Receiver<EnrichmentSnapshot>,
    bus: Arc<EventBus>,
    state: Arc<RwLock<SystemState>>,
    durable_timeout: Duration,
    grace: Duration,
) {
    let mut attempts = dispatcher.subscribe_attempts();
    let mut pending: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Event(event)) => {
                    let handle = dispatcher.submit(event);
                    pending.retain(|h| !h.is_finished());
                    pending.push(tokio::spawn(async move {
                        let event_id = handle.event_id;
                        let outcome = handle.wait(durable_timeout).await;
                        if outcome.outstanding.is_empty() {
                            debug!("Event {} processed by all durable sinks", event_id);
                        } else {
                            warn!(
                                "Event {} still pending on {} after {:?}",
                                event_id,
                                outcome.outstanding.join(", "),
                                durable_timeout
                            );
                        }
                    }));
                }
                Some(Command::Level(report)) => dispatcher.publish_level(report),
                Some(Command::Notice(notice)) => dispatcher.notice(notice),
                None => break,
            },
            Ok(attempt) = attempts.recv() => {
                if attempt.status == AttemptStatus::Failed {
                    state.write().await.delivery_failures += 1;
                }
                bus.publish_attempt(attempt);
            }
            Ok(snapshot) = enrichment.recv() => dispatcher.publish_enrichment(snapshot),
        }
    }

    let abandoned = dispatcher.shutdown(grace).await;
    while let Ok(attempt) = attempts.try_recv() {
        if attempt.status == AttemptStatus::Failed {
            state.write().await.delivery_failures += 1;
        }
        bus.publish_attempt(attempt);
    }
    for handle in pending {
        let _ = handle.await;
    }
    if abandoned > 0 {
        bus.publish_alert("warning", &format!("{} deliveries abandoned at shutdown", abandoned));
    }
}
