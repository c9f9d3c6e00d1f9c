// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Task scheduler for periodic housekeeping

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

type TaskFn = Arc<dyn Fn() + Send + Sync + 'static>;

struct ScheduledTask {
    interval: Duration,
    task: TaskFn,
    enabled: bool,
}

/// Runs blocking housekeeping closures on fixed intervals
pub struct Scheduler {
    tasks: Arc<RwLock<HashMap<String, ScheduledTask>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_task<F>(&self, name: &str, interval: Duration, task: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut tasks = self.tasks.write().await;
        tasks.insert(
            name.to_string(),
            ScheduledTask {
                interval,
                task: Arc::new(task),
                enabled: true,
            },
        );
        debug!("Scheduled task '{}' with interval {:?}", name, interval);
    }

    pub async fn remove_task(&self, name: &str) {
        let mut tasks = self.tasks.write().await;
        tasks.remove(name);
    }

    pub async fn enable_task(&self, name: &str, enabled: bool) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(name) {
            task.enabled = enabled;
        }
    }

    /// Spawn one loop per task; each run happens on the blocking pool.
    /// The first run is one interval after start.
    pub async fn start(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let names: Vec<(String, Duration)> = self
            .tasks
            .read()
            .await
            .iter()
            .map(|(name, t)| (name.clone(), t.interval))
            .collect();

        names
            .into_iter()
            .map(|(name, period)| {
                let tasks = Arc::clone(&self.tasks);
                let mut shutdown = shutdown.subscribe();
                tokio::spawn(async move {
                    let mut ticker = interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = ticker.tick() => {
                                let task = match tasks.read().await.get(&name) {
                                    Some(t) if t.enabled => Arc::clone(&t.task),
                                    Some(_) => continue,
                                    None => break,
                                };
                                if let Err(e) = tokio::task::spawn_blocking(move || task()).await {
                                    warn!("Scheduled task '{}' panicked: {}", name, e);
                                }
                            }
                        }
                    }
                    debug!("Scheduled task '{}' stopped", name);
                })
            })
            .collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_tasks_run_on_interval_until_shutdown() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        scheduler
            .add_task("cleanup", Duration::from_secs(10), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        let (shutdown, _) = broadcast::channel(1);
        let handles = scheduler.start(&shutdown).await;

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        scheduler.enable_task("cleanup", false).await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        shutdown.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
