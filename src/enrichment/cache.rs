// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Freshness-bounded snapshot cache with background refresh

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{EnrichmentSnapshot, EnrichmentSource};
use crate::error::EnrichmentError;

/// Freshness rules for one source
#[derive(Debug, Clone, Copy)]
pub struct SourcePolicy {
    pub ttl: Duration,
    /// Extra time a stale snapshot is still served while a refresh runs
    pub grace: Duration,
    pub refresh_interval: Duration,
}

struct Cached {
    snapshot: EnrichmentSnapshot,
    fetched: Instant,
}

struct SourceSlot {
    source: Arc<dyn EnrichmentSource>,
    policy: SourcePolicy,
    cached: RwLock<Option<Cached>>,
    refreshing: AtomicBool,
}

/// Clears the in-flight flag even if the refresh future is dropped
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SourceSlot {
    fn try_begin(&self) -> Option<InFlight<'_>> {
        self.refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(&self.refreshing))
    }
}

/// Snapshot table shared by the detector (readers) and refresh tasks (writers)
pub struct EnrichmentCache {
    slots: BTreeMap<String, Arc<SourceSlot>>,
    updates: broadcast::Sender<EnrichmentSnapshot>,
}

impl EnrichmentCache {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            slots: BTreeMap::new(),
            updates,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn EnrichmentSource>, policy: SourcePolicy) -> Self {
        let name = source.name().to_string();
        self.slots.insert(
            name,
            Arc::new(SourceSlot {
                source,
                policy,
                cached: RwLock::new(None),
                refreshing: AtomicBool::new(false),
            }),
        );
        self
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Snapshots published after each successful refresh
    pub fn subscribe(&self) -> broadcast::Receiver<EnrichmentSnapshot> {
        self.updates.subscribe()
    }

    /// Never blocks. Serves the last snapshot while its age is within ttl + grace;
    /// past ttl a background refresh is started.
    pub fn get(self: &Arc<Self>, source: &str) -> Option<EnrichmentSnapshot> {
        let slot = self.slots.get(source)?;
        let policy = slot.policy;

        let (value, stale) = match &*slot.cached.read() {
            Some(c) => {
                let age = c.fetched.elapsed();
                if age <= policy.ttl + policy.grace {
                    (Some(c.snapshot.clone()), age > policy.ttl)
                } else {
                    (None, true)
                }
            }
            None => (None, true),
        };

        if stale {
            self.trigger_refresh(source);
        }
        value
    }

    /// Every source's current snapshot, skipping absent ones
    pub fn snapshot_all(self: &Arc<Self>) -> Vec<EnrichmentSnapshot> {
        let names: Vec<String> = self.slots.keys().cloned().collect();
        names.iter().filter_map(|name| self.get(name)).collect()
    }

    fn trigger_refresh(self: &Arc<Self>, source: &str) {
        let Some(slot) = self.slots.get(source).cloned() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        // Claim the flag before spawning so concurrent callers see it immediately
        if slot
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let cache = Arc::clone(self);
        handle.spawn(async move {
            let guard = InFlight(&slot.refreshing);
            let _ = cache.fetch_into(&slot).await;
            drop(guard);
        });
    }

    /// Refresh one source now. Returns without a network call if one is already in flight.
    pub async fn refresh(&self, source: &str) -> Result<(), EnrichmentError> {
        let Some(slot) = self.slots.get(source) else {
            return Ok(());
        };
        let Some(_guard) = slot.try_begin() else {
            debug!("Refresh of {} already in flight", source);
            return Ok(());
        };
        self.fetch_into(slot).await
    }

    async fn fetch_into(&self, slot: &SourceSlot) -> Result<(), EnrichmentError> {
        let name = slot.source.name();
        match slot.source.fetch().await {
            Ok(fields) => {
                let snapshot = EnrichmentSnapshot::new(name, fields, slot.policy.ttl.as_secs());
                *slot.cached.write() = Some(Cached {
                    snapshot: snapshot.clone(),
                    fetched: Instant::now(),
                });
                debug!("Refreshed enrichment source {}", name);
                let _ = self.updates.send(snapshot);
                Ok(())
            }
            Err(e) => {
                warn!("Enrichment refresh for {} failed, keeping previous snapshot: {}", name, e);
                Err(e)
            }
        }
    }

    /// One refresh loop per source on its own cadence
    pub fn spawn_refreshers(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        self.slots
            .iter()
            .map(|(name, slot)| {
                let cache = Arc::clone(self);
                let name = name.clone();
                let period = slot.policy.refresh_interval;
                let mut shutdown = shutdown.subscribe();

                tokio::spawn(async move {
                    info!("Refreshing {} every {:?}", name, period);
                    let mut ticker = interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = ticker.tick() => {
                                let _ = cache.refresh(&name).await;
                            }
                        }
                    }
                    debug!("Refresher for {} stopped", name);
                })
            })
            .collect()
    }
}

impl Default for EnrichmentCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::Fields;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FakeSource {
        calls: AtomicU32,
        fail: AtomicBool,
        delay: Duration,
    }

    impl FakeSource {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: AtomicBool::new(false),
                delay,
            })
        }
    }

    #[async_trait]
    impl EnrichmentSource for FakeSource {
        fn name(&self) -> &str { "weather" }

        async fn fetch(&self) -> Result<Fields, EnrichmentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(EnrichmentError::Network("connection refused".into()));
            }
            Ok([("temperature".to_string(), serde_json::json!(10.0 + n as f64))].into_iter().collect())
        }
    }

    fn policy() -> SourcePolicy {
        SourcePolicy {
            ttl: Duration::from_secs(60),
            grace: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_snapshot_is_served() {
        let source = FakeSource::new(Duration::ZERO);
        let cache = Arc::new(EnrichmentCache::new().with_source(source.clone(), policy()));

        cache.refresh("weather").await.unwrap();
        let snap = cache.get("weather").unwrap();
        assert_eq!(snap.number("temperature"), Some(11.0));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_older_than_ttl_plus_grace_is_never_served() {
        let source = FakeSource::new(Duration::ZERO);
        let cache = Arc::new(EnrichmentCache::new().with_source(source.clone(), policy()));
        cache.refresh("weather").await.unwrap();

        // Refreshes fail from now on; the old snapshot is kept while within ttl + grace
        source.fail.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(75)).await;
        assert!(cache.get("weather").is_some());

        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(cache.get("weather").is_none());
        assert!(cache.snapshot_all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_gets_issue_single_refresh() {
        let source = FakeSource::new(Duration::from_secs(2));
        let cache = Arc::new(EnrichmentCache::new().with_source(source.clone(), policy()));

        for _ in 0..10 {
            assert!(cache.get("weather").is_none());
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(cache.get("weather").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let source = FakeSource::new(Duration::ZERO);
        let cache = Arc::new(EnrichmentCache::new().with_source(source.clone(), policy()));
        cache.refresh("weather").await.unwrap();

        source.fail.store(true, Ordering::SeqCst);
        assert!(cache.refresh("weather").await.is_err());
        assert_eq!(cache.get("weather").unwrap().number("temperature"), Some(11.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshers_publish_updates_and_stop() {
        let source = FakeSource::new(Duration::ZERO);
        let cache = Arc::new(EnrichmentCache::new().with_source(source.clone(), policy()));
        let mut updates = cache.subscribe();
        let (shutdown, _) = broadcast::channel(1);

        let handles = cache.spawn_refreshers(&shutdown);
        let first = updates.recv().await.unwrap();
        assert_eq!(first.source, "weather");

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(source.calls.load(Ordering::SeqCst) >= 2);

        shutdown.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_get_without_runtime_does_not_panic() {
        let cache = Arc::new(EnrichmentCache::new().with_source(FakeSource::new(Duration::ZERO), policy()));
        assert!(cache.get("weather").is_none());
        assert!(cache.get("traffic").is_none());
    }
}
