// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Local SQLite storage sink

use std::sync::Arc;
use async_trait::async_trait;

use super::{Delivered, Sink, SinkKind};
use crate::db::Database;
use crate::detection::NoiseEvent;
use crate::error::SinkError;

pub struct StoreSink {
    db: Arc<Database>,
    durable: bool,
}

impl StoreSink {
    pub fn new(db: Arc<Database>, durable: bool) -> Self {
        Self { db, durable }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

#[async_trait]
impl Sink for StoreSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Storage
    }

    fn durable(&self) -> bool {
        self.durable
    }

    async fn deliver(&self, event: &NoiseEvent) -> Result<Delivered, SinkError> {
        let db = Arc::clone(&self.db);
        let event = event.clone();
        tokio::task::spawn_blocking(move || db.upsert_event(&event))
            .await
            .map_err(|e| SinkError::Unreachable(format!("store task failed: {}", e)))?
            .map_err(|e| SinkError::Unreachable(e.to_string()))?;
        Ok(Delivered::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::test_event;

    #[tokio::test]
    async fn test_redelivery_keeps_one_row() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sink = StoreSink::new(db.clone(), true);

        sink.deliver(&test_event(11, 89.0)).await.unwrap();
        sink.deliver(&test_event(11, 89.0)).await.unwrap();
        assert_eq!(db.get_stats().unwrap().event_count, 1);
        assert!(sink.durable());
    }

    #[tokio::test]
    async fn test_image_update_fills_stored_row() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sink = StoreSink::new(db.clone(), true);
        let event = test_event(12, 96.0);

        sink.deliver(&event).await.unwrap();
        assert!(sink.takes_image_updates());
        sink.deliver(&event.with_image_ref(Some("/images/12.jpg".into()))).await.unwrap();

        let stored = db.get_event(12).unwrap().unwrap();
        assert_eq!(stored.image_ref.as_deref(), Some("/images/12.jpg"));
        assert_eq!(db.get_stats().unwrap().event_count, 1);
    }
}
