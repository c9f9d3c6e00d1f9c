// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Image capture trigger and image retention

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{check_response, http_client, Delivered, Sink, SinkKind};
use crate::config::CameraConfig;
use crate::detection::NoiseEvent;
use crate::error::SinkError;

/// Camera collaborator; returns where the image was stored
#[async_trait]
pub trait Camera: Send + Sync {
    async fn capture(&self, event_id: u64, timestamp: DateTime<Utc>) -> Result<PathBuf, SinkError>;
}

/// Fetches a JPEG from a network camera's snapshot endpoint
pub struct HttpSnapshotCamera {
    client: reqwest::Client,
    snapshot_url: String,
    save_path: PathBuf,
}

impl HttpSnapshotCamera {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            client: http_client(config.request_timeout_secs),
            snapshot_url: config.snapshot_url.clone(),
            save_path: config.image_save_path.clone(),
        }
    }
}

/// `<YYYY-mm-dd_HH-MM-SS>_<event id>.jpg`; stable for a given event
pub fn image_file_name(timestamp: DateTime<Utc>, event_id: u64) -> String {
    format!("{}_{}.jpg", timestamp.format("%Y-%m-%d_%H-%M-%S"), event_id)
}

#[async_trait]
impl Camera for HttpSnapshotCamera {
    async fn capture(&self, event_id: u64, timestamp: DateTime<Utc>) -> Result<PathBuf, SinkError> {
        let response = self.client.get(&self.snapshot_url).send().await?;
        let bytes = check_response(response).await?.bytes().await?;
        if bytes.is_empty() {
            return Err(SinkError::Unreachable("camera returned an empty image".into()));
        }

        let path = self.save_path.join(image_file_name(timestamp, event_id));
        tokio::fs::create_dir_all(&self.save_path)
            .await
            .map_err(|e| SinkError::Unreachable(format!("cannot store image: {}", e)))?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| SinkError::Unreachable(format!("cannot store image: {}", e)))?;

        info!("Image captured for event {}: {:?}", event_id, path);
        Ok(path)
    }
}

/// Image-trigger sink; only events over the image threshold reach it
pub struct CameraSink {
    camera: Arc<dyn Camera>,
}

impl CameraSink {
    pub fn new(camera: Arc<dyn Camera>) -> Self {
        Self { camera }
    }
}

#[async_trait]
impl Sink for CameraSink {
    fn name(&self) -> &str {
        "camera"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::ImageTrigger
    }

    fn durable(&self) -> bool {
        false
    }

    fn wants(&self, event: &NoiseEvent) -> bool {
        event.image_requested
    }

    async fn deliver(&self, event: &NoiseEvent) -> Result<Delivered, SinkError> {
        let path = self.camera.capture(event.id, event.start).await?;
        Ok(Delivered::with_artifact(path.display().to_string()))
    }
}

/// Delete `.jpg` files in `dir` last modified before `cutoff`
pub fn cleanup_images_before(dir: &Path, cutoff: SystemTime) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jpg") {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if modified < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Deleted old image {:?}", path);
                    removed += 1;
                }
                Err(e) => warn!("Could not delete {:?}: {}", path, e),
            }
        }
    }
    Ok(removed)
}

/// Delete images older than `max_age`
pub fn cleanup_images(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let removed = cleanup_images_before(dir, cutoff)?;
    if removed > 0 {
        info!("Removed {} image(s) older than {:?}", removed, max_age);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::test_event;
    use chrono::TimeZone;

    struct FakeCamera {
        dir: PathBuf,
    }

    #[async_trait]
    impl Camera for FakeCamera {
        async fn capture(&self, event_id: u64, timestamp: DateTime<Utc>) -> Result<PathBuf, SinkError> {
            let path = self.dir.join(image_file_name(timestamp, event_id));
            std::fs::write(&path, b"\xff\xd8jpeg").map_err(|e| SinkError::Encode(e.to_string()))?;
            Ok(path)
        }
    }

    #[test]
    fn test_image_file_name() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 22, 5, 9).unwrap();
        assert_eq!(image_file_name(ts, 77), "2026-03-01_22-05-09_77.jpg");
    }

    #[tokio::test]
    async fn test_camera_sink_returns_image_path() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CameraSink::new(Arc::new(FakeCamera { dir: dir.path().to_path_buf() }));

        let mut event = test_event(12, 96.0);
        assert!(!sink.wants(&event));
        event.image_requested = true;
        assert!(sink.wants(&event));

        let delivered = sink.deliver(&event).await.unwrap();
        let artifact = delivered.artifact.unwrap();
        assert!(artifact.ends_with("_12.jpg"));

        // Retried capture overwrites the same file
        sink.deliver(&event).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_cleanup_only_removes_old_jpegs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(cleanup_images(dir.path(), Duration::from_secs(3600)).unwrap(), 0);

        let future = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(cleanup_images_before(dir.path(), future).unwrap(), 1);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_cleanup_missing_dir() {
        assert_eq!(cleanup_images(Path::new("/nonexistent/noisebuster/images"), Duration::from_secs(1)).unwrap(), 0);
    }
}
