//! Capture fan-out.
//!
//! A capture source publishes frames into a [`CaptureHub`]; every sender
//! task holds its own [`CaptureFeed`]. The hub is a bounded broadcast
//! channel, so a slow subscriber loses its oldest frames instead of
//! stalling capture.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use edgeproto::now_millis;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub const DEFAULT_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub payload: Bytes,
    /// Milliseconds since the Unix epoch.
    pub timestamp: f64,
}

impl CapturedFrame {
    pub fn now(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureHub {
    tx: broadcast::Sender<CapturedFrame>,
}

impl CaptureHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many feeds will see the frame. Zero is not an error.
    pub fn publish(&self, frame: CapturedFrame) -> usize {
        self.tx.send(frame).unwrap_or(0)
    }

    pub fn subscribe(&self) -> CaptureFeed {
        CaptureFeed {
            rx: self.tx.subscribe(),
            skipped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for CaptureHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// One subscriber's view of the hub.
pub struct CaptureFeed {
    rx: broadcast::Receiver<CapturedFrame>,
    skipped: u64,
}

impl CaptureFeed {
    /// Next frame, or `None` once every hub handle is gone.
    pub async fn next(&mut self) -> Option<CapturedFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(RecvError::Lagged(n)) => {
                    self.skipped += n;
                    warn!("Capture feed lagged, dropped {} oldest frames", n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Frames dropped because this feed fell behind.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// Replays files from a directory as captured frames, in name order.
pub struct DirectorySource {
    dir: PathBuf,
    interval: Duration,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            interval: Duration::ZERO,
        }
    }

    /// Pause between published frames.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Publish every file, then drop the hub handle so feeds see the end.
    pub async fn run(self, hub: CaptureHub) -> io::Result<usize> {
        let files = self.files()?;
        info!("Replaying {} files from {}", files.len(), self.dir.display());

        let mut published = 0;
        for path in files {
            let payload = tokio::fs::read(&path).await?;
            let receivers = hub.publish(CapturedFrame::now(payload));
            debug!("Published {} to {} feeds", path.display(), receivers);
            published += 1;
            if !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn every_feed_sees_every_frame() {
        let hub = CaptureHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        assert_eq!(hub.publish(CapturedFrame::now(&b"one"[..])), 2);
        assert_eq!(hub.publish(CapturedFrame::now(&b"two"[..])), 2);
        drop(hub);

        for feed in [&mut a, &mut b] {
            assert_eq!(feed.next().await.unwrap().payload.as_ref(), b"one");
            assert_eq!(feed.next().await.unwrap().payload.as_ref(), b"two");
            assert!(feed.next().await.is_none());
        }
    }

    #[tokio::test]
    async fn slow_feed_drops_oldest() {
        let hub = CaptureHub::new(2);
        let mut feed = hub.subscribe();
        for i in 0..5u8 {
            hub.publish(CapturedFrame {
                payload: Bytes::from(vec![i]),
                timestamp: i as f64,
            });
        }
        drop(hub);

        let mut seen = Vec::new();
        while let Some(frame) = feed.next().await {
            seen.push(frame.payload[0]);
        }
        assert_eq!(seen, vec![3, 4]);
        assert_eq!(feed.skipped(), 3);
    }

    #[test]
    fn publish_without_feeds() {
        let hub = CaptureHub::default();
        assert_eq!(hub.publish(CapturedFrame::now(&b"lost"[..])), 0);
    }

    #[tokio::test]
    async fn directory_source_replays_in_name_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"second").unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"first").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let hub = CaptureHub::new(8);
        let mut feed = hub.subscribe();
        let source = DirectorySource::new(dir.path());
        assert_eq!(source.files().unwrap().len(), 2);

        assert_eq!(source.run(hub).await.unwrap(), 2);
        assert_eq!(feed.next().await.unwrap().payload.as_ref(), b"first");
        assert_eq!(feed.next().await.unwrap().payload.as_ref(), b"second");
        assert!(feed.next().await.is_none());
    }
}
