//! On-disk layout for frame files.
//!
//! ```text
//! {root}/{session_id}/{sensor_id}/{shard_index}/frame-{frame_number}.{ext}
//! ```

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use crate::store::{SensorId, SessionId};

/// Maps frames to shard paths and creates directories on first use.
#[derive(Debug)]
pub struct ShardLayout {
    root: PathBuf,
    extension: String,
    /// Directories already known to exist.
    created: HashSet<PathBuf>,
}

impl ShardLayout {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
            created: HashSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn shard_dir(&self, session_id: SessionId, sensor_id: SensorId, shard: u64) -> PathBuf {
        self.root
            .join(session_id.0.to_string())
            .join(sensor_id.0.to_string())
            .join(shard.to_string())
    }

    pub fn frame_path(
        &self,
        session_id: SessionId,
        sensor_id: SensorId,
        shard: u64,
        frame_number: u64,
    ) -> PathBuf {
        self.shard_dir(session_id, sensor_id, shard)
            .join(format!("frame-{}.{}", frame_number, self.extension))
    }

    /// Path for a frame, creating the root, session, sensor and shard
    /// directories the first time each is needed.
    pub fn ensure_frame_path(
        &mut self,
        session_id: SessionId,
        sensor_id: SensorId,
        shard: u64,
        frame_number: u64,
    ) -> io::Result<PathBuf> {
        let dir = self.shard_dir(session_id, sensor_id, shard);
        if !self.created.contains(&dir) {
            std::fs::create_dir_all(&dir)?;
            self.created.insert(dir);
        }
        Ok(self.frame_path(session_id, sensor_id, shard, frame_number))
    }

    /// Number of shard directories this layout has created or verified.
    pub fn known_dirs(&self) -> usize {
        self.created.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn frame_path_format() {
        let layout = ShardLayout::new("data", "mp3");
        assert_eq!(
            layout.frame_path(SessionId(3), SensorId(7), 2, 15),
            PathBuf::from("data/3/7/2/frame-15.mp3")
        );
    }

    #[test]
    fn directories_created_lazily_once() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        let mut layout = ShardLayout::new(&root, "jpg");
        assert!(!root.exists());

        let path = layout
            .ensure_frame_path(SessionId(1), SensorId(1), 1, 1)
            .unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert_eq!(layout.known_dirs(), 1);

        layout
            .ensure_frame_path(SessionId(1), SensorId(1), 1, 2)
            .unwrap();
        assert_eq!(layout.known_dirs(), 1);

        layout
            .ensure_frame_path(SessionId(1), SensorId(1), 2, 3)
            .unwrap();
        assert_eq!(layout.known_dirs(), 2);
        assert!(root.join("1/1/2").is_dir());
    }
}
