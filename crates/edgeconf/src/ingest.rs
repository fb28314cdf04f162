//! Ingestion tuning: batch and shard sizes, camera pulls, session polling,
//! and raw socket receivers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestConfig {
    /// Frames per segment record written to the database.
    /// Default: 2
    #[serde(default = "IngestConfig::default_frames_per_record")]
    pub frames_per_record: u32,

    /// Frame files per shard directory.
    /// Default: 10
    #[serde(default = "IngestConfig::default_frames_per_shard")]
    pub frames_per_shard: u32,

    /// File extension for uploaded audio segments.
    /// Default: mp3
    #[serde(default = "IngestConfig::default_audio_extension")]
    pub audio_extension: String,

    /// Largest frame payload a receiver accepts.
    /// Default: 64 MiB
    #[serde(default = "IngestConfig::default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl IngestConfig {
    fn default_frames_per_record() -> u32 {
        2
    }

    fn default_frames_per_shard() -> u32 {
        10
    }

    fn default_audio_extension() -> String {
        "mp3".to_string()
    }

    fn default_max_payload_bytes() -> usize {
        64 * 1024 * 1024
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            frames_per_record: Self::default_frames_per_record(),
            frames_per_shard: Self::default_frames_per_shard(),
            audio_extension: Self::default_audio_extension(),
            max_payload_bytes: Self::default_max_payload_bytes(),
        }
    }
}

/// MJPEG pulls from `PiCamera` sensors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    /// Default: 8000
    #[serde(default = "CameraConfig::default_mjpeg_port")]
    pub mjpeg_port: u16,

    /// Default: /stream.mjpg
    #[serde(default = "CameraConfig::default_mjpeg_path")]
    pub mjpeg_path: String,

    /// Default: 5
    #[serde(default = "CameraConfig::default_frames")]
    pub frames_per_record: u32,

    /// Default: 5
    #[serde(default = "CameraConfig::default_frames")]
    pub frames_per_shard: u32,
}

impl CameraConfig {
    fn default_mjpeg_port() -> u16 {
        8000
    }

    fn default_mjpeg_path() -> String {
        "/stream.mjpg".to_string()
    }

    fn default_frames() -> u32 {
        5
    }

    pub fn stream_url(&self, host: &str) -> String {
        format!("http://{}:{}{}", host, self.mjpeg_port, self.mjpeg_path)
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            mjpeg_port: Self::default_mjpeg_port(),
            mjpeg_path: Self::default_mjpeg_path(),
            frames_per_record: Self::default_frames(),
            frames_per_shard: Self::default_frames(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Default: 500
    #[serde(default = "SessionConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// End the session after this long. 0 waits for an external end.
    /// Default: 0
    #[serde(default)]
    pub max_duration_secs: u64,
}

impl SessionConfig {
    fn default_poll_interval_ms() -> u64 {
        500
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
            max_duration_secs: 0,
        }
    }
}

/// One raw-socket receiver, from a `[[receivers]]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiverConfig {
    pub name: String,

    /// `host:port` to listen on.
    pub listen: String,

    /// Sensor type registered for the connecting peer.
    #[serde(default = "ReceiverConfig::default_sensor_type")]
    pub sensor_type: String,

    /// `json-header` or `bare-length`.
    #[serde(default = "ReceiverConfig::default_framing")]
    pub framing: String,

    #[serde(default = "ReceiverConfig::default_extension")]
    pub extension: String,
}

impl ReceiverConfig {
    fn default_sensor_type() -> String {
        "Camera".to_string()
    }

    fn default_framing() -> String {
        "json-header".to_string()
    }

    fn default_extension() -> String {
        "jpg".to_string()
    }
}
