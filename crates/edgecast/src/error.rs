use std::net::SocketAddr;
use std::path::PathBuf;

use edgeproto::CodecError;
use thiserror::Error;

use crate::store::SensorId;

/// Errors that end ingestion for one connection or sensor.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        source: std::io::Error,
    },

    #[error("Bad frame from {peer}: {source}")]
    Codec {
        peer: SocketAddr,
        source: CodecError,
    },

    #[error("Failed to write segment batch for sensor {sensor_id}: {source}")]
    SinkWrite {
        sensor_id: SensorId,
        source: anyhow::Error,
    },

    #[error("Frame {number} for sensor {sensor_id} is not after the last stored frame {last}")]
    FrameOutOfOrder {
        sensor_id: SensorId,
        number: u64,
        last: u64,
    },

    #[error("Failed to write frame file {path}: {source}")]
    FrameWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("HTTP stream {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("Codec error: {0}")]
    Encode(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IngestResult<T> = Result<T, IngestError>;
