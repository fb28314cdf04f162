//! Records exchanged with the persistence sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Auto-incrementing session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sensor registration identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorId(pub i64);

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bounded recording run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    /// Opaque sensor layout supplied by whoever started the session.
    pub sensor_config: serde_json::Value,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.end.is_none()
    }
}

/// One data source within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRegistration {
    pub id: SensorId,
    pub session_id: SessionId,
    pub ip: IpAddr,
    pub name: String,
    pub sensor_type: String,
}

/// One flushed group of consecutive frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentBatch {
    pub session_id: SessionId,
    pub sensor_id: SensorId,
    pub first_timestamp: f64,
    pub last_timestamp: f64,
    pub first_number: u64,
    pub last_number: u64,
    /// Compact JSON object keyed by frame number.
    pub metadata_json: String,
}

/// Environmental reading from a sense board.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SenseReading {
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
}

/// Well-known sensor categories.
pub mod sensor_types {
    pub const MICROPHONE: &str = "Microphone";
    pub const PI_CAMERA: &str = "PiCamera";
    pub const SENSE_HAT: &str = "SenseHat";
}
