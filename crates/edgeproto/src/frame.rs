//! Frame and header types shared by both framings.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One discrete unit of sensor data.
///
/// `number` is the sender-assigned sequence number (1-based, no gaps).
/// `timestamp` is the capture time in milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub number: u64,
    pub timestamp: f64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(number: u64, timestamp: f64, payload: impl Into<Bytes>) -> Self {
        Self {
            number,
            timestamp,
            payload: payload.into(),
        }
    }

    /// Frame stamped with the current wall-clock time.
    pub fn captured_now(number: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(number, now_millis(), payload)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// JSON header block of the JSON-header framing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Payload size in bytes.
    pub length: usize,
    /// Frame sequence number.
    pub number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl FrameHeader {
    pub fn for_frame(frame: &Frame) -> Self {
        Self {
            length: frame.payload.len(),
            number: frame.number,
            timestamp: Some(frame.timestamp),
        }
    }
}

/// Header as read off the wire, before required fields are checked.
#[derive(Debug, Deserialize)]
pub(crate) struct RawHeader {
    pub length: Option<usize>,
    pub number: Option<u64>,
    pub timestamp: Option<f64>,
}

/// Milliseconds since the Unix epoch, with sub-millisecond precision.
pub fn now_millis() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_omits_missing_timestamp() {
        let header = FrameHeader {
            length: 3,
            number: 7,
            timestamp: None,
        };
        let json = serde_json::to_string(&header).unwrap();
        assert_eq!(json, r#"{"length":3,"number":7}"#);
    }

    #[test]
    fn header_for_frame_copies_fields() {
        let frame = Frame::new(4, 1234.5, &b"abcd"[..]);
        let header = FrameHeader::for_frame(&frame);
        assert_eq!(header.length, 4);
        assert_eq!(header.number, 4);
        assert_eq!(header.timestamp, Some(1234.5));
    }

    #[test]
    fn now_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_millis() > 1_577_836_800_000.0);
    }
}
