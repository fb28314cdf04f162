//! Split a multipart MJPEG byte stream into individual JPEG parts.
//!
//! Camera streamers send `multipart/x-mixed-replace` bodies where each part
//! carries its own small header block. The streamers we ingest from add a
//! `Timestamp: <ms since epoch>` line to that block.

use bytes::{Buf, Bytes, BytesMut};

use crate::codec::CodecError;

const SOI: [u8; 2] = [0xff, 0xd8];
const EOI: [u8; 2] = [0xff, 0xd9];
const TIMESTAMP_HEADER: &str = "Timestamp: ";

/// Bytes kept ahead of an image while no SOI has been seen; enough for a
/// part header block.
const HEADER_WINDOW: usize = 512;

/// Default cap on a single part still waiting for its EOI.
pub const DEFAULT_MAX_PART: usize = 16 * 1024 * 1024;

/// One JPEG image cut out of the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct JpegPart {
    /// Value of the part's `Timestamp:` header, if it had a parseable one.
    pub timestamp: Option<f64>,
    /// Image bytes from SOI through EOI inclusive.
    pub data: Bytes,
}

/// Incremental splitter; push network chunks in, pull parts out.
///
/// Bytes before an SOI marker are dropped down to a small header window, and
/// a part that grows past `max_part` without an EOI is an error, so a stream
/// that never carries JPEG data cannot grow the buffer without limit.
#[derive(Debug)]
pub struct MjpegSplitter {
    buf: BytesMut,
    max_part: usize,
    /// Offset of the current part's SOI, once found.
    soi: Option<usize>,
    /// Where the next marker search resumes.
    scan_from: usize,
}

impl Default for MjpegSplitter {
    fn default() -> Self {
        Self {
            buf: BytesMut::new(),
            max_part: DEFAULT_MAX_PART,
            soi: None,
            scan_from: 0,
        }
    }
}

impl MjpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_part(mut self, max_part: usize) -> Self {
        self.max_part = max_part;
        self
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes held while waiting for the end of the current part.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete part, if the buffer holds one.
    ///
    /// Fails with [`CodecError::FrameTooLarge`] when the pending part exceeds
    /// the cap; the buffer is cleared so the caller may keep pushing.
    pub fn next_part(&mut self) -> Result<Option<JpegPart>, CodecError> {
        let start = match self.soi {
            Some(start) => start,
            None => match find(&self.buf, &SOI, self.scan_from) {
                Some(found) => {
                    let dropped = found.saturating_sub(HEADER_WINDOW);
                    self.buf.advance(dropped);
                    let start = found - dropped;
                    self.soi = Some(start);
                    self.scan_from = start + SOI.len();
                    start
                }
                None => {
                    self.discard_before_soi();
                    return Ok(None);
                }
            },
        };

        let Some(eoi) = find(&self.buf, &EOI, self.scan_from) else {
            let pending = self.buf.len() - start;
            if pending > self.max_part {
                self.reset();
                return Err(CodecError::FrameTooLarge {
                    length: pending,
                    max: self.max_part,
                });
            }
            // The last byte may be the first half of an EOI
            self.scan_from = (start + SOI.len()).max(self.buf.len().saturating_sub(1));
            return Ok(None);
        };
        let end = eoi + EOI.len();

        let timestamp = parse_timestamp(&self.buf[..start]);
        self.buf.advance(start);
        let data = self.buf.split_to(end - start).freeze();
        self.soi = None;
        self.scan_from = 0;

        Ok(Some(JpegPart { timestamp, data }))
    }

    fn discard_before_soi(&mut self) {
        let keep = self.buf.len().min(HEADER_WINDOW);
        let dropped = self.buf.len() - keep;
        self.buf.advance(dropped);
        // Everything kept has been searched except a trailing 0xff
        self.scan_from = keep.saturating_sub(1);
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.soi = None;
        self.scan_from = 0;
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

fn parse_timestamp(header: &[u8]) -> Option<f64> {
    let text = String::from_utf8_lossy(header);
    let start = text.rfind(TIMESTAMP_HEADER)? + TIMESTAMP_HEADER.len();
    text[start..].lines().next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(timestamp: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nTimestamp: {}\r\n\r\n",
            body.len() + 4,
            timestamp
        )
        .into_bytes();
        out.extend_from_slice(&SOI);
        out.extend_from_slice(body);
        out.extend_from_slice(&EOI);
        out.extend_from_slice(b"\r\n");
        out
    }

    #[test]
    fn splits_parts_with_timestamps() {
        let mut splitter = MjpegSplitter::new();
        splitter.push(&part("1600000000123.5", b"first"));
        splitter.push(&part("1600000000456", b"second"));

        let first = splitter.next_part().unwrap().unwrap();
        assert_eq!(first.timestamp, Some(1600000000123.5));
        assert_eq!(&first.data[2..first.data.len() - 2], b"first");

        let second = splitter.next_part().unwrap().unwrap();
        assert_eq!(second.timestamp, Some(1600000000456.0));
        assert!(splitter.next_part().unwrap().is_none());
    }

    #[test]
    fn waits_for_end_marker() {
        let bytes = part("42", b"image");
        let mut splitter = MjpegSplitter::new();

        splitter.push(&bytes[..bytes.len() - 4]);
        assert!(splitter.next_part().unwrap().is_none());

        splitter.push(&bytes[bytes.len() - 4..]);
        let jpeg = splitter.next_part().unwrap().unwrap();
        assert_eq!(jpeg.timestamp, Some(42.0));
        assert!(jpeg.data.starts_with(&SOI));
        assert!(jpeg.data.ends_with(&EOI));
    }

    #[test]
    fn missing_timestamp_is_none() {
        let mut splitter = MjpegSplitter::new();
        splitter.push(b"--FRAME\r\n\r\n");
        splitter.push(&[0xff, 0xd8, 1, 2, 0xff, 0xd9]);
        assert_eq!(splitter.next_part().unwrap().unwrap().timestamp, None);
    }

    #[test]
    fn garbage_stream_stays_bounded() {
        let mut splitter = MjpegSplitter::new();
        let page = b"<html><body>not a camera</body></html>\n".repeat(100);
        for _ in 0..1000 {
            splitter.push(&page);
            assert!(splitter.next_part().unwrap().is_none());
            assert!(splitter.buffered() <= HEADER_WINDOW);
        }

        // A real part after the garbage still comes through with its header
        splitter.push(&part("7", b"late"));
        let jpeg = splitter.next_part().unwrap().unwrap();
        assert_eq!(jpeg.timestamp, Some(7.0));
    }

    #[test]
    fn markers_split_across_chunks() {
        let bytes = part("9", b"split");
        let soi = bytes.iter().position(|&b| b == 0xff).unwrap();
        let mut splitter = MjpegSplitter::new();

        // Break inside the SOI marker, then inside the EOI marker
        splitter.push(&bytes[..soi + 1]);
        assert!(splitter.next_part().unwrap().is_none());
        splitter.push(&bytes[soi + 1..bytes.len() - 3]);
        assert!(splitter.next_part().unwrap().is_none());
        splitter.push(&bytes[bytes.len() - 3..]);

        let jpeg = splitter.next_part().unwrap().unwrap();
        assert_eq!(jpeg.timestamp, Some(9.0));
        assert_eq!(&jpeg.data[2..jpeg.data.len() - 2], b"split");
    }

    #[test]
    fn oversized_part_is_rejected() {
        let mut splitter = MjpegSplitter::new().with_max_part(64);
        splitter.push(&[0xff, 0xd8]);
        splitter.push(&[0u8; 100]);

        let err = splitter.next_part().unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { max: 64, .. }));
        assert_eq!(splitter.buffered(), 0);

        splitter.push(&[0xff, 0xd8, 1, 0xff, 0xd9]);
        assert!(splitter.next_part().unwrap().is_some());
    }
}
