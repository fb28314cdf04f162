//! Frame codec and per-connection decode state machine.
//!
//! ## Wire Format
//!
//! JSON-header framing:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┬────────────────────┐
//! │ Proto-header (2B)│ JSON header (N B)        │ Payload (length B) │
//! │ BE u16 = N       │ {"length":..,"number":..}│                    │
//! └──────────────────┴──────────────────────────┴────────────────────┘
//! ```
//!
//! Bare-length framing:
//!
//! ```text
//! ┌──────────────┬────────────────────┐
//! │ Length (4B)  │ Payload (length B) │
//! │ LE u32       │                    │
//! └──────────────┴────────────────────┘
//! ```
//!
//! A bare-length frame of length zero terminates the stream.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{now_millis, Frame, FrameHeader, RawHeader};

/// Size of the JSON-header framing's proto-header.
pub const PROTO_HEADER_LEN: usize = 2;

/// Size of the bare-length framing's length prefix.
pub const BARE_LENGTH_LEN: usize = 4;

/// Largest payload accepted by a decoder unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

const END_OF_STREAM: [u8; BARE_LENGTH_LEN] = [0; BARE_LENGTH_LEN];

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame header: {reason}")]
    MalformedHeader { reason: String },

    #[error("Frame header too long: {length} bytes (max {max})")]
    HeaderTooLong { length: usize, max: usize },

    #[error("Frame payload too large: {length} bytes (max {max})")]
    FrameTooLarge { length: usize, max: usize },

    #[error("Empty payload cannot be sent with bare-length framing")]
    EmptyPayload,

    #[error("Unknown framing: {0}")]
    UnknownFraming(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which framing a codec speaks. Fixed for the life of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `[u16 BE header len][JSON header][payload]`
    JsonHeader,
    /// `[u32 LE payload len][payload]`, zero length ends the stream
    BareLength,
}

impl Framing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framing::JsonHeader => "json-header",
            Framing::BareLength => "bare-length",
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framing {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json-header" | "json" => Ok(Framing::JsonHeader),
            "bare-length" | "bare" => Ok(Framing::BareLength),
            other => Err(CodecError::UnknownFraming(other.to_string())),
        }
    }
}

/// Decoder phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeState {
    AwaitingProto,
    AwaitingHeader {
        header_len: usize,
    },
    AwaitingContent {
        length: usize,
        number: u64,
        timestamp: f64,
    },
    /// Bare-length end-of-stream marker seen; nothing more is decoded.
    Finished,
}

/// Outcome of one [`FrameDecoder::decode`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frame(Frame),
    NeedMoreData,
    EndOfStream,
}

/// Streaming frame decoder.
///
/// Bytes are consumed from the caller's buffer only when a phase completes,
/// so a short read leaves both the buffer and the state untouched.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    framing: Framing,
    state: DecodeState,
    max_payload: usize,
    next_number: u64,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            state: DecodeState::AwaitingProto,
            max_payload: DEFAULT_MAX_PAYLOAD,
            next_number: 1,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Advance the state machine over `buf`.
    ///
    /// Returns at most one frame per call; call again until
    /// [`Decoded::NeedMoreData`] to drain everything buffered.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, CodecError> {
        loop {
            match self.state {
                DecodeState::Finished => return Ok(Decoded::EndOfStream),

                DecodeState::AwaitingProto => match self.framing {
                    Framing::JsonHeader => {
                        if buf.len() < PROTO_HEADER_LEN {
                            return Ok(Decoded::NeedMoreData);
                        }
                        let header_len = buf.get_u16() as usize;
                        self.state = DecodeState::AwaitingHeader { header_len };
                    }
                    Framing::BareLength => {
                        if buf.len() < BARE_LENGTH_LEN {
                            return Ok(Decoded::NeedMoreData);
                        }
                        let mut prefix = &buf[..BARE_LENGTH_LEN];
                        let length = prefix.get_u32_le() as usize;
                        if length == 0 {
                            buf.advance(BARE_LENGTH_LEN);
                            self.state = DecodeState::Finished;
                            return Ok(Decoded::EndOfStream);
                        }
                        self.check_payload(length)?;
                        buf.advance(BARE_LENGTH_LEN);

                        let number = self.next_number;
                        self.next_number += 1;
                        self.state = DecodeState::AwaitingContent {
                            length,
                            number,
                            timestamp: now_millis(),
                        };
                    }
                },

                DecodeState::AwaitingHeader { header_len } => {
                    if buf.len() < header_len {
                        return Ok(Decoded::NeedMoreData);
                    }
                    let header = parse_header(&buf[..header_len])?;
                    self.check_payload(header.length)?;
                    buf.advance(header_len);
                    self.state = DecodeState::AwaitingContent {
                        length: header.length,
                        number: header.number,
                        timestamp: header.timestamp.unwrap_or_else(now_millis),
                    };
                }

                DecodeState::AwaitingContent {
                    length,
                    number,
                    timestamp,
                } => {
                    if buf.len() < length {
                        return Ok(Decoded::NeedMoreData);
                    }
                    let payload = buf.split_to(length).freeze();
                    self.state = DecodeState::AwaitingProto;
                    return Ok(Decoded::Frame(Frame {
                        number,
                        timestamp,
                        payload,
                    }));
                }
            }
        }
    }

    fn check_payload(&self, length: usize) -> Result<(), CodecError> {
        if length > self.max_payload {
            return Err(CodecError::FrameTooLarge {
                length,
                max: self.max_payload,
            });
        }
        Ok(())
    }
}

fn parse_header(bytes: &[u8]) -> Result<FrameHeader, CodecError> {
    let raw: RawHeader =
        serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedHeader {
            reason: e.to_string(),
        })?;

    let length = raw.length.ok_or_else(|| CodecError::MalformedHeader {
        reason: "missing `length`".to_string(),
    })?;
    let number = raw.number.ok_or_else(|| CodecError::MalformedHeader {
        reason: "missing `number`".to_string(),
    })?;

    Ok(FrameHeader {
        length,
        number,
        timestamp: raw.timestamp,
    })
}

/// Serialize one frame.
pub fn encode(framing: Framing, frame: &Frame) -> Result<Bytes, CodecError> {
    let mut dst = BytesMut::new();
    encode_into(framing, frame, &mut dst)?;
    Ok(dst.freeze())
}

/// The bare-length end-of-stream marker.
pub fn encode_end_of_stream() -> Bytes {
    Bytes::from_static(&END_OF_STREAM)
}

fn encode_into(framing: Framing, frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
    match framing {
        Framing::JsonHeader => {
            let header = serde_json::to_vec(&FrameHeader::for_frame(frame)).map_err(|e| {
                CodecError::MalformedHeader {
                    reason: e.to_string(),
                }
            })?;
            if header.len() > u16::MAX as usize {
                return Err(CodecError::HeaderTooLong {
                    length: header.len(),
                    max: u16::MAX as usize,
                });
            }
            dst.reserve(PROTO_HEADER_LEN + header.len() + frame.payload.len());
            dst.put_u16(header.len() as u16);
            dst.put_slice(&header);
            dst.put_slice(&frame.payload);
        }
        Framing::BareLength => {
            if frame.payload.is_empty() {
                return Err(CodecError::EmptyPayload);
            }
            if frame.payload.len() > u32::MAX as usize {
                return Err(CodecError::FrameTooLarge {
                    length: frame.payload.len(),
                    max: u32::MAX as usize,
                });
            }
            dst.reserve(BARE_LENGTH_LEN + frame.payload.len());
            dst.put_u32_le(frame.payload.len() as u32);
            dst.put_slice(&frame.payload);
        }
    }
    Ok(())
}

/// `tokio_util` adapter around [`FrameDecoder`] and [`encode`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    decoder: FrameDecoder,
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        Self {
            decoder: FrameDecoder::new(framing),
        }
    }

    pub fn with_max_payload(self, max_payload: usize) -> Self {
        Self {
            decoder: self.decoder.with_max_payload(max_payload),
        }
    }

    pub fn framing(&self) -> Framing {
        self.decoder.framing()
    }

    pub fn is_finished(&self) -> bool {
        self.decoder.state() == DecodeState::Finished
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match self.decoder.decode(src)? {
            Decoded::Frame(frame) => Ok(Some(frame)),
            Decoded::NeedMoreData | Decoded::EndOfStream => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if self.is_finished() {
            buf.clear();
        }
        if buf.is_empty() {
            Ok(None)
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} bytes remaining on stream", buf.len()),
            )
            .into())
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode_into(self.decoder.framing(), &item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn with_proto(header: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u16(header.len() as u16);
        buf.put_slice(header);
        buf
    }

    #[test]
    fn abc_frame_roundtrip() {
        let frame = Frame::new(1, 1000.0, &b"ABC"[..]);
        let wire = encode(Framing::JsonHeader, &frame).unwrap();

        let header_json = serde_json::to_vec(&FrameHeader::for_frame(&frame)).unwrap();
        assert_eq!(wire.len(), 2 + header_json.len() + 3);

        let mut decoder = FrameDecoder::new(Framing::JsonHeader);
        let mut buf = BytesMut::from(&wire[..]);
        match decoder.decode(&mut buf).unwrap() {
            Decoded::Frame(decoded) => {
                assert_eq!(decoded.number, 1);
                assert_eq!(decoded.payload.as_ref(), b"ABC");
                assert_eq!(decoded.timestamp, 1000.0);
            }
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(buf.is_empty());
        assert_eq!(decoder.state(), DecodeState::AwaitingProto);
    }

    #[test]
    fn missing_number_is_malformed() {
        let mut decoder = FrameDecoder::new(Framing::JsonHeader);
        let mut buf = with_proto(br#"{"length":3}"#);
        buf.put_slice(b"ABC");

        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::MalformedHeader { .. }));
        assert!(matches!(decoder.state(), DecodeState::AwaitingHeader { .. }));
    }

    #[test]
    fn missing_length_is_malformed() {
        let mut decoder = FrameDecoder::new(Framing::JsonHeader);
        let mut buf = with_proto(br#"{"number":1}"#);

        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::MalformedHeader { .. }));
        assert!(matches!(decoder.state(), DecodeState::AwaitingHeader { header_len: 12 }));
        // Header bytes stay buffered
        assert_eq!(buf.len(), 12);
    }

    #[test]
    fn garbage_header_is_malformed() {
        let mut decoder = FrameDecoder::new(Framing::JsonHeader);
        let mut buf = with_proto(b"not json");

        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::MalformedHeader { .. }));
    }

    #[test]
    fn partial_header_waits() {
        let frame = Frame::new(9, 5.0, &b"payload"[..]);
        let wire = encode(Framing::JsonHeader, &frame).unwrap();

        let mut decoder = FrameDecoder::new(Framing::JsonHeader);
        let mut buf = BytesMut::from(&wire[..1]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Decoded::NeedMoreData);
        assert_eq!(decoder.state(), DecodeState::AwaitingProto);
        assert_eq!(buf.len(), 1);

        buf.extend_from_slice(&wire[1..5]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Decoded::NeedMoreData);
        assert!(matches!(decoder.state(), DecodeState::AwaitingHeader { .. }));

        buf.extend_from_slice(&wire[5..]);
        assert!(matches!(decoder.decode(&mut buf).unwrap(), Decoded::Frame(_)));
    }

    #[test]
    fn header_without_timestamp_uses_receive_time() {
        let mut decoder = FrameDecoder::new(Framing::JsonHeader);
        let mut buf = with_proto(br#"{"length":1,"number":3}"#);
        buf.put_u8(b'x');

        match decoder.decode(&mut buf).unwrap() {
            Decoded::Frame(frame) => {
                assert_eq!(frame.number, 3);
                assert!(frame.timestamp > 0.0);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn bare_length_numbers_frames_and_ends() {
        let mut buf = BytesMut::new();
        for payload in [&b"one"[..], &b"two"[..]] {
            let frame = Frame::new(0, 0.0, payload);
            buf.extend_from_slice(&encode(Framing::BareLength, &frame).unwrap());
        }
        buf.extend_from_slice(&encode_end_of_stream());
        buf.extend_from_slice(b"trailing");

        let mut decoder = FrameDecoder::new(Framing::BareLength);
        let mut numbers = Vec::new();
        loop {
            match decoder.decode(&mut buf).unwrap() {
                Decoded::Frame(frame) => numbers.push(frame.number),
                Decoded::EndOfStream => break,
                Decoded::NeedMoreData => panic!("stream should be complete"),
            }
        }
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(decoder.state(), DecodeState::Finished);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Decoded::EndOfStream);
    }

    #[test]
    fn bare_length_rejects_empty_payload() {
        let frame = Frame::new(1, 0.0, Bytes::new());
        assert!(matches!(
            encode(Framing::BareLength, &frame),
            Err(CodecError::EmptyPayload)
        ));
    }

    #[test]
    fn oversized_payload_rejected() {
        let frame = Frame::new(1, 0.0, vec![0u8; 32]);
        let wire = encode(Framing::JsonHeader, &frame).unwrap();

        let mut decoder = FrameDecoder::new(Framing::JsonHeader).with_max_payload(16);
        let mut buf = BytesMut::from(&wire[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::FrameTooLarge { length: 32, max: 16 })
        ));
    }

    #[test]
    fn framing_parses_names() {
        assert_eq!("json-header".parse::<Framing>().unwrap(), Framing::JsonHeader);
        assert_eq!("BARE".parse::<Framing>().unwrap(), Framing::BareLength);
        assert!("lines".parse::<Framing>().is_err());
        assert_eq!(Framing::BareLength.to_string(), "bare-length");
    }

    #[test]
    fn tokio_codec_roundtrip() {
        let mut codec = FrameCodec::new(Framing::JsonHeader);
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(1, 10.0, &b"a"[..]), &mut buf)
            .unwrap();
        codec
            .encode(Frame::new(2, 20.0, &b"bb"[..]), &mut buf)
            .unwrap();

        let first = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        let second = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(first.number, 1);
        assert_eq!(second.payload.as_ref(), b"bb");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }
}
