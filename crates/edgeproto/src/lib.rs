//! Wire framing for edgecast sensor streams.
//!
//! Edge devices ship discrete binary frames (JPEG stills, MP3/WAV audio
//! segments) over a persistent TCP connection. Two framings exist at the
//! system boundary and both are supported, chosen when the codec is built:
//!
//! - [`Framing::JsonHeader`]: a 2-byte big-endian proto-header giving the
//!   size of a UTF-8 JSON header, the header itself (`length`, `number`,
//!   optional `timestamp`), then `length` payload bytes.
//! - [`Framing::BareLength`]: a 4-byte little-endian length followed by the
//!   payload. A zero length marks the end of the stream.
//!
//! [`FrameDecoder`] is a per-connection state machine that can be fed
//! arbitrarily small reads. [`FrameCodec`] adapts it to `tokio_util::codec`
//! for use with `FramedRead`/`FramedWrite`.
//!
//! The [`mjpeg`] module splits multipart MJPEG HTTP bodies into JPEG parts.

pub mod codec;
pub mod frame;
pub mod mjpeg;

pub use codec::{encode, encode_end_of_stream, CodecError, DecodeState, Decoded, FrameCodec, FrameDecoder, Framing};
pub use frame::{now_millis, Frame, FrameHeader};
pub use mjpeg::{JpegPart, MjpegSplitter, DEFAULT_MAX_PART};
