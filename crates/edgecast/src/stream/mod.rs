//! Moving frames between edge devices and the ingestion host.
//!
//! - [`receiver`]: accept a framed TCP stream and hand each frame to a handler
//! - [`sender`]: connect to a receiver and write numbered frames
//! - [`capture`]: fan captured frames out to sender tasks
//! - [`uploader`]: push recorded segment files to the HTTP endpoint
//! - [`mjpeg`]: pull a camera's MJPEG stream as frames

pub mod capture;
pub mod mjpeg;
pub mod receiver;
pub mod sender;
pub mod uploader;

pub use capture::{CaptureFeed, CaptureHub, CapturedFrame, DirectorySource};
pub use mjpeg::MjpegPuller;
pub use receiver::{Connection, ReceiveSummary, StreamEnd, StreamReceiver, RECV_CHUNK};
pub use sender::StreamSender;
pub use uploader::SegmentUploader;

use edgeproto::Frame;

use crate::error::IngestResult;

/// Consumer of decoded frames, called in arrival order.
///
/// An error stops the stream that produced the frame.
pub trait FrameHandler {
    fn on_frame(&mut self, frame: Frame) -> IngestResult<()>;
}

impl<F> FrameHandler for F
where
    F: FnMut(Frame) -> IngestResult<()>,
{
    fn on_frame(&mut self, frame: Frame) -> IngestResult<()> {
        self(frame)
    }
}

/// Runs the wrapped handler through [`tokio::task::block_in_place`].
///
/// For handlers that write files or hit the database while a connection is
/// being read. Needs the multi-thread runtime.
pub struct Blocking<H>(pub H);

impl<H: FrameHandler> FrameHandler for Blocking<H> {
    fn on_frame(&mut self, frame: Frame) -> IngestResult<()> {
        tokio::task::block_in_place(|| self.0.on_frame(frame))
    }
}
