//! Outbound framed TCP stream.

use bytes::Bytes;
use edgeproto::{encode_end_of_stream, now_millis, CodecError, Frame, FrameCodec, Framing};
use futures::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info};

use super::capture::CaptureFeed;
use crate::error::{IngestError, IngestResult};

/// Numbers frames from 1 and writes them to one receiver.
pub struct StreamSender {
    framed: FramedWrite<TcpStream, FrameCodec>,
    addr: String,
    next_number: u64,
}

impl StreamSender {
    /// Connect once. Retrying is up to the caller.
    pub async fn connect(addr: &str, framing: Framing) -> IngestResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| IngestError::ConnectionFailed {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        info!("Connected to {} ({})", addr, framing);

        Ok(Self {
            framed: FramedWrite::new(stream, FrameCodec::new(framing)),
            addr: addr.to_string(),
            next_number: 1,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Number the next frame will carry.
    pub fn next_number(&self) -> u64 {
        self.next_number
    }

    /// Send a payload stamped with the current time.
    pub async fn send(&mut self, payload: impl Into<Bytes>) -> IngestResult<Frame> {
        self.send_at(payload, now_millis()).await
    }

    /// Send a payload with an explicit capture timestamp.
    ///
    /// Returns once every byte of the frame has been flushed to the socket.
    pub async fn send_at(&mut self, payload: impl Into<Bytes>, timestamp: f64) -> IngestResult<Frame> {
        let frame = Frame::new(self.next_number, timestamp, payload);
        self.framed.send(frame.clone()).await.map_err(from_codec)?;
        self.next_number += 1;
        debug!("Sent frame {} ({} bytes)", frame.number, frame.len());
        Ok(frame)
    }

    /// Forward captured frames until the capture source closes.
    pub async fn stream_from(&mut self, feed: &mut CaptureFeed) -> IngestResult<u64> {
        let mut sent = 0;
        while let Some(captured) = feed.next().await {
            self.send_at(captured.payload, captured.timestamp).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Close the stream, writing the end-of-stream marker where the framing has one.
    pub async fn finish(self) -> IngestResult<u64> {
        let framing = self.framed.encoder().framing();
        let sent = self.next_number - 1;
        let mut stream = self.framed.into_inner();
        if framing == Framing::BareLength {
            stream.write_all(&encode_end_of_stream()).await?;
        }
        stream.flush().await?;
        stream.shutdown().await?;
        info!("Closed stream to {} after {} frames", self.addr, sent);
        Ok(sent)
    }
}

fn from_codec(e: CodecError) -> IngestError {
    match e {
        CodecError::Io(io) => IngestError::Io(io),
        other => IngestError::Encode(other),
    }
}
