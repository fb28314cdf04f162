//! Inbound framed TCP stream.
//!
//! A [`StreamReceiver`] owns the listening socket. Each accepted
//! [`Connection`] serves exactly one peer: it reads bounded chunks, feeds
//! them through a [`FrameDecoder`], and hands every complete frame to the
//! caller's [`FrameHandler`] before decoding the next one. The peer closing
//! its side is the normal way a stream ends.

use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use edgeproto::{Decoded, FrameDecoder, Framing};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use super::FrameHandler;
use crate::error::{IngestError, IngestResult};

/// Bytes requested per read.
pub const RECV_CHUNK: usize = 4096;

/// Why a connection stopped producing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Zero-length read.
    PeerClosed,
    /// Bare-length end-of-stream marker.
    EndOfStream,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveSummary {
    pub peer: SocketAddr,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub end: StreamEnd,
}

pub struct StreamReceiver {
    listener: TcpListener,
    framing: Framing,
    max_payload: Option<usize>,
}

impl StreamReceiver {
    pub async fn bind(addr: impl ToSocketAddrs, framing: Framing) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Listening for {} frames on {}",
            framing,
            listener.local_addr()?
        );
        Ok(Self {
            listener,
            framing,
            max_payload: None,
        })
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = Some(max_payload);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Wait for the next peer.
    pub async fn accept(&self) -> io::Result<Connection> {
        let (stream, peer) = self.listener.accept().await?;
        info!("Accepted connection from {}", peer);

        let mut decoder = FrameDecoder::new(self.framing);
        if let Some(max) = self.max_payload {
            decoder = decoder.with_max_payload(max);
        }
        Ok(Connection {
            stream,
            peer,
            decoder,
        })
    }
}

/// One accepted peer.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: FrameDecoder,
}

impl Connection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read until the peer closes, delivering frames to `handler`.
    ///
    /// A malformed frame or a handler error closes the connection and is
    /// returned; a peer disconnect is a normal `Ok` finish. The handler runs
    /// on the task's thread, so wrap one that stores frames in
    /// [`Blocking`](super::Blocking).
    pub async fn run<H>(mut self, handler: &mut H) -> IngestResult<ReceiveSummary>
    where
        H: FrameHandler + ?Sized,
    {
        let peer = self.peer;
        let mut buf = BytesMut::with_capacity(RECV_CHUNK * 2);
        let mut chunk = [0u8; RECV_CHUNK];
        let mut frames_received = 0u64;
        let mut bytes_received = 0u64;

        loop {
            self.stream.readable().await?;
            let n = match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    if !buf.is_empty() {
                        debug!(
                            "Discarding {} trailing bytes from {} ({:?})",
                            buf.len(),
                            peer,
                            self.decoder.state()
                        );
                    }
                    info!(
                        "Peer {} closed connection; frames received: {}",
                        peer, frames_received
                    );
                    return Ok(ReceiveSummary {
                        peer,
                        frames_received,
                        bytes_received,
                        end: StreamEnd::PeerClosed,
                    });
                }
                Ok(n) => n,
                // Spurious readiness
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!("Connection from {} dropped: {}", peer, e);
                    return Err(e.into());
                }
            };
            bytes_received += n as u64;
            buf.extend_from_slice(&chunk[..n]);

            loop {
                match self.decoder.decode(&mut buf) {
                    Ok(Decoded::Frame(frame)) => {
                        frames_received += 1;
                        if let Err(e) = handler.on_frame(frame) {
                            warn!("Closing connection from {}: {}", peer, e);
                            return Err(e);
                        }
                    }
                    Ok(Decoded::NeedMoreData) => break,
                    Ok(Decoded::EndOfStream) => {
                        info!(
                            "Peer {} ended stream; frames received: {}",
                            peer, frames_received
                        );
                        return Ok(ReceiveSummary {
                            peer,
                            frames_received,
                            bytes_received,
                            end: StreamEnd::EndOfStream,
                        });
                    }
                    Err(source) => {
                        warn!("Closing connection from {}: {}", peer, source);
                        return Err(IngestError::Codec { peer, source });
                    }
                }
            }
        }
    }
}
