//! Pull a camera's MJPEG HTTP stream as numbered frames.

use edgeproto::{now_millis, Frame, MjpegSplitter, DEFAULT_MAX_PART};
use futures::StreamExt;
use tracing::{debug, info};

use super::FrameHandler;
use crate::error::{IngestError, IngestResult};

pub struct MjpegPuller {
    client: reqwest::Client,
    url: String,
    max_part: usize,
}

impl MjpegPuller {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            max_part: DEFAULT_MAX_PART,
        }
    }

    /// Largest JPEG part accepted before the stream is abandoned.
    pub fn with_max_part(mut self, max_part: usize) -> Self {
        self.max_part = max_part;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Read the stream until the camera closes it, numbering parts from 1.
    ///
    /// Parts without a `Timestamp:` header are stamped with the receive time.
    pub async fn run<H>(&self, handler: &mut H) -> IngestResult<u64>
    where
        H: FrameHandler + ?Sized,
    {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.http_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(self.http_error(format!("status {}", response.status())));
        }
        info!("Pulling MJPEG stream from {}", self.url);

        let mut stream = response.bytes_stream();
        let mut splitter = MjpegSplitter::new().with_max_part(self.max_part);
        let mut number = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.http_error(e.to_string()))?;
            splitter.push(&chunk);

            while let Some(part) = splitter
                .next_part()
                .map_err(|e| self.http_error(e.to_string()))?
            {
                number += 1;
                let timestamp = part.timestamp.unwrap_or_else(now_millis);
                handler.on_frame(Frame::new(number, timestamp, part.data))?;
            }
        }

        debug!(
            "MJPEG stream {} closed with {} bytes unparsed",
            self.url,
            splitter.buffered()
        );
        info!("MJPEG stream {} ended after {} frames", self.url, number);
        Ok(number)
    }

    fn http_error(&self, message: String) -> IngestError {
        IngestError::Http {
            url: self.url.clone(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    fn part(timestamp: Option<&str>, body: &[u8]) -> Vec<u8> {
        let mut out = b"--FRAME\r\nContent-Type: image/jpeg\r\n".to_vec();
        if let Some(ts) = timestamp {
            out.extend_from_slice(format!("Timestamp: {}\r\n", ts).as_bytes());
        }
        out.extend_from_slice(b"\r\n\xff\xd8");
        out.extend_from_slice(body);
        out.extend_from_slice(b"\xff\xd9\r\n");
        out
    }

    async fn stream() -> impl IntoResponse {
        let mut body = part(Some("1700000000123.5"), b"first");
        body.extend(part(None, b"second"));
        (
            [(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=FRAME")],
            Body::from(body),
        )
    }

    #[tokio::test]
    async fn numbers_parts_and_reads_timestamps() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/stream.mjpg", get(stream));
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let puller = MjpegPuller::new(format!("http://{}/stream.mjpg", addr));
        let before = now_millis();
        let mut frames = Vec::new();
        let count = puller
            .run(&mut |frame: Frame| -> IngestResult<()> {
                frames.push(frame);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(frames[0].number, 1);
        assert_eq!(frames[0].timestamp, 1700000000123.5);
        assert_eq!(&frames[0].payload[2..7], b"first");
        assert_eq!(frames[1].number, 2);
        assert!(frames[1].timestamp >= before);
    }

    #[tokio::test]
    async fn missing_stream_is_an_http_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, Router::new()).await.unwrap() });

        let puller = MjpegPuller::new(format!("http://{}/stream.mjpg", addr));
        let err = puller
            .run(&mut |_frame: Frame| -> IngestResult<()> { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Http { .. }));
    }

    async fn serve_body(body: Vec<u8>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/stream.mjpg", get(move || async move { Body::from(body) }));
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}/stream.mjpg", addr)
    }

    #[tokio::test]
    async fn non_jpeg_body_yields_no_frames() {
        let url = serve_body(b"<html>wrong path</html>".repeat(10_000)).await;
        let count = MjpegPuller::new(url)
            .run(&mut |_frame: Frame| -> IngestResult<()> { panic!("no frame expected") })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn oversized_part_ends_the_pull() {
        let mut body = vec![0xff, 0xd8];
        body.extend(std::iter::repeat(0u8).take(4096));
        let url = serve_body(body).await;

        let err = MjpegPuller::new(url)
            .with_max_part(1024)
            .run(&mut |_frame: Frame| -> IngestResult<()> { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Http { ref message, .. } if message.contains("too large")));
    }
}
