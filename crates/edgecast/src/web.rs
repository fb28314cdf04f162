//! HTTP ingestion endpoints.
//!
//! Audio recorders post finished segments to `/`, Sense HAT boards post
//! readings to `/sense`. Every request is parsed into an [`IngestRequest`]
//! and handled in [`dispatch`], so adding a data type means adding a variant.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use edgeproto::Frame;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::segments::SegmentBatcher;
use crate::store::{sensor_types, PersistenceSink, SenseReading, SessionId, SqliteStore};

/// Shared state for web handlers
#[derive(Clone)]
pub struct WebState {
    pub session_id: SessionId,
    pub store: SqliteStore,
    pub audio: Arc<Mutex<SegmentBatcher<SqliteStore>>>,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/", post(ingest))
        .route("/sense", post(ingest))
        .route("/health", get(ingest))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: WebState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("HTTP ingestion listening on {}", listener.local_addr()?);
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            debug!("HTTP server shutdown signal received");
        })
        .await
}

/// Why a request was rejected before reaching storage.
#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid {name} header: {value:?}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("Invalid sense reading: {0}")]
    InvalidReading(String),

    #[error("No handler for {0}")]
    UnknownPath(String),
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestRequest {
    AudioSegment {
        peer: IpAddr,
        /// Milliseconds since the Unix epoch.
        timestamp: f64,
        filename: Option<String>,
        body: Bytes,
    },
    SenseReading {
        peer: IpAddr,
        reading: SenseReading,
    },
    Health,
}

impl IngestRequest {
    pub fn parse(
        peer: IpAddr,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Self, RequestError> {
        match path {
            "/" => {
                let raw = header_str(headers, "timestamp")?
                    .ok_or(RequestError::MissingHeader("timestamp"))?;
                let timestamp = raw
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|t| t.is_finite())
                    .ok_or_else(|| RequestError::InvalidHeader {
                        name: "timestamp",
                        value: raw.to_string(),
                    })?;
                let filename = header_str(headers, "filename")?.map(str::to_string);
                Ok(IngestRequest::AudioSegment {
                    peer,
                    timestamp,
                    filename,
                    body,
                })
            }
            "/sense" => Ok(IngestRequest::SenseReading {
                peer,
                reading: parse_sense(&body)?,
            }),
            "/health" => Ok(IngestRequest::Health),
            other => Err(RequestError::UnknownPath(other.to_string())),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, RequestError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| RequestError::InvalidHeader {
                name,
                value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            }),
    }
}

/// Parse `Temp=..&Press=..&Humid=..`, rounding each value to 4 decimals.
pub fn parse_sense(body: &[u8]) -> Result<SenseReading, RequestError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| RequestError::InvalidReading("body is not UTF-8".to_string()))?;

    let (mut temperature, mut pressure, mut humidity) = (None, None, None);
    for pair in text.trim().split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| RequestError::InvalidReading(format!("expected key=value, got {:?}", pair)))?;
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| RequestError::InvalidReading(format!("{} is not a number: {:?}", key, value)))?;
        match key.trim().to_ascii_lowercase().as_str() {
            "temp" | "temperature" => temperature = Some(round4(value)),
            "press" | "pressure" => pressure = Some(round4(value)),
            "humid" | "humidity" => humidity = Some(round4(value)),
            _ => debug!("Ignoring sense field {:?}", key),
        }
    }

    match (temperature, pressure, humidity) {
        (Some(temperature), Some(pressure), Some(humidity)) => Ok(SenseReading {
            temperature,
            pressure,
            humidity,
        }),
        _ => Err(RequestError::InvalidReading(
            "Temp, Press and Humid are all required".to_string(),
        )),
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

async fn ingest(
    State(state): State<WebState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match IngestRequest::parse(peer.ip(), uri.path(), &headers, body) {
        Ok(request) => dispatch(state, request).await,
        Err(e) => {
            warn!("Rejected request from {}: {}", peer, e);
            e.into_response()
        }
    }
}

/// Handle one parsed request. Storage runs on the blocking pool.
pub async fn dispatch(state: WebState, request: IngestRequest) -> Response {
    match request {
        IngestRequest::Health => Json(serde_json::json!({
            "status": "ok",
            "session_id": state.session_id,
        }))
        .into_response(),

        IngestRequest::AudioSegment {
            peer,
            timestamp,
            filename,
            body,
        } => {
            let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                let sensor_id = state
                    .store
                    .register_sensor(state.session_id, peer, sensor_types::MICROPHONE)?;
                let mut batcher = state
                    .audio
                    .lock()
                    .map_err(|_| anyhow!("audio batcher lock poisoned"))?;
                let number = batcher.next_frame_number(sensor_id);
                let accepted = batcher.accept_frame(sensor_id, &Frame::new(number, timestamp, body))?;
                debug!(
                    "Stored audio segment {} from {} ({:?}) at {}",
                    number,
                    peer,
                    filename,
                    accepted.path.display()
                );
                Ok(())
            })
            .await;
            storage_response(result)
        }

        IngestRequest::SenseReading { peer, reading } => {
            let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                let sensor_id = state
                    .store
                    .register_sensor(state.session_id, peer, sensor_types::SENSE_HAT)?;
                state
                    .store
                    .insert_sense_reading(state.session_id, sensor_id, peer, Utc::now(), &reading)
            })
            .await;
            storage_response(result)
        }
    }
}

/// Stored requests get a bare 200.
fn storage_response(result: Result<anyhow::Result<()>, tokio::task::JoinError>) -> Response {
    match result {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(e)) => {
            warn!("Failed to store request: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            warn!("Storage task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
