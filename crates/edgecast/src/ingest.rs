//! Ingestion supervisor.
//!
//! Waits for the recording front end to start a session, then runs every
//! ingestion path for that session until it ends:
//!
//! - the HTTP server for audio segments and Sense HAT readings
//! - one socket receiver per `[[receivers]]` entry
//! - one MJPEG puller per registered PiCamera

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use edgeconf::{EdgeConfig, ReceiverConfig};
use edgeproto::Framing;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::segments::{BatchPolicy, SegmentBatcher, ShardLayout};
use crate::sessions::SessionMonitor;
use crate::store::{sensor_types, PersistenceSink, Session, SessionId, SqliteStore};
use crate::stream::{Blocking, MjpegPuller, StreamReceiver};
use crate::web::{self, WebState};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type Tasks = JoinSet<(String, Result<()>)>;

/// Run one full ingestion cycle: wait for a session, ingest, shut down.
pub async fn run_ingest(config: &EdgeConfig) -> Result<()> {
    config.prepare_paths()?;
    let store = SqliteStore::open(&config.infra.paths.db_path)?;
    let monitor = SessionMonitor::new(store.clone())?
        .with_poll_interval(Duration::from_millis(config.session.poll_interval_ms));

    let session = tokio::select! {
        session = monitor.block_until_new_session() => session,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before a session started");
            return Ok(());
        }
    };

    let shutdown = CancellationToken::new();
    let mut tasks = Tasks::new();

    spawn_http(config, &store, session.id, &shutdown, &mut tasks).await?;
    for receiver in &config.receivers {
        spawn_receiver(config, receiver, &store, session.id, &shutdown, &mut tasks).await?;
    }
    spawn_camera_pullers(config, &store, &session, &shutdown, &mut tasks)?;
    info!("Ingesting session {} with {} tasks", session.id, tasks.len());

    let stop = wait_for_stop(&monitor, session.id, config.session.max_duration_secs).await;
    info!("Stopping ingestion of session {}: {:?}", session.id, stop);

    shutdown.cancel();
    drain(tasks).await;
    info!("Data ingestion closed");
    Ok(())
}

/// Run the configured receiver against the active session until Ctrl-C.
pub async fn run_receiver(config: &EdgeConfig, receiver: &ReceiverConfig) -> Result<()> {
    config.prepare_paths()?;
    let store = SqliteStore::open(&config.infra.paths.db_path)?;
    let session = store
        .get_active_session()?
        .context("No active session; start one with `edgecast session start`")?;

    let shutdown = CancellationToken::new();
    let mut tasks = Tasks::new();
    spawn_receiver(config, receiver, &store, session.id, &shutdown, &mut tasks).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        Some(joined) = tasks.join_next() => log_joined(joined),
    }
    shutdown.cancel();
    drain(tasks).await;
    Ok(())
}

/// Why ingestion of a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    SessionEnded,
    TimeLimit,
    Interrupted,
}

/// Wait for the session to end, hit its time limit, or for Ctrl-C.
///
/// A session that runs out of time is ended here. Failing to record that
/// is logged; ingestion still stops.
async fn wait_for_stop<S>(monitor: &SessionMonitor<S>, session_id: SessionId, max_duration_secs: u64) -> Stop
where
    S: PersistenceSink + Clone + 'static,
{
    tokio::select! {
        _ = monitor.block_until_end(session_id) => Stop::SessionEnded,
        _ = session_deadline(max_duration_secs) => {
            info!("Session {} reached its time limit", session_id);
            if let Err(e) = monitor.end_latest_session().await {
                error!("Failed to end session {}: {:#}", session_id, e);
            }
            Stop::TimeLimit
        }
        _ = tokio::signal::ctrl_c() => Stop::Interrupted,
    }
}

async fn session_deadline(max_duration_secs: u64) {
    if max_duration_secs == 0 {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(Duration::from_secs(max_duration_secs)).await;
    }
}

async fn spawn_http(
    config: &EdgeConfig,
    store: &SqliteStore,
    session_id: SessionId,
    shutdown: &CancellationToken,
    tasks: &mut Tasks,
) -> Result<()> {
    let endpoint = config.infra.bind.http_endpoint();
    let listener = tokio::net::TcpListener::bind(&endpoint)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", endpoint))?;

    let audio = SegmentBatcher::new(
        store.clone(),
        session_id,
        ShardLayout::new(&config.infra.paths.data_dir, &config.ingest.audio_extension),
        BatchPolicy::new(config.ingest.frames_per_record, config.ingest.frames_per_shard),
    );
    let state = WebState {
        session_id,
        store: store.clone(),
        audio: Arc::new(Mutex::new(audio)),
    };

    let shutdown = shutdown.clone();
    tasks.spawn(async move {
        let result: Result<()> = web::serve(listener, state, shutdown).await.map_err(Into::into);
        ("http".to_string(), result)
    });
    Ok(())
}

async fn spawn_receiver(
    config: &EdgeConfig,
    receiver_config: &ReceiverConfig,
    store: &SqliteStore,
    session_id: SessionId,
    shutdown: &CancellationToken,
    tasks: &mut Tasks,
) -> Result<()> {
    let framing: Framing = receiver_config
        .framing
        .parse()
        .with_context(|| format!("Receiver {}", receiver_config.name))?;
    let receiver = StreamReceiver::bind(&receiver_config.listen, framing)
        .await
        .with_context(|| {
            format!(
                "Failed to bind receiver {} to {}",
                receiver_config.name, receiver_config.listen
            )
        })?
        .with_max_payload(config.ingest.max_payload_bytes);

    let batcher = SegmentBatcher::new(
        store.clone(),
        session_id,
        ShardLayout::new(&config.infra.paths.data_dir, &receiver_config.extension),
        BatchPolicy::new(config.ingest.frames_per_record, config.ingest.frames_per_shard),
    );
    let name = receiver_config.name.clone();
    let sensor_type = receiver_config.sensor_type.clone();
    let shutdown = shutdown.clone();

    tasks.spawn(async move {
        let result = receive_loop(receiver, batcher, &sensor_type, shutdown).await;
        (name, result)
    });
    Ok(())
}

/// Serve peers one at a time, keeping sensor counters across connections.
///
/// A sensor that reconnects continues its frame numbering; see
/// [`SegmentBatcher::feed`]. Storage runs through [`Blocking`].
async fn receive_loop(
    receiver: StreamReceiver,
    mut batcher: SegmentBatcher<SqliteStore>,
    sensor_type: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let session_id = batcher.session_id();
    loop {
        let conn = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            conn = receiver.accept() => conn?,
        };
        let peer = conn.peer();

        let registered = tokio::task::block_in_place(|| {
            batcher.sink().register_sensor(session_id, peer.ip(), sensor_type)
        });
        let sensor_id = match registered {
            Ok(id) => id,
            Err(e) => {
                warn!("Could not register {} sensor for {}: {:#}", sensor_type, peer, e);
                continue;
            }
        };

        let mut feed = Blocking(batcher.feed(sensor_id));
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = conn.run(&mut feed) => match result {
                Ok(summary) => info!(
                    "Sensor {} delivered {} frames ({} bytes)",
                    sensor_id, summary.frames_received, summary.bytes_received
                ),
                Err(e) => warn!("Stream from {} ended early: {}", peer, e),
            },
        }
    }
}

fn spawn_camera_pullers(
    config: &EdgeConfig,
    store: &SqliteStore,
    session: &Session,
    shutdown: &CancellationToken,
    tasks: &mut Tasks,
) -> Result<()> {
    let cameras = tokio::task::block_in_place(|| store.list_sensors(session.id))?
        .into_iter()
        .filter(|s| s.sensor_type == sensor_types::PI_CAMERA);

    for camera in cameras {
        let url = config.camera.stream_url(&url_host(camera.ip));
        let puller = MjpegPuller::new(url).with_max_part(config.ingest.max_payload_bytes);
        let mut batcher = SegmentBatcher::new(
            store.clone(),
            session.id,
            ShardLayout::new(&config.infra.paths.data_dir, "jpg"),
            BatchPolicy::new(config.camera.frames_per_record, config.camera.frames_per_shard),
        );
        let shutdown = shutdown.clone();
        let name = format!("camera {}", camera.id);

        tasks.spawn(async move {
            let mut feed = Blocking(batcher.feed(camera.id));
            let result: Result<()> = tokio::select! {
                _ = shutdown.cancelled() => Ok(()),
                pulled = puller.run(&mut feed) => pulled.map(|_| ()).map_err(Into::into),
            };
            (name, result)
        });
    }
    Ok(())
}

fn url_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}

fn log_joined(joined: Result<(String, Result<()>), tokio::task::JoinError>) {
    match joined {
        Ok((name, Ok(()))) => info!("{} stopped", name),
        Ok((name, Err(e))) => warn!("{} failed: {:#}", name, e),
        Err(e) => error!("Ingestion task panicked: {}", e),
    }
}

/// Wait for tasks to notice shutdown, then abort stragglers.
async fn drain(mut tasks: Tasks) {
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(joined) = tasks.join_next().await {
            log_joined(joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!("Aborting {} tasks that did not stop in time", tasks.len());
        tasks.abort_all();
    }
}
