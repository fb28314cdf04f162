//! edgecast - sensor ingestion CLI
//!
//! Subcommands:
//! - `edgecast ingest` - wait for a session and ingest every sensor stream
//! - `edgecast receive` - run one socket receiver against the active session
//! - `edgecast send <addr> <dir>` - stream a directory of frames to a receiver
//! - `edgecast upload <dir>` - post audio segments to the HTTP endpoint
//! - `edgecast session ...` - start, end or watch sessions
//! - `edgecast config` - print the effective configuration

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use edgecast::ingest;
use edgecast::sessions::{SessionMonitor, SessionState};
use edgecast::store::SqliteStore;
use edgecast::stream::{CaptureHub, DirectorySource, SegmentUploader, StreamSender};
use edgecast::telemetry;
use edgeconf::{EdgeConfig, ReceiverConfig};
use edgeproto::Framing;
use tracing::info;

#[derive(Parser)]
#[command(name = "edgecast")]
#[command(about = "Ingest sensor streams into recording sessions")]
#[command(version)]
struct Cli {
    /// Config file, read in place of ./edgecast.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a new session and ingest until it ends
    Ingest,

    /// Run a single socket receiver against the active session
    Receive {
        /// Address to listen on (e.g., 0.0.0.0:5520)
        #[arg(short, long)]
        listen: String,

        /// json-header or bare-length
        #[arg(short, long, default_value = "json-header")]
        framing: String,

        /// Sensor type registered for connecting peers
        #[arg(long, default_value = "Camera")]
        sensor_type: String,

        /// Extension for stored frame files
        #[arg(long, default_value = "jpg")]
        extension: String,
    },

    /// Stream the files of a directory to a receiver, one frame per file
    Send {
        /// Receiver address (host:port)
        addr: String,

        /// Directory of frame files, sent in name order
        dir: PathBuf,

        /// json-header or bare-length
        #[arg(short, long, default_value = "json-header")]
        framing: String,

        /// Pause between frames in milliseconds
        #[arg(short, long, default_value = "0")]
        interval_ms: u64,

        /// Capture buffer size in frames
        #[arg(long, default_value = "32")]
        capacity: usize,
    },

    /// Upload recorded audio segments over HTTP
    Upload {
        /// Directory of segment files
        dir: PathBuf,

        /// Ingestion endpoint (default: http://127.0.0.1:<http_port>/)
        #[arg(short, long)]
        url: Option<String>,

        /// Delete each file after a successful upload
        #[arg(long)]
        delete: bool,
    },

    /// Manage recording sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Print the effective configuration and where it came from
    Config,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a session, registering its sensors
    Start {
        /// Sensor as TYPE=IP (e.g., PiCamera=192.168.1.20); repeatable
        #[arg(short, long = "sensor")]
        sensors: Vec<String>,
    },

    /// End the most recently started session
    End,

    /// Show the latest session
    Status,

    /// Block until a session newer than the current latest one starts
    Wait,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, sources) = EdgeConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    telemetry::init(&config.infra.telemetry.log_level)
        .context("Failed to initialize logging")?;

    match cli.command {
        Commands::Ingest => ingest::run_ingest(&config).await?,

        Commands::Receive {
            listen,
            framing,
            sensor_type,
            extension,
        } => {
            let receiver = ReceiverConfig {
                name: "cli".to_string(),
                listen,
                sensor_type,
                framing,
                extension,
            };
            ingest::run_receiver(&config, &receiver).await?;
        }

        Commands::Send {
            addr,
            dir,
            framing,
            interval_ms,
            capacity,
        } => send_dir(&addr, dir, &framing, interval_ms, capacity).await?,

        Commands::Upload { dir, url, delete } => {
            let url = url.unwrap_or_else(|| {
                format!("http://127.0.0.1:{}/", config.infra.bind.http_port)
            });
            let uploaded = SegmentUploader::new(url).upload_dir(&dir, delete).await?;
            println!("Uploaded {} segments", uploaded);
        }

        Commands::Session { action } => session_command(&config, action).await?,

        Commands::Config => {
            for file in &sources.files {
                println!("# from {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("# env {}", var);
            }
            print!("{}", config.to_toml());
        }
    }

    Ok(())
}

async fn send_dir(
    addr: &str,
    dir: PathBuf,
    framing: &str,
    interval_ms: u64,
    capacity: usize,
) -> Result<()> {
    let framing: Framing = framing.parse()?;
    let hub = CaptureHub::new(capacity);
    let mut feed = hub.subscribe();
    let mut sender = StreamSender::connect(addr, framing).await?;

    let source = DirectorySource::new(dir).with_interval(Duration::from_millis(interval_ms));
    let capture = tokio::spawn(source.run(hub));

    let sent = sender.stream_from(&mut feed).await?;
    sender.finish().await?;
    let published = capture.await??;

    info!(
        "Sent {} of {} frames ({} dropped while catching up)",
        sent,
        published,
        feed.skipped()
    );
    Ok(())
}

async fn session_command(config: &EdgeConfig, action: SessionAction) -> Result<()> {
    config.prepare_paths()?;
    let store = SqliteStore::open(&config.infra.paths.db_path)?;

    match action {
        SessionAction::Start { sensors } => {
            let sensors = sensors
                .iter()
                .map(|s| parse_sensor(s))
                .collect::<Result<Vec<_>>>()?;
            let sensor_config = serde_json::json!({
                "sensors": sensors
                    .iter()
                    .map(|(kind, ip)| serde_json::json!({ "type": kind, "ip": ip.to_string() }))
                    .collect::<Vec<_>>(),
            });

            let session = store.create_session(Utc::now(), &sensor_config)?;
            for (index, (kind, ip)) in sensors.iter().enumerate() {
                let name = format!("{}-{}", kind, index + 1);
                let id = store.register_named_sensor(session.id, *ip, &name, kind)?;
                println!("Registered {} {} at {} as sensor {}", kind, name, ip, id);
            }
            println!("Started session {} at {}", session.id, session.start);
        }

        SessionAction::End => {
            let monitor = SessionMonitor::with_baseline(store, None);
            match monitor.end_latest_session().await? {
                Some(session) => println!("Ended session {}", session.id),
                None => println!("No sessions"),
            }
        }

        SessionAction::Status => {
            let monitor = SessionMonitor::with_baseline(store.clone(), None);
            match monitor.state().await? {
                SessionState::NoSession => println!("No sessions"),
                SessionState::Active(session) | SessionState::Ended(session) => {
                    let sensors = store.list_sensors(session.id)?;
                    println!(
                        "Session {} started {} ({})",
                        session.id,
                        session.start,
                        match session.end {
                            Some(end) => format!("ended {}", end),
                            None => "active".to_string(),
                        }
                    );
                    for sensor in sensors {
                        println!("  {} {} {} {}", sensor.id, sensor.sensor_type, sensor.name, sensor.ip);
                    }
                }
            }
        }

        SessionAction::Wait => {
            let monitor = SessionMonitor::new(store)?
                .with_poll_interval(Duration::from_millis(config.session.poll_interval_ms));
            tokio::select! {
                session = monitor.block_until_new_session() => {
                    println!("Session {} started at {}", session.id, session.start);
                }
                _ = tokio::signal::ctrl_c() => println!("Interrupted"),
            }
        }
    }

    Ok(())
}

fn parse_sensor(arg: &str) -> Result<(String, IpAddr)> {
    let Some((kind, ip)) = arg.split_once('=') else {
        bail!("Sensor must be TYPE=IP, got {:?}", arg);
    };
    let ip: IpAddr = ip
        .trim()
        .parse()
        .with_context(|| format!("Invalid IP address in {:?}", arg))?;
    Ok((kind.trim().to_string(), ip))
}
