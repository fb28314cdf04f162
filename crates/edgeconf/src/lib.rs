//! Configuration loading for edgecast.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/edgecast/config.toml` (system)
//! 2. `~/.config/edgecast/config.toml` (user)
//! 3. `./edgecast.toml` or the `--config` path (local override)
//! 4. Environment variables (`EDGECAST_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! data_dir = "/srv/edgecast/data"
//! db_path = "~/.local/share/edgecast/edgecast.db"
//!
//! [bind]
//! http_port = 5515
//!
//! [ingest]
//! frames_per_record = 2
//! frames_per_shard = 10
//!
//! [session]
//! poll_interval_ms = 500
//!
//! [[receivers]]
//! name = "cam-east"
//! listen = "0.0.0.0:5520"
//! framing = "json-header"
//! sensor_type = "Camera"
//! extension = "jpg"
//! ```

pub mod infra;
pub mod ingest;
pub mod loader;

pub use infra::{BindConfig, InfraConfig, PathsConfig, TelemetryConfig};
pub use ingest::{CameraConfig, IngestConfig, ReceiverConfig, SessionConfig};
pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete edgecast configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EdgeConfig {
    #[serde(flatten)]
    pub infra: InfraConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
}

impl EdgeConfig {
    /// Load configuration and report which files and env vars contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = EdgeConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            loader::apply_file(&mut config, &path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Create the data directory and the database's parent directory.
    pub fn prepare_paths(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.infra.paths.data_dir).with_context(|| {
            format!(
                "Failed to create data directory {}",
                self.infra.paths.data_dir.display()
            )
        })?;
        if let Some(parent) = self.infra.paths.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }
        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        // Built by hand to keep section order stable and readable
        let mut output = String::new();

        output.push_str("# edgecast configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "data_dir = \"{}\"\n",
            self.infra.paths.data_dir.display()
        ));
        output.push_str(&format!(
            "db_path = \"{}\"\n",
            self.infra.paths.db_path.display()
        ));

        output.push_str("\n[bind]\n");
        output.push_str(&format!("http_addr = \"{}\"\n", self.infra.bind.http_addr));
        output.push_str(&format!("http_port = {}\n", self.infra.bind.http_port));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.infra.telemetry.log_level
        ));

        output.push_str("\n[ingest]\n");
        output.push_str(&format!(
            "frames_per_record = {}\n",
            self.ingest.frames_per_record
        ));
        output.push_str(&format!(
            "frames_per_shard = {}\n",
            self.ingest.frames_per_shard
        ));
        output.push_str(&format!(
            "audio_extension = \"{}\"\n",
            self.ingest.audio_extension
        ));
        output.push_str(&format!(
            "max_payload_bytes = {}\n",
            self.ingest.max_payload_bytes
        ));

        output.push_str("\n[camera]\n");
        output.push_str(&format!("mjpeg_port = {}\n", self.camera.mjpeg_port));
        output.push_str(&format!("mjpeg_path = \"{}\"\n", self.camera.mjpeg_path));
        output.push_str(&format!(
            "frames_per_record = {}\n",
            self.camera.frames_per_record
        ));
        output.push_str(&format!(
            "frames_per_shard = {}\n",
            self.camera.frames_per_shard
        ));

        output.push_str("\n[session]\n");
        output.push_str(&format!(
            "poll_interval_ms = {}\n",
            self.session.poll_interval_ms
        ));
        output.push_str(&format!(
            "max_duration_secs = {}\n",
            self.session.max_duration_secs
        ));

        for receiver in &self.receivers {
            output.push_str("\n[[receivers]]\n");
            output.push_str(&format!("name = \"{}\"\n", receiver.name));
            output.push_str(&format!("listen = \"{}\"\n", receiver.listen));
            output.push_str(&format!("sensor_type = \"{}\"\n", receiver.sensor_type));
            output.push_str(&format!("framing = \"{}\"\n", receiver.framing));
            output.push_str(&format!("extension = \"{}\"\n", receiver.extension));
        }

        output
    }
}
