//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem locations for frame files and the session database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Root of the `{session}/{sensor}/{shard}/frame-N.ext` tree.
    /// Default: ./data
    #[serde(default = "PathsConfig::default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite database holding sessions, sensors and segment records.
    /// Default: ~/.local/share/edgecast/edgecast.db
    #[serde(default = "PathsConfig::default_db_path")]
    pub db_path: PathBuf,
}

impl PathsConfig {
    fn default_data_dir() -> PathBuf {
        PathBuf::from("data")
    }

    fn default_db_path() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/edgecast/edgecast.db"))
            .unwrap_or_else(|| PathBuf::from("edgecast.db"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            db_path: Self::default_db_path(),
        }
    }
}

/// HTTP ingestion listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindConfig {
    /// Default: 0.0.0.0
    #[serde(default = "BindConfig::default_http_addr")]
    pub http_addr: String,

    /// Port for audio segment uploads, sense readings and health.
    /// Default: 5515
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: u16,
}

impl BindConfig {
    fn default_http_addr() -> String {
        "0.0.0.0".to_string()
    }

    fn default_http_port() -> u16 {
        5515
    }

    pub fn http_endpoint(&self) -> String {
        format!("{}:{}", self.http_addr, self.http_port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            http_addr: Self::default_http_addr(),
            http_port: Self::default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// All infrastructure settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct InfraConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}
