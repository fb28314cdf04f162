//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, EdgeConfig, ReceiverConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in load order (system, user, local).
///
/// Only returns files that exist. If `cli_path` is provided and exists, it
/// replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/edgecast/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("edgecast/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("edgecast.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file and apply its keys on top of `config`.
pub fn apply_file(config: &mut EdgeConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    apply_toml(config, &contents, path)
}

/// Apply the keys present in `contents`; absent keys keep their current value.
pub fn apply_toml(config: &mut EdgeConfig, contents: &str, path: &Path) -> Result<(), ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if let Some(paths) = table.get("paths").and_then(|v| v.as_table()) {
        if let Some(v) = paths.get("data_dir").and_then(|v| v.as_str()) {
            config.infra.paths.data_dir = expand_path(v);
        }
        if let Some(v) = paths.get("db_path").and_then(|v| v.as_str()) {
            config.infra.paths.db_path = expand_path(v);
        }
    }

    if let Some(bind) = table.get("bind").and_then(|v| v.as_table()) {
        if let Some(v) = bind.get("http_addr").and_then(|v| v.as_str()) {
            config.infra.bind.http_addr = v.to_string();
        }
        if let Some(v) = integer(bind, "http_port", path)? {
            config.infra.bind.http_port = v;
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            config.infra.telemetry.log_level = v.to_string();
        }
    }

    if let Some(ingest) = table.get("ingest").and_then(|v| v.as_table()) {
        if let Some(v) = integer(ingest, "frames_per_record", path)? {
            config.ingest.frames_per_record = v;
        }
        if let Some(v) = integer(ingest, "frames_per_shard", path)? {
            config.ingest.frames_per_shard = v;
        }
        if let Some(v) = ingest.get("audio_extension").and_then(|v| v.as_str()) {
            config.ingest.audio_extension = v.to_string();
        }
        if let Some(v) = integer(ingest, "max_payload_bytes", path)? {
            config.ingest.max_payload_bytes = v;
        }
    }

    if let Some(camera) = table.get("camera").and_then(|v| v.as_table()) {
        if let Some(v) = integer(camera, "mjpeg_port", path)? {
            config.camera.mjpeg_port = v;
        }
        if let Some(v) = camera.get("mjpeg_path").and_then(|v| v.as_str()) {
            config.camera.mjpeg_path = v.to_string();
        }
        if let Some(v) = integer(camera, "frames_per_record", path)? {
            config.camera.frames_per_record = v;
        }
        if let Some(v) = integer(camera, "frames_per_shard", path)? {
            config.camera.frames_per_shard = v;
        }
    }

    if let Some(session) = table.get("session").and_then(|v| v.as_table()) {
        if let Some(v) = integer(session, "poll_interval_ms", path)? {
            config.session.poll_interval_ms = v;
        }
        if let Some(v) = integer(session, "max_duration_secs", path)? {
            config.session.max_duration_secs = v;
        }
    }

    // A file that lists receivers replaces the whole set
    if let Some(receivers) = table.get("receivers") {
        let receivers: Vec<ReceiverConfig> =
            receivers.clone().try_into().map_err(|e: toml::de::Error| ConfigError::Parse {
                path: path.to_path_buf(),
                message: format!("receivers: {}", e),
            })?;
        config.receivers = receivers;
    }

    Ok(())
}

/// Integer key that has to fit the field it sets.
fn integer<T: TryFrom<i64>>(table: &toml::Table, key: &str, path: &Path) -> Result<Option<T>, ConfigError> {
    let Some(v) = table.get(key).and_then(|v| v.as_integer()) else {
        return Ok(None);
    };
    T::try_from(v).map(Some).map_err(|_| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("{} = {} is out of range", key, v),
    })
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut EdgeConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("EDGECAST_DATA_DIR") {
        config.infra.paths.data_dir = expand_path(&v);
        sources.env_overrides.push("EDGECAST_DATA_DIR".to_string());
    }
    if let Ok(v) = env::var("EDGECAST_DB_PATH") {
        config.infra.paths.db_path = expand_path(&v);
        sources.env_overrides.push("EDGECAST_DB_PATH".to_string());
    }

    if let Ok(v) = env::var("EDGECAST_HTTP_PORT") {
        if let Ok(port) = v.parse() {
            config.infra.bind.http_port = port;
            sources.env_overrides.push("EDGECAST_HTTP_PORT".to_string());
        }
    }

    if let Ok(v) = env::var("EDGECAST_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("EDGECAST_LOG_LEVEL".to_string());
    }
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Ok(v) = env::var("EDGECAST_FRAMES_PER_RECORD") {
        if let Ok(n) = v.parse() {
            config.ingest.frames_per_record = n;
            sources.env_overrides.push("EDGECAST_FRAMES_PER_RECORD".to_string());
        }
    }
    if let Ok(v) = env::var("EDGECAST_FRAMES_PER_SHARD") {
        if let Ok(n) = v.parse() {
            config.ingest.frames_per_shard = n;
            sources.env_overrides.push("EDGECAST_FRAMES_PER_SHARD".to_string());
        }
    }
    if let Ok(v) = env::var("EDGECAST_POLL_INTERVAL_MS") {
        if let Ok(ms) = v.parse() {
            config.session.poll_interval_ms = ms;
            sources.env_overrides.push("EDGECAST_POLL_INTERVAL_MS".to_string());
        }
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            match env::var(var_name) {
                Ok(var_value) => PathBuf::from(var_value).join(&stripped[slash_pos + 1..]),
                Err(_) => PathBuf::from(path),
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
