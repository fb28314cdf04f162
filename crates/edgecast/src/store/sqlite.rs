use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection, OpenFlags, OptionalExtension, Row};

use super::types::*;
use super::PersistenceSink;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_ms INTEGER NOT NULL,
    end_ms INTEGER,
    sensor_config JSON NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_sessions_start ON sessions(start_ms DESC);

CREATE TABLE IF NOT EXISTS session_sensors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    ip TEXT NOT NULL,
    name TEXT NOT NULL,
    sensor_type TEXT NOT NULL,
    UNIQUE (session_id, ip, sensor_type)
);

CREATE TABLE IF NOT EXISTS segment_batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    sensor_id INTEGER NOT NULL REFERENCES session_sensors(id) ON DELETE CASCADE,
    first_timestamp REAL NOT NULL,
    last_timestamp REAL NOT NULL,
    first_number INTEGER NOT NULL,
    last_number INTEGER NOT NULL,
    metadata JSON NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_segment_batches_sensor
    ON segment_batches(session_id, sensor_id, first_number);

CREATE TABLE IF NOT EXISTS sense_readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    sensor_id INTEGER NOT NULL REFERENCES session_sensors(id) ON DELETE CASCADE,
    ip TEXT NOT NULL,
    recorded_ms INTEGER NOT NULL,
    temperature REAL NOT NULL,
    pressure REAL NOT NULL,
    humidity REAL NOT NULL
);
"#;

/// SQLite-backed sink with connection-per-call pattern.
///
/// Cloning is cheap: a clone is just another handle on the same file, and
/// every call opens its own WAL-mode connection.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Open database at path, creating if necessary
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let store = Self { path };
        store.initialize()?;
        Ok(store)
    }

    /// Create a temporary database file with a unique name.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let db_name = format!("edgecast_{}_{}.db", std::process::id(), unique_id);
        Self::open(std::env::temp_dir().join(db_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a connection with WAL mode and busy timeout
    pub fn conn(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open database: {:?}", self.path))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
        ",
        )?;

        Ok(conn)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize database schema")?;
        Ok(())
    }

    /// Start a new session. Normally done by the recording front end.
    pub fn create_session(
        &self,
        start: DateTime<Utc>,
        sensor_config: &serde_json::Value,
    ) -> Result<Session> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (start_ms, sensor_config) VALUES (?1, ?2)",
            (start.timestamp_millis(), sensor_config.to_string()),
        )?;
        let id = SessionId(conn.last_insert_rowid());

        self.get_session(id)?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created session {}", id))
    }

    pub fn find_sensor(
        &self,
        session_id: SessionId,
        ip: IpAddr,
        sensor_type: &str,
    ) -> Result<Option<SensorId>> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT id FROM session_sensors
                 WHERE session_id = ?1 AND ip = ?2 AND sensor_type = ?3",
                (session_id.0, ip.to_string(), sensor_type),
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(SensorId))
    }

    /// Register a sensor under an explicit display name.
    pub fn register_named_sensor(
        &self,
        session_id: SessionId,
        ip: IpAddr,
        name: &str,
        sensor_type: &str,
    ) -> Result<SensorId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO session_sensors (session_id, ip, name, sensor_type)
             VALUES (?1, ?2, ?3, ?4)",
            (session_id.0, ip.to_string(), name, sensor_type),
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM session_sensors
             WHERE session_id = ?1 AND ip = ?2 AND sensor_type = ?3",
            (session_id.0, ip.to_string(), sensor_type),
            |row| row.get(0),
        )?;
        Ok(SensorId(id))
    }

    pub fn list_sensors(&self, session_id: SessionId) -> Result<Vec<SensorRegistration>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, ip, name, sensor_type
             FROM session_sensors WHERE session_id = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map([session_id.0], |row| {
            Ok(SensorRegistration {
                id: SensorId(row.get(0)?),
                session_id: SessionId(row.get(1)?),
                ip: parse_ip(row, 2)?,
                name: row.get(3)?,
                sensor_type: row.get(4)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Batches for a session, optionally narrowed to one sensor, oldest first.
    pub fn list_segment_batches(
        &self,
        session_id: SessionId,
        sensor_id: Option<SensorId>,
    ) -> Result<Vec<SegmentBatch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, sensor_id, first_timestamp, last_timestamp,
                    first_number, last_number, metadata
             FROM segment_batches
             WHERE session_id = ?1 AND (?2 IS NULL OR sensor_id = ?2)
             ORDER BY sensor_id ASC, first_number ASC",
        )?;

        let rows = stmt.query_map((session_id.0, sensor_id.map(|s| s.0)), |row| {
            Ok(SegmentBatch {
                session_id: SessionId(row.get(0)?),
                sensor_id: SensorId(row.get(1)?),
                first_timestamp: row.get(2)?,
                last_timestamp: row.get(3)?,
                first_number: row.get::<_, i64>(4)? as u64,
                last_number: row.get::<_, i64>(5)? as u64,
                metadata_json: row.get(6)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn insert_sense_reading(
        &self,
        session_id: SessionId,
        sensor_id: SensorId,
        ip: IpAddr,
        recorded: DateTime<Utc>,
        reading: &SenseReading,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sense_readings
                (session_id, sensor_id, ip, recorded_ms, temperature, pressure, humidity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                session_id.0,
                sensor_id.0,
                ip.to_string(),
                recorded.timestamp_millis(),
                reading.temperature,
                reading.pressure,
                reading.humidity,
            ),
        )?;
        Ok(())
    }

    pub fn list_sense_readings(&self, session_id: SessionId) -> Result<Vec<SenseReading>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT temperature, pressure, humidity
             FROM sense_readings WHERE session_id = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map([session_id.0], |row| {
            Ok(SenseReading {
                temperature: row.get(0)?,
                pressure: row.get(1)?,
                humidity: row.get(2)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn query_session(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<Session>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        stmt.query_row(params, session_from_row)
            .optional()
            .map_err(Into::into)
    }
}

const SESSION_COLUMNS: &str = "SELECT id, start_ms, end_ms, sensor_config FROM sessions";

impl PersistenceSink for SqliteStore {
    fn insert_segment_batch(&self, batch: &SegmentBatch) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO segment_batches
                (session_id, sensor_id, first_timestamp, last_timestamp,
                 first_number, last_number, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                batch.session_id.0,
                batch.sensor_id.0,
                batch.first_timestamp,
                batch.last_timestamp,
                batch.first_number as i64,
                batch.last_number as i64,
                &batch.metadata_json,
            ),
        )
        .with_context(|| {
            format!(
                "Failed to insert segment batch {}-{} for sensor {}",
                batch.first_number, batch.last_number, batch.sensor_id
            )
        })?;
        Ok(())
    }

    fn get_active_session(&self) -> Result<Option<Session>> {
        self.query_session(
            &format!("{SESSION_COLUMNS} WHERE end_ms IS NULL ORDER BY start_ms DESC, id DESC LIMIT 1"),
            [],
        )
    }

    fn latest_session(&self) -> Result<Option<Session>> {
        self.query_session(
            &format!("{SESSION_COLUMNS} ORDER BY start_ms DESC, id DESC LIMIT 1"),
            [],
        )
    }

    fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        self.query_session(&format!("{SESSION_COLUMNS} WHERE id = ?1"), [id.0])
    }

    fn register_sensor(&self, session_id: SessionId, ip: IpAddr, sensor_type: &str) -> Result<SensorId> {
        self.register_named_sensor(session_id, ip, sensor_type, sensor_type)
    }

    fn end_session(&self, session_id: SessionId, end: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE sessions SET end_ms = ?2 WHERE id = ?1",
            (session_id.0, end.timestamp_millis()),
        )?;
        if rows == 0 {
            bail!("Session {} not found", session_id);
        }
        Ok(())
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let end_ms: Option<i64> = row.get(2)?;
    let config: String = row.get(3)?;
    Ok(Session {
        id: SessionId(row.get(0)?),
        start: millis_to_utc(1, row.get(1)?)?,
        end: end_ms.map(|ms| millis_to_utc(2, ms)).transpose()?,
        sensor_config: serde_json::from_str(&config).unwrap_or_default(),
    })
}

fn millis_to_utc(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn parse_ip(row: &Row<'_>, idx: usize) -> rusqlite::Result<IpAddr> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_open_in_memory() {
        let store = SqliteStore::in_memory().unwrap();
        let conn = store.conn().unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='segment_batches'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_session_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.latest_session().unwrap().is_none());

        let start = Utc::now();
        let session = store
            .create_session(start, &serde_json::json!({"sensors": []}))
            .unwrap();
        assert!(session.is_active());
        assert_eq!(session.start.timestamp_millis(), start.timestamp_millis());

        let active = store.get_active_session().unwrap().unwrap();
        assert_eq!(active.id, session.id);

        store.end_session(session.id, start + Duration::seconds(30)).unwrap();
        assert!(store.get_active_session().unwrap().is_none());

        let ended = store.get_session(session.id).unwrap().unwrap();
        assert!(!ended.is_active());
        assert_eq!(store.latest_session().unwrap().unwrap().id, session.id);
    }

    #[test]
    fn test_latest_session_orders_by_start() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let newer = store.create_session(now, &serde_json::json!({})).unwrap();
        let _older = store
            .create_session(now - Duration::hours(1), &serde_json::json!({}))
            .unwrap();

        assert_eq!(store.latest_session().unwrap().unwrap().id, newer.id);
    }

    #[test]
    fn test_end_unknown_session_fails() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.end_session(SessionId(42), Utc::now()).is_err());
    }

    #[test]
    fn test_register_sensor_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let session = store.create_session(Utc::now(), &serde_json::json!({})).unwrap();

        let mic = store
            .register_sensor(session.id, localhost(), sensor_types::MICROPHONE)
            .unwrap();
        let again = store
            .register_sensor(session.id, localhost(), sensor_types::MICROPHONE)
            .unwrap();
        let cam = store
            .register_sensor(session.id, localhost(), sensor_types::PI_CAMERA)
            .unwrap();

        assert_eq!(mic, again);
        assert_ne!(mic, cam);
        assert_eq!(
            store
                .find_sensor(session.id, localhost(), sensor_types::PI_CAMERA)
                .unwrap(),
            Some(cam)
        );

        let sensors = store.list_sensors(session.id).unwrap();
        assert_eq!(sensors.len(), 2);
        assert_eq!(sensors[0].ip, localhost());
    }

    #[test]
    fn test_segment_batches_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let session = store.create_session(Utc::now(), &serde_json::json!({})).unwrap();
        let sensor = store
            .register_sensor(session.id, localhost(), sensor_types::MICROPHONE)
            .unwrap();

        let batch = SegmentBatch {
            session_id: session.id,
            sensor_id: sensor,
            first_timestamp: 1000.0,
            last_timestamp: 1500.5,
            first_number: 1,
            last_number: 2,
            metadata_json: r#"{"1":{},"2":{}}"#.to_string(),
        };
        store.insert_segment_batch(&batch).unwrap();

        let stored = store.list_segment_batches(session.id, Some(sensor)).unwrap();
        assert_eq!(stored, vec![batch]);
        assert!(store
            .list_segment_batches(session.id, Some(SensorId(sensor.0 + 1)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_sense_readings() {
        let store = SqliteStore::in_memory().unwrap();
        let session = store.create_session(Utc::now(), &serde_json::json!({})).unwrap();
        let sensor = store
            .register_sensor(session.id, localhost(), sensor_types::SENSE_HAT)
            .unwrap();

        let reading = SenseReading {
            temperature: 21.5,
            pressure: 1013.25,
            humidity: 40.0,
        };
        store
            .insert_sense_reading(session.id, sensor, localhost(), Utc::now(), &reading)
            .unwrap();

        assert_eq!(store.list_sense_readings(session.id).unwrap(), vec![reading]);
    }
}
