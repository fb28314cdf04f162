//! Persistence sink for sessions, sensors and segment records.
//!
//! The ingestion core only needs a narrow write interface; [`SqliteStore`]
//! is the production implementation and [`MemorySink`] backs tests.

pub mod memory;
pub mod sqlite;
pub mod types;

pub use memory::MemorySink;
pub use sqlite::SqliteStore;
pub use types::{
    sensor_types, SegmentBatch, SenseReading, SensorId, SensorRegistration, Session, SessionId,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::net::IpAddr;

/// Write side of the relational store, as seen by ingestion components.
///
/// Each component holds its own handle; implementations are not expected to
/// share a connection across threads.
pub trait PersistenceSink: Send + Sync {
    /// Store one flushed batch. Must not return until the write is durable.
    fn insert_segment_batch(&self, batch: &SegmentBatch) -> Result<()>;

    /// Most recently started session whose end time is unset.
    fn get_active_session(&self) -> Result<Option<Session>>;

    /// Session with the greatest start time, ended or not.
    fn latest_session(&self) -> Result<Option<Session>>;

    fn get_session(&self, id: SessionId) -> Result<Option<Session>>;

    /// Find or create the registration for `(session, ip, sensor_type)`.
    fn register_sensor(&self, session_id: SessionId, ip: IpAddr, sensor_type: &str) -> Result<SensorId>;

    fn end_session(&self, session_id: SessionId, end: DateTime<Utc>) -> Result<()>;
}
