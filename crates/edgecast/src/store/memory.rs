//! In-process sink for tests and dry runs.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};

use super::types::*;
use super::PersistenceSink;

#[derive(Debug, Default)]
struct Inner {
    sessions: Vec<Session>,
    sensors: Vec<SensorRegistration>,
    batches: Vec<SegmentBatch>,
    fail_writes: bool,
}

/// Shared in-memory store. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))
    }

    pub fn create_session(&self, start: DateTime<Utc>) -> Result<Session> {
        let mut inner = self.lock()?;
        let session = Session {
            id: SessionId(inner.sessions.len() as i64 + 1),
            start,
            end: None,
            sensor_config: serde_json::json!({}),
        };
        inner.sessions.push(session.clone());
        Ok(session)
    }

    pub fn batches(&self) -> Result<Vec<SegmentBatch>> {
        Ok(self.lock()?.batches.clone())
    }

    /// Make subsequent batch inserts and session updates fail, as an
    /// unreachable database would.
    pub fn set_fail_writes(&self, fail: bool) -> Result<()> {
        self.lock()?.fail_writes = fail;
        Ok(())
    }
}

impl PersistenceSink for MemorySink {
    fn insert_segment_batch(&self, batch: &SegmentBatch) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            bail!("segment store unavailable");
        }
        inner.batches.push(batch.clone());
        Ok(())
    }

    fn get_active_session(&self) -> Result<Option<Session>> {
        let inner = self.lock()?;
        Ok(inner
            .sessions
            .iter()
            .filter(|s| s.is_active())
            .max_by_key(|s| (s.start, s.id))
            .cloned())
    }

    fn latest_session(&self) -> Result<Option<Session>> {
        let inner = self.lock()?;
        Ok(inner.sessions.iter().max_by_key(|s| (s.start, s.id)).cloned())
    }

    fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        let inner = self.lock()?;
        Ok(inner.sessions.iter().find(|s| s.id == id).cloned())
    }

    fn register_sensor(&self, session_id: SessionId, ip: IpAddr, sensor_type: &str) -> Result<SensorId> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner
            .sensors
            .iter()
            .find(|s| s.session_id == session_id && s.ip == ip && s.sensor_type == sensor_type)
        {
            return Ok(existing.id);
        }
        let id = SensorId(inner.sensors.len() as i64 + 1);
        inner.sensors.push(SensorRegistration {
            id,
            session_id,
            ip,
            name: sensor_type.to_string(),
            sensor_type: sensor_type.to_string(),
        });
        Ok(id)
    }

    fn end_session(&self, session_id: SessionId, end: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            bail!("session store unavailable");
        }
        match inner.sessions.iter_mut().find(|s| s.id == session_id) {
            Some(session) => {
                session.end = Some(end);
                Ok(())
            }
            None => bail!("Session {} not found", session_id),
        }
    }
}
