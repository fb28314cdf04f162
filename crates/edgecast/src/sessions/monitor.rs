//! Gate ingestion on the session table.
//!
//! A session is started by the recording front end, not by ingestion. The
//! monitor notices new sessions by polling for the greatest start time and
//! comparing it with the one seen when the monitor was built, so a session
//! ingested by an earlier run never triggers a second ingestion.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::store::{PersistenceSink, Session, SessionId};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Observed state of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    NoSession,
    Active(Session),
    Ended(Session),
}

impl SessionState {
    fn of(session: Option<Session>) -> Self {
        match session {
            None => SessionState::NoSession,
            Some(s) if s.is_active() => SessionState::Active(s),
            Some(s) => SessionState::Ended(s),
        }
    }
}

pub struct SessionMonitor<S> {
    sink: S,
    poll_interval: Duration,
    /// Greatest start time seen at construction; `None` when the table was empty.
    latest_session_start_time: Option<DateTime<Utc>>,
}

impl<S: PersistenceSink + Clone + 'static> SessionMonitor<S> {
    /// Record the current latest start time as the baseline.
    pub fn new(sink: S) -> Result<Self> {
        let baseline = sink.latest_session()?.map(|s| s.start);
        Ok(Self::with_baseline(sink, baseline))
    }

    pub fn with_baseline(sink: S, latest_session_start_time: Option<DateTime<Utc>>) -> Self {
        Self {
            sink,
            poll_interval: DEFAULT_POLL_INTERVAL,
            latest_session_start_time,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn baseline(&self) -> Option<DateTime<Utc>> {
        self.latest_session_start_time
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// State of the latest session right now.
    pub async fn state(&self) -> Result<SessionState> {
        Ok(SessionState::of(self.read(|sink| sink.latest_session()).await?))
    }

    /// Wait for a session that started after the baseline.
    ///
    /// Read errors count as "no session yet". Cancel by dropping the future.
    pub async fn block_until_new_session(&self) -> Session {
        info!("Waiting until a new session is started");
        loop {
            match self.read(|sink| sink.latest_session()).await {
                Ok(Some(session)) if self.is_new(&session) => {
                    info!("Session {} started at {}", session.id, session.start);
                    return session;
                }
                Ok(_) => {}
                Err(e) => debug!("Session poll failed, retrying: {:#}", e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Mark the most recently started session as ended now.
    pub async fn end_latest_session(&self) -> Result<Option<Session>> {
        self.read(|sink| {
            let Some(session) = sink.latest_session()? else {
                return Ok(None);
            };
            let now = Utc::now();
            sink.end_session(session.id, now)?;
            info!("Ended session {} at {}", session.id, now);
            Ok(Some(Session {
                end: Some(now),
                ..session
            }))
        })
        .await
    }

    /// Wait until the session's end time is set.
    ///
    /// Read errors are retried. Cancel by dropping the future.
    pub async fn block_until_end(&self, session_id: SessionId) -> Session {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.read(move |sink| sink.get_session(session_id)).await {
                Ok(Some(session)) if !session.is_active() => {
                    info!("Session {} ended", session_id);
                    return session;
                }
                Ok(_) => {}
                Err(e) => debug!("Session {} poll failed, retrying: {:#}", session_id, e),
            }
        }
    }

    /// Run a sink call on the blocking pool; the sink may wait on a locked
    /// database.
    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T> + Send + 'static,
    {
        let sink = self.sink.clone();
        tokio::task::spawn_blocking(move || f(&sink)).await?
    }

    fn is_new(&self, session: &Session) -> bool {
        match self.latest_session_start_time {
            Some(baseline) => session.start > baseline,
            None => true,
        }
    }
}
