//! Session lifecycle as seen by ingestion.

pub mod monitor;

pub use monitor::{SessionMonitor, SessionState, DEFAULT_POLL_INTERVAL};
