//! edgecast - sensor data ingestion for recording sessions
//!
//! Library exposing the ingestion pieces for the CLI and for tests.

pub mod error;
pub mod ingest;
pub mod segments;
pub mod sessions;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod web;

pub use error::{IngestError, IngestResult};
