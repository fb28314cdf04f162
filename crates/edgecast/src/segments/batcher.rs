//! Per-sensor segment batching.
//!
//! Every accepted frame is written to its shard directory straight away.
//! Frame metadata accumulates until `frames_per_record` frames have been
//! seen, then one [`SegmentBatch`] is handed to the sink and the
//! accumulator starts over. Shards and batches roll independently.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use edgeproto::Frame;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{IngestError, IngestResult};
use crate::segments::ShardLayout;
use crate::store::{PersistenceSink, SegmentBatch, SensorId, SessionId};
use crate::stream::FrameHandler;

/// Batch and shard sizes. Zero is treated as one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub frames_per_record: u32,
    pub frames_per_shard: u32,
}

impl BatchPolicy {
    pub fn new(frames_per_record: u32, frames_per_shard: u32) -> Self {
        Self {
            frames_per_record: frames_per_record.max(1),
            frames_per_shard: frames_per_shard.max(1),
        }
    }
}

/// Metadata kept for each frame of the accumulating batch.
#[derive(Debug, Clone, Serialize)]
struct FrameRecord {
    frame_number: u64,
    path: String,
    time: f64,
    /// Number the sender put on the frame, when it was stored under another.
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_number: Option<u64>,
}

/// Counters for one sensor.
#[derive(Debug, Clone)]
pub struct SensorState {
    pub frames_in_current_shard: u32,
    pub current_shard_index: u64,
    pub frames_in_current_batch: u32,
    pub total_frames_seen: u64,
    pub first_timestamp: f64,
    pub first_number: u64,
    /// Number of the last frame stored; later frames must be greater.
    pub last_number: u64,
    /// Serialized with the frame numbers as object keys, in numeric order.
    metadata: BTreeMap<u64, FrameRecord>,
}

impl Default for SensorState {
    fn default() -> Self {
        Self {
            frames_in_current_shard: 0,
            current_shard_index: 1,
            frames_in_current_batch: 0,
            total_frames_seen: 0,
            first_timestamp: 0.0,
            first_number: 0,
            last_number: 0,
            metadata: BTreeMap::new(),
        }
    }
}

impl SensorState {
    fn clear_batch(&mut self) {
        self.metadata.clear();
        self.frames_in_current_batch = 0;
    }
}

/// Where a frame went and whether it closed a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedFrame {
    pub path: PathBuf,
    pub shard: u64,
    pub flushed: Option<SegmentBatch>,
}

/// Owns the per-sensor counters for one session.
///
/// Not shared between tasks; wrap in a mutex when several request handlers
/// feed the same batcher.
pub struct SegmentBatcher<S> {
    sink: S,
    session_id: SessionId,
    layout: ShardLayout,
    policy: BatchPolicy,
    sensors: HashMap<SensorId, SensorState>,
}

impl<S: PersistenceSink> SegmentBatcher<S> {
    pub fn new(sink: S, session_id: SessionId, layout: ShardLayout, policy: BatchPolicy) -> Self {
        Self {
            sink,
            session_id,
            layout,
            policy: BatchPolicy::new(policy.frames_per_record, policy.frames_per_shard),
            sensors: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sensor_state(&self, sensor_id: SensorId) -> Option<&SensorState> {
        self.sensors.get(&sensor_id)
    }

    /// Frames accepted for this sensor but not yet flushed.
    pub fn pending_frames(&self, sensor_id: SensorId) -> usize {
        self.sensors
            .get(&sensor_id)
            .map(|s| s.metadata.len())
            .unwrap_or(0)
    }

    /// Sequence number for a frame whose source does not number its own.
    pub fn next_frame_number(&self, sensor_id: SensorId) -> u64 {
        self.sensors
            .get(&sensor_id)
            .map(|s| s.total_frames_seen + 1)
            .unwrap_or(1)
    }

    /// Store one frame and flush a batch record if it completes one.
    ///
    /// Frame numbers must increase per sensor; a number at or below the last
    /// stored one is rejected so no frame file is ever overwritten.
    pub fn accept_frame(&mut self, sensor_id: SensorId, frame: &Frame) -> IngestResult<AcceptedFrame> {
        self.accept(sensor_id, frame, None)
    }

    fn accept(
        &mut self,
        sensor_id: SensorId,
        frame: &Frame,
        sender_number: Option<u64>,
    ) -> IngestResult<AcceptedFrame> {
        let session_id = self.session_id;
        let policy = self.policy;
        let state = self.sensors.entry(sensor_id).or_default();

        if state.total_frames_seen > 0 && frame.number <= state.last_number {
            return Err(IngestError::FrameOutOfOrder {
                sensor_id,
                number: frame.number,
                last: state.last_number,
            });
        }

        // The frame that overflows the shard is the first of the next one
        let rotate = state.frames_in_current_shard >= policy.frames_per_shard;
        let shard = state.current_shard_index + u64::from(rotate);

        let path = self
            .layout
            .ensure_frame_path(session_id, sensor_id, shard, frame.number)
            .map_err(|source| IngestError::FrameWrite {
                path: self.layout.shard_dir(session_id, sensor_id, shard),
                source,
            })?;
        std::fs::write(&path, &frame.payload).map_err(|source| IngestError::FrameWrite {
            path: path.clone(),
            source,
        })?;

        // Counters only move once the frame is on disk
        if rotate {
            state.current_shard_index = shard;
            state.frames_in_current_shard = 1;
            info!("Sensor {} rotated to shard {}", sensor_id, shard);
        } else {
            state.frames_in_current_shard += 1;
        }
        state.last_number = frame.number;

        if state.metadata.is_empty() {
            state.first_timestamp = frame.timestamp;
            state.first_number = frame.number;
        }
        state.metadata.insert(
            frame.number,
            FrameRecord {
                frame_number: frame.number,
                path: path.display().to_string(),
                time: frame.timestamp,
                sender_number,
            },
        );
        state.total_frames_seen += 1;
        state.frames_in_current_batch += 1;

        let mut flushed = None;
        if state.frames_in_current_batch >= policy.frames_per_record {
            let metadata_json = serde_json::to_string(&state.metadata);
            let batch = metadata_json.map(|metadata_json| SegmentBatch {
                session_id,
                sensor_id,
                first_timestamp: state.first_timestamp,
                last_timestamp: frame.timestamp,
                first_number: state.first_number,
                last_number: frame.number,
                metadata_json,
            });
            // The batch is gone either way; a failed flush is not retried
            state.clear_batch();

            let batch = batch.map_err(|e| IngestError::SinkWrite {
                sensor_id,
                source: e.into(),
            })?;
            self.sink
                .insert_segment_batch(&batch)
                .map_err(|source| IngestError::SinkWrite { sensor_id, source })?;
            debug!(
                "Flushed frames {}-{} for sensor {}",
                batch.first_number, batch.last_number, sensor_id
            );
            flushed = Some(batch);
        }

        Ok(AcceptedFrame {
            path,
            shard,
            flushed,
        })
    }

    /// Frame handler that stores one stream's frames under `sensor_id`.
    ///
    /// Senders number every connection from 1. When the sensor already has
    /// stored frames, incoming numbers are shifted past the last stored one
    /// and the sender's own number is kept in the frame metadata.
    pub fn feed(&mut self, sensor_id: SensorId) -> SensorFeed<'_, S> {
        let offset = self
            .sensors
            .get(&sensor_id)
            .map(|s| s.last_number)
            .unwrap_or(0);
        SensorFeed {
            batcher: self,
            sensor_id,
            offset,
        }
    }
}

/// Binds a batcher to one sensor for the length of a stream.
pub struct SensorFeed<'a, S> {
    batcher: &'a mut SegmentBatcher<S>,
    sensor_id: SensorId,
    offset: u64,
}

impl<S: PersistenceSink> FrameHandler for SensorFeed<'_, S> {
    fn on_frame(&mut self, frame: Frame) -> IngestResult<()> {
        if self.offset == 0 {
            return self.batcher.accept_frame(self.sensor_id, &frame).map(|_| ());
        }
        let sender_number = frame.number;
        let frame = Frame {
            number: sender_number + self.offset,
            ..frame
        };
        self.batcher
            .accept(self.sensor_id, &frame, Some(sender_number))
            .map(|_| ())
    }
}
