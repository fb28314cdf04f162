//! Frame files on disk and the segment records that index them.

pub mod batcher;
pub mod layout;

pub use batcher::{AcceptedFrame, BatchPolicy, SegmentBatcher, SensorFeed, SensorState};
pub use layout::ShardLayout;
