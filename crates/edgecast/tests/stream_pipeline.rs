//! End-to-end socket ingestion.
//!
//! A sender streams frames over TCP, the receiver decodes them into a segment
//! batcher, and the batches land in a temp-dir SQLite database.

use anyhow::Result;
use chrono::Utc;
use std::net::{IpAddr, Ipv4Addr};
use tempfile::TempDir;

use edgecast::segments::{BatchPolicy, SegmentBatcher, ShardLayout};
use edgecast::store::{PersistenceSink, SqliteStore};
use edgecast::stream::{CaptureHub, CapturedFrame, StreamEnd, StreamReceiver, StreamSender};
use edgeproto::Framing;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct Fixture {
    _temp: TempDir,
    data_dir: std::path::PathBuf,
    store: SqliteStore,
}

fn fixture() -> Result<Fixture> {
    let temp = TempDir::new()?;
    let data_dir = temp.path().join("data");
    let store = SqliteStore::open(temp.path().join("edgecast.db"))?;
    Ok(Fixture {
        _temp: temp,
        data_dir,
        store,
    })
}

#[tokio::test]
async fn json_header_stream_is_stored_and_batched() -> Result<()> {
    let fx = fixture()?;
    let session = fx.store.create_session(Utc::now(), &serde_json::json!({}))?;
    let sensor = fx.store.register_sensor(session.id, LOCALHOST, "Camera")?;

    let receiver = StreamReceiver::bind("127.0.0.1:0", Framing::JsonHeader).await?;
    let addr = receiver.local_addr()?.to_string();

    let sender = tokio::spawn(async move {
        let mut sender = StreamSender::connect(&addr, Framing::JsonHeader).await?;
        for i in 0..11u64 {
            sender
                .send_at(format!("jpeg {}", i + 1).into_bytes(), 1_700_000_000_000.0 + i as f64 * 100.0)
                .await?;
        }
        sender.finish().await
    });

    let mut batcher = SegmentBatcher::new(
        fx.store.clone(),
        session.id,
        ShardLayout::new(&fx.data_dir, "jpg"),
        BatchPolicy::new(2, 5),
    );
    let conn = receiver.accept().await?;
    let summary = conn.run(&mut batcher.feed(sensor)).await?;
    assert_eq!(sender.await??, 11);

    assert_eq!(summary.frames_received, 11);
    assert_eq!(summary.end, StreamEnd::PeerClosed);

    // Eleven frames, two per record: five records, frame 11 still pending
    let batches = fx.store.list_segment_batches(session.id, Some(sensor))?;
    let ranges: Vec<_> = batches.iter().map(|b| (b.first_number, b.last_number)).collect();
    assert_eq!(ranges, vec![(1, 2), (3, 4), (5, 6), (7, 8), (9, 10)]);
    assert_eq!(batcher.pending_frames(sensor), 1);
    assert_eq!(batches[0].first_timestamp, 1_700_000_000_000.0);
    assert_eq!(batches[0].last_timestamp, 1_700_000_000_100.0);

    let shard_dir = |shard: u64| {
        fx.data_dir
            .join(session.id.0.to_string())
            .join(sensor.0.to_string())
            .join(shard.to_string())
    };
    assert_eq!(std::fs::read(shard_dir(1).join("frame-1.jpg"))?, b"jpeg 1");
    assert!(shard_dir(1).join("frame-5.jpg").exists());
    assert!(shard_dir(2).join("frame-6.jpg").exists());
    assert_eq!(std::fs::read(shard_dir(3).join("frame-11.jpg"))?, b"jpeg 11");

    let metadata: serde_json::Value = serde_json::from_str(&batches[2].metadata_json)?;
    assert_eq!(metadata["5"]["frame_number"], 5);
    assert_eq!(metadata["6"]["time"], 1_700_000_000_500.0);

    Ok(())
}

#[tokio::test]
async fn bare_length_capture_feed_reaches_receiver() -> Result<()> {
    let fx = fixture()?;
    let session = fx.store.create_session(Utc::now(), &serde_json::json!({}))?;
    let sensor = fx.store.register_sensor(session.id, LOCALHOST, "PiCamera")?;

    let receiver = StreamReceiver::bind("127.0.0.1:0", Framing::BareLength).await?;
    let addr = receiver.local_addr()?.to_string();

    let hub = CaptureHub::new(16);
    let mut feed = hub.subscribe();
    let sender = tokio::spawn(async move {
        let mut sender = StreamSender::connect(&addr, Framing::BareLength).await?;
        let sent = sender.stream_from(&mut feed).await?;
        sender.finish().await?;
        anyhow::Ok(sent)
    });

    for i in 0..4u8 {
        hub.publish(CapturedFrame::now(vec![0xff, 0xd8, i, 0xff, 0xd9]));
    }
    drop(hub);

    let mut batcher = SegmentBatcher::new(
        fx.store.clone(),
        session.id,
        ShardLayout::new(&fx.data_dir, "jpg"),
        BatchPolicy::new(2, 10),
    );
    let conn = receiver.accept().await?;
    let summary = conn.run(&mut batcher.feed(sensor)).await?;

    assert_eq!(sender.await??, 4);
    assert_eq!(summary.end, StreamEnd::EndOfStream);

    // Bare-length frames are numbered by the receiver
    let batches = fx.store.list_segment_batches(session.id, Some(sensor))?;
    let ranges: Vec<_> = batches.iter().map(|b| (b.first_number, b.last_number)).collect();
    assert_eq!(ranges, vec![(1, 2), (3, 4)]);
    assert!(batches.iter().all(|b| b.first_timestamp > 0.0));

    Ok(())
}

#[tokio::test]
async fn reconnect_continues_numbering_without_overwriting() -> Result<()> {
    let fx = fixture()?;
    let session = fx.store.create_session(Utc::now(), &serde_json::json!({}))?;
    let sensor = fx.store.register_sensor(session.id, LOCALHOST, "Camera")?;

    let receiver = StreamReceiver::bind("127.0.0.1:0", Framing::JsonHeader).await?;
    let addr = receiver.local_addr()?.to_string();
    let mut batcher = SegmentBatcher::new(
        fx.store.clone(),
        session.id,
        ShardLayout::new(&fx.data_dir, "jpg"),
        BatchPolicy::new(4, 3),
    );

    for stream in ["a", "b"] {
        let addr = addr.clone();
        let sender = tokio::spawn(async move {
            // Each connection numbers its frames from 1
            let mut sender = StreamSender::connect(&addr, Framing::JsonHeader).await?;
            for n in 1..=3u64 {
                sender.send_at(format!("{}{}", stream, n).into_bytes(), n as f64).await?;
            }
            sender.finish().await
        });
        let conn = receiver.accept().await?;
        conn.run(&mut batcher.feed(sensor)).await?;
        sender.await??;
    }

    let state = batcher.sensor_state(sensor).expect("sensor state");
    assert_eq!(state.total_frames_seen, 6);
    assert_eq!(state.last_number, 6);
    assert_eq!(state.current_shard_index, 2);

    let sensor_dir = fx
        .data_dir
        .join(session.id.0.to_string())
        .join(sensor.0.to_string());
    assert_eq!(std::fs::read(sensor_dir.join("1/frame-1.jpg"))?, b"a1");
    assert_eq!(std::fs::read(sensor_dir.join("1/frame-3.jpg"))?, b"a3");
    assert_eq!(std::fs::read(sensor_dir.join("2/frame-4.jpg"))?, b"b1");
    assert_eq!(std::fs::read(sensor_dir.join("2/frame-6.jpg"))?, b"b3");

    let batches = fx.store.list_segment_batches(session.id, Some(sensor))?;
    assert_eq!(batches.len(), 1);
    assert_eq!((batches[0].first_number, batches[0].last_number), (1, 4));
    assert_eq!(batches[0].last_timestamp, 1.0);
    let metadata: serde_json::Value = serde_json::from_str(&batches[0].metadata_json)?;
    let entries = metadata.as_object().expect("metadata object");
    assert_eq!(entries.len(), 4);
    assert_eq!(metadata["4"]["sender_number"], 1);

    Ok(())
}
