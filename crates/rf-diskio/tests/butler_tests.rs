//! Butler Integration Tests
//!
//! Tests for:
//! - Convergence of the refill loop across several tracks
//! - Background refill keeping up with playback
//! - Buffering changes applied off the process thread
//! - Deferred release of removed tracks

use std::sync::Arc;

use rf_core::{Sample, SamplePos};
use rf_diskio::{
    BufferingParameters, BufferingPreset, DiskEngine, DiskEvent, DiskIoConfig, DiskTrack, TrackIo,
};
use rf_file::{AudioPlaylist, AudioRegion, AudioSource, FileSinkFactory, MemorySource, RegionPlaylist};

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

const TEST_SAMPLE_RATE: u32 = 8000;
const BLOCK: usize = 1024;
const CHUNK: usize = 2048;

fn test_config(read_buffer_seconds: f64) -> DiskIoConfig {
    DiskIoConfig {
        sample_rate: TEST_SAMPLE_RATE,
        buffering_preset: BufferingPreset::Custom,
        custom_buffering: BufferingParameters {
            read_chunk_samples: CHUNK,
            write_chunk_samples: CHUNK,
            read_buffer_seconds,
            write_buffer_seconds: 2.0,
        },
        max_block_size: BLOCK,
        playback_reservation: 1024,
        midi_ring_events: 1024,
        ..DiskIoConfig::default()
    }
}

fn create_test_engine(dir: &tempfile::TempDir) -> DiskEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    let sinks = Arc::new(FileSinkFactory::new(dir.path(), TEST_SAMPLE_RATE));
    DiskEngine::new(test_config(2.0), sinks).unwrap()
}

fn ramp_playlist(n_channels: usize, len: usize) -> Arc<dyn AudioPlaylist> {
    let sources: Vec<Arc<dyn AudioSource>> = (0..n_channels)
        .map(|c| {
            let data: Vec<Sample> = (0..len).map(|i| i as Sample).collect();
            Arc::new(MemorySource::new(format!("ramp-{c}"), data)) as Arc<dyn AudioSource>
        })
        .collect();
    let playlist = RegionPlaylist::new("ramp");
    playlist.add_region(AudioRegion::whole_file("ramp", sources));
    Arc::new(playlist)
}

fn playing_track(engine: &DiskEngine, name: &str, n_channels: usize) -> Arc<DiskTrack> {
    let track = engine.add_track(name, n_channels);
    track.set_playlist(Some(ramp_playlist(n_channels, 400_000)));
    track
}

fn write_space(track: &DiskTrack) -> usize {
    track
        .reader()
        .channels()
        .iter()
        .map(|c| c.rbuf().write_space())
        .max()
        .unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONVERGENCE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_refill_converges_across_tracks() {
    let dir = tempfile::tempdir().unwrap();
    let engine = create_test_engine(&dir);
    let tracks: Vec<_> = (0..4)
        .map(|i| playing_track(&engine, &format!("t{i}"), 1 + i % 2))
        .collect();

    engine.locate(0);
    engine.sync();

    for t in &tracks {
        assert!(write_space(t) < CHUNK, "{} not filled", t.name());
        assert_eq!(t.reader().playback_sample(), 0);
    }
    // a fixed backlog settles in a bounded number of passes
    assert!(engine.butler().passes() < 64);
    assert_eq!(engine.butler().read_errors(), 0);
}

#[test]
fn test_background_refill_keeps_up_with_playback() {
    let dir = tempfile::tempdir().unwrap();
    let engine = create_test_engine(&dir);
    let track = playing_track(&engine, "keys", 2);
    engine.locate(0);
    engine.sync();
    engine.set_speed(1.0);

    let mut io = vec![TrackIo::new(track.id(), 2, BLOCK, 64)];
    for cycle in 0..64 {
        engine.process(BLOCK, &mut io);
        if cycle % 4 == 3 {
            engine.sync();
        }
    }

    assert_eq!(engine.transport().transport_sample(), 64 * BLOCK as SamplePos);
    assert_eq!(track.reader().playback_sample(), 64 * BLOCK as SamplePos);
    assert_eq!(track.reader().underruns(), 0);
    assert!(
        engine
            .events()
            .try_iter()
            .all(|e| !matches!(e, DiskEvent::Underrun { .. }))
    );

    // last cycle played [63 * BLOCK, 64 * BLOCK) on both channels
    let last = (63 * BLOCK) as Sample;
    for chan in &io[0].audio {
        assert_eq!(chan[0], last);
        assert_eq!(chan[BLOCK - 1], last + (BLOCK - 1) as Sample);
    }
}

#[test]
fn test_locate_during_playback_jumps_to_target() {
    let dir = tempfile::tempdir().unwrap();
    let engine = create_test_engine(&dir);
    let track = playing_track(&engine, "bass", 1);
    engine.locate(0);
    engine.sync();
    engine.set_speed(1.0);

    let mut io = vec![TrackIo::new(track.id(), 1, BLOCK, 64)];
    for _ in 0..4 {
        engine.process(BLOCK, &mut io);
    }
    engine.locate(200_000);
    engine.sync();
    assert_eq!(track.reader().playback_sample(), 200_000);

    for _ in 0..4 {
        engine.process(BLOCK, &mut io);
    }
    assert_eq!(engine.transport().transport_sample(), 200_000 + 4 * BLOCK as SamplePos);
    let start = (200_000 + 3 * BLOCK) as Sample;
    assert_eq!(io[0].audio[0][0], start);
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_buffering_change_resizes_on_butler() {
    let dir = tempfile::tempdir().unwrap();
    let engine = create_test_engine(&dir);
    let track = playing_track(&engine, "pad", 1);
    engine.sync();
    assert_eq!(track.reader().channels()[0].rbuf().capacity(), 16384);

    engine.set_config(test_config(4.0)).unwrap();
    engine.sync();
    assert_eq!(track.reader().channels()[0].rbuf().capacity(), 32768);

    let mut bad = test_config(4.0);
    bad.sample_rate = 0;
    assert!(engine.set_config(bad).is_err());
    assert_eq!(engine.context().config().sample_rate, TEST_SAMPLE_RATE);
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRASH
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_removed_track_is_released_by_butler() {
    let dir = tempfile::tempdir().unwrap();
    let engine = create_test_engine(&dir);
    let track = playing_track(&engine, "fx", 1);
    engine.sync();

    let weak = Arc::downgrade(&track);
    assert!(engine.session().remove_track(track.id()));
    drop(track);

    engine.sync();
    assert!(weak.upgrade().is_none());
    assert!(engine.session().all_tracks().is_empty());
}
