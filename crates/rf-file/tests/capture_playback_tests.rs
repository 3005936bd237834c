//! Capture-to-Playlist Integration Tests
//!
//! Tests for:
//! - Captured WAV takes read back through a region playlist
//! - Silence around regions and opaque layering
//! - Captured MIDI placed as a region and read on the timeline
//! - Loading existing WAV material as per-channel sources

use std::sync::Arc;

use rf_core::{Gain, MidiEvent, Sample};
use rf_file::{
    AudioPlaylist, AudioRegion, AudioSource, CaptureSinkFactory, FileSinkFactory, MidiPlaylist,
    MidiRegion, MidiRegionPlaylist, RegionPlaylist, load_wav_sources,
};

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

const TEST_SAMPLE_RATE: u32 = 48000;

/// Capture `frames` samples per channel where channel `c` holds `c * 1000 + i`
fn capture_take(factory: &FileSinkFactory, n_channels: usize, frames: usize) -> Vec<Arc<dyn AudioSource>> {
    (0..n_channels)
        .map(|c| {
            let mut sink = factory.create_audio_sink("take", 1, c, n_channels).unwrap();
            sink.mark_streaming_write_started();
            let data: Vec<Sample> = (0..frames).map(|i| (c * 1000 + i) as Sample).collect();
            assert_eq!(sink.write(&data).unwrap(), frames);
            sink.update_header(0).unwrap();
            sink.mark_immutable().unwrap();
            sink.source().unwrap()
        })
        .collect()
}

fn render(playlist: &dyn AudioPlaylist, start: i64, cnt: usize, channel: usize) -> Vec<Sample> {
    let mut buf = vec![0.0 as Sample; cnt];
    let mut mixdown = vec![0.0 as Sample; cnt];
    let mut gain = vec![0.0 as Gain; cnt];
    let got = playlist
        .read(&mut buf, &mut mixdown, &mut gain, start, cnt as i64, channel)
        .unwrap();
    assert_eq!(got, cnt as i64);
    buf
}

// ═══════════════════════════════════════════════════════════════════════════════
// AUDIO
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_captured_take_plays_back_from_playlist() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FileSinkFactory::new(dir.path(), TEST_SAMPLE_RATE);
    let sources = capture_take(&factory, 2, 100);
    assert!(factory.audio_path("take", 1, 1, 2).exists());

    let playlist = RegionPlaylist::new("stereo");
    playlist.add_region(AudioRegion::new("take.1", sources, 0, 100, 500));

    let right = render(&playlist, 490, 20, 1);
    assert!(right[..10].iter().all(|s| *s == 0.0));
    for (i, s) in right[10..].iter().enumerate() {
        assert_eq!(*s, (1000 + i) as Sample);
    }

    // past the region end is silence
    let tail = render(&playlist, 595, 10, 0);
    assert_eq!(&tail[..5], &[95.0, 96.0, 97.0, 98.0, 99.0]);
    assert!(tail[5..].iter().all(|s| *s == 0.0));
}

#[test]
fn test_later_region_covers_earlier_one() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FileSinkFactory::new(dir.path(), TEST_SAMPLE_RATE);
    let sources = capture_take(&factory, 1, 100);

    let playlist = RegionPlaylist::new("layers");
    playlist.add_region(AudioRegion::new("base", sources.clone(), 0, 100, 0));
    // second pass of the same file: samples 50.. placed at 20
    playlist.add_region(AudioRegion::new("pass", sources, 50, 10, 20));

    let out = render(&playlist, 15, 20, 0);
    assert_eq!(out[0], 15.0);
    assert_eq!(out[5], 50.0);
    assert_eq!(out[14], 59.0);
    assert_eq!(out[15], 30.0);
}

#[test]
fn test_removed_take_leaves_no_files() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FileSinkFactory::new(dir.path(), TEST_SAMPLE_RATE);
    {
        let mut sinks: Vec<_> = (0..2)
            .map(|c| factory.create_audio_sink("gone", 3, c, 2).unwrap())
            .collect();
        for sink in sinks.iter_mut() {
            sink.write(&[0.1; 64]).unwrap();
            sink.mark_for_remove();
        }
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_existing_wav_loads_as_channel_sources() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("material.wav");
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: TEST_SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for i in 0..32 {
        writer.write_sample(i as f32).unwrap();
        writer.write_sample(-(i as f32)).unwrap();
    }
    writer.finalize().unwrap();

    let sources = load_wav_sources(&path).unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[1].name(), "material-1");
    assert_eq!(sources[0].length(), 32);

    let playlist = RegionPlaylist::new("material");
    playlist.add_region(AudioRegion::whole_file("material", sources));
    let left = render(&playlist, 8, 4, 0);
    let right = render(&playlist, 8, 4, 1);
    assert_eq!(left, vec![8.0, 9.0, 10.0, 11.0]);
    assert_eq!(right, vec![-8.0, -9.0, -10.0, -11.0]);
}

// ═══════════════════════════════════════════════════════════════════════════════
// MIDI
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_captured_midi_reads_back_on_timeline() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FileSinkFactory::new(dir.path(), TEST_SAMPLE_RATE);
    let mut sink = factory.create_midi_sink("keys", 1).unwrap();
    sink.mark_streaming_write_started();
    sink.write_events(&[
        MidiEvent::note_on(100, 0, 60, 90),
        MidiEvent::note_off(900, 0, 60, 0),
        MidiEvent::note_on(2000, 0, 62, 90),
    ])
    .unwrap();
    sink.commit(10_000, 4000).unwrap();
    assert!(factory.midi_path("keys", 1).exists());

    let playlist = MidiRegionPlaylist::new("keys");
    playlist.add_region(MidiRegion {
        name: "keys.1".into(),
        position: 10_000,
        start: 0,
        length: 4000,
        events: sink.events(),
    });

    let mut dst = Vec::new();
    playlist.read(&mut dst, 10_000, 1000).unwrap();
    let times: Vec<_> = dst.iter().map(|e| e.time).collect();
    assert_eq!(times, vec![10_100, 10_900]);

    // the note held at the end of the take is closed inside the region
    dst.clear();
    playlist.read(&mut dst, 11_000, 3000).unwrap();
    assert_eq!(dst.len(), 2);
    assert!(dst[0].is_note_on());
    assert!(dst[1].is_note_off());
    assert_eq!(dst[1].note(), 62);
}
