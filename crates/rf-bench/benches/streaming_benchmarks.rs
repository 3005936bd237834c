//! Streaming Benchmarks
//!
//! Butler-side refills from an in-memory playlist and process-thread
//! playback cycles, at several chunk and block sizes.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rf_bench::{BLOCK_SIZES, CHUNK_SIZES, noise_playlist};
use rf_core::{MidiBuffer, Sample};
use rf_diskio::{
    BufferingParameters, BufferingPreset, DiskIoConfig, DiskIoContext, DiskReader, MonitorState,
    ProcessBuffers, RefillScratch, TransportSnapshot, TransportState, TrashQueue, event_channel,
};
use rf_file::FileSinkFactory;

const SAMPLE_RATE: u32 = 48000;
const CHANNELS: usize = 2;
const PLAYLIST_SAMPLES: usize = 48000 * 30;

fn context(chunk: usize) -> Arc<DiskIoContext> {
    let config = DiskIoConfig {
        sample_rate: SAMPLE_RATE,
        buffering_preset: BufferingPreset::Custom,
        custom_buffering: BufferingParameters {
            read_chunk_samples: chunk,
            write_chunk_samples: chunk,
            read_buffer_seconds: 5.0,
            write_buffer_seconds: 5.0,
        },
        ..DiskIoConfig::default()
    };
    let (events, _rx) = event_channel(1024);
    Arc::new(DiskIoContext::new(
        config,
        Arc::new(TransportState::new()),
        events,
        TrashQueue::default(),
        Arc::new(FileSinkFactory::new(std::env::temp_dir(), SAMPLE_RATE)),
    ))
}

fn bench_refill(c: &mut Criterion) {
    let mut group = c.benchmark_group("refill");
    group.sample_size(20);

    for &chunk in CHUNK_SIZES {
        group.throughput(Throughput::Elements((chunk * CHANNELS) as u64));

        let ctx = context(chunk);
        ctx.transport().set_speed(1.0);
        let reader = DiskReader::new(1, "bench", CHANNELS, ctx);
        reader.set_playlist(Some(noise_playlist(CHANNELS, PLAYLIST_SAMPLES, 42)));
        let mut scratch = RefillScratch::new(0);

        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                // free one chunk, then read it back in
                for c in reader.channels().iter() {
                    c.rbuf().increment_read_ptr(chunk);
                }
                black_box(reader.do_refill(&mut scratch))
            })
        });
    }

    group.finish();
}

fn bench_playback_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("playback_cycle");

    for &block in BLOCK_SIZES {
        group.throughput(Throughput::Elements((block * CHANNELS) as u64));

        let ctx = context(65536);
        ctx.transport().set_speed(1.0);
        let reader = DiskReader::new(1, "bench", CHANNELS, ctx);
        reader.set_playlist(Some(noise_playlist(CHANNELS, PLAYLIST_SAMPLES, 7)));
        let mut scratch = RefillScratch::new(0);
        let mut out = vec![vec![0.0 as Sample; block]; CHANNELS];
        let mut midi = MidiBuffer::with_capacity(64);

        group.bench_with_input(BenchmarkId::from_parameter(block), &block, |b, &block| {
            b.iter(|| {
                let start = reader.playback_sample();
                if reader.channels()[0].rbuf().read_space() < block {
                    while reader.do_refill(&mut scratch).is_ok_and(|s| s.more_work()) {}
                }
                let snapshot = TransportSnapshot {
                    speed: 1.0,
                    transport_sample: start,
                    ..TransportSnapshot::default()
                };
                let mut bufs = ProcessBuffers::new(&mut out, &mut midi);
                reader.run(&mut bufs, start, 1.0, block, MonitorState::Disk, true, &snapshot);
                black_box(&out)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_refill, bench_playback_cycle);

criterion_main!(benches);
