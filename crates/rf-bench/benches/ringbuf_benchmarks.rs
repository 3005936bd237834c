//! Ring Buffer Benchmarks
//!
//! Bulk copy in and out of the playback ring, non-committing peeks and
//! rewinds inside the reservation zone.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rf_bench::{BLOCK_SIZES, generate_audio_buffer};
use rf_core::Sample;
use rf_diskio::RingBuffer;

const RING_SIZE: usize = 65536;
const RESERVATION: usize = 8191;

fn bench_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("ringbuf_write_read");

    for &size in BLOCK_SIZES {
        group.throughput(Throughput::Elements(size as u64));

        let input = generate_audio_buffer(size, 42);
        let mut output = vec![0.0 as Sample; size];
        let ring = RingBuffer::<Sample>::new(RING_SIZE, RESERVATION);

        group.bench_with_input(BenchmarkId::new("commit", size), &size, |b, _| {
            b.iter(|| {
                ring.write(black_box(&input));
                ring.read(&mut output, size, true, 0);
                black_box(&output)
            })
        });

        group.bench_with_input(BenchmarkId::new("write_vector", size), &size, |b, _| {
            b.iter(|| {
                // SAFETY: single-threaded; the slices are dropped before the
                // write pointer moves
                let (v1, v2) = unsafe { ring.write_vector() };
                let first = v1.len().min(size);
                v1[..first].copy_from_slice(&input[..first]);
                let second = v2.len().min(size - first);
                v2[..second].copy_from_slice(&input[first..first + second]);
                ring.increment_write_ptr(first + second);
                ring.increment_read_ptr(first + second);
                black_box(&ring)
            })
        });
    }

    group.finish();
}

fn bench_peek(c: &mut Criterion) {
    let mut group = c.benchmark_group("ringbuf_peek");

    for &size in BLOCK_SIZES {
        group.throughput(Throughput::Elements(size as u64));

        let ring = RingBuffer::<Sample>::new(RING_SIZE, RESERVATION);
        ring.write(&generate_audio_buffer(RING_SIZE - 1, 7));
        let mut output = vec![0.0 as Sample; size];

        group.bench_with_input(BenchmarkId::new("offset", size), &size, |b, _| {
            b.iter(|| {
                ring.read(&mut output, size, false, black_box(size));
                black_box(&output)
            })
        });
    }

    group.finish();
}

fn bench_rewind(c: &mut Criterion) {
    let mut group = c.benchmark_group("ringbuf_rewind");

    let ring = RingBuffer::<Sample>::new(RING_SIZE, RESERVATION);
    ring.write(&generate_audio_buffer(RING_SIZE - 1, 9));
    ring.increment_read_ptr(RESERVATION);

    for &distance in &[64usize, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(distance), &distance, |b, &d| {
            b.iter(|| {
                let back = ring.decrement_read_ptr(black_box(d));
                ring.increment_read_ptr(back);
                black_box(ring.can_seek(-(d as i64)))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_write_read, bench_peek, bench_rewind);

criterion_main!(benches);
