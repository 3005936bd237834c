//! Test data generators for benchmarks

use std::sync::Arc;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rf_core::Sample;
use rf_file::{AudioPlaylist, AudioRegion, AudioSource, MemorySource, RegionPlaylist};

/// Generate reproducible audio buffer
pub fn generate_audio_buffer(size: usize, seed: u64) -> Vec<Sample> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..size).map(|_| rng.random::<Sample>() * 2.0 - 1.0).collect()
}

/// One region at position 0 with a noise source per channel
pub fn noise_playlist(n_channels: usize, len: usize, seed: u64) -> Arc<dyn AudioPlaylist> {
    let sources: Vec<Arc<dyn AudioSource>> = (0..n_channels)
        .map(|c| {
            let data = generate_audio_buffer(len, seed + c as u64);
            Arc::new(MemorySource::new(format!("noise-{c}"), data)) as Arc<dyn AudioSource>
        })
        .collect();
    let playlist = RegionPlaylist::new("noise");
    playlist.add_region(AudioRegion::whole_file("noise", sources));
    Arc::new(playlist)
}

/// Process cycle sizes
pub const BLOCK_SIZES: &[usize] = &[64, 256, 1024, 4096];

/// Refill chunk sizes
pub const CHUNK_SIZES: &[usize] = &[8192, 32768, 65536];
