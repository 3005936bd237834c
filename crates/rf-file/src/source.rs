//! Audio sources: mono, random-access sample providers

use std::path::Path;
use std::sync::Arc;

use rf_core::{Sample, SampleCnt};

use crate::{FileError, FileResult};

/// Mono audio material addressed by sample offset from its own start
pub trait AudioSource: Send + Sync {
    fn name(&self) -> &str;

    fn length(&self) -> SampleCnt;

    /// Copy `dst.len()` samples starting at `start` into `dst`. Returns the
    /// number of samples that came from the source; the rest of `dst` is
    /// zeroed.
    fn read(&self, dst: &mut [Sample], start: SampleCnt) -> FileResult<usize>;
}

/// Source backed by a sample vector
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Vec<Sample>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: Vec<Sample>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn data(&self) -> &[Sample] {
        &self.data
    }
}

impl AudioSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn length(&self) -> SampleCnt {
        self.data.len() as SampleCnt
    }

    fn read(&self, dst: &mut [Sample], start: SampleCnt) -> FileResult<usize> {
        if start < 0 {
            return Err(FileError::ReadError(format!(
                "{}: negative read offset {}",
                self.name, start
            )));
        }
        let start = start as usize;
        let available = self.data.len().saturating_sub(start).min(dst.len());
        if available > 0 {
            dst[..available].copy_from_slice(&self.data[start..start + available]);
        }
        dst[available..].fill(0.0);
        Ok(available)
    }
}

/// Load every channel of a WAV file as its own in-memory source
pub fn load_wav_sources(path: &Path) -> FileResult<Vec<Arc<dyn AudioSource>>> {
    if !path.exists() {
        return Err(FileError::NotFound(path.display().to_string()));
    }

    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<Sample> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()?
        }
    };

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let frames = interleaved.len() / channels;
    let sources = (0..channels)
        .map(|ch| {
            let data: Vec<Sample> = (0..frames).map(|f| interleaved[f * channels + ch]).collect();
            let name = if channels == 1 {
                stem.clone()
            } else {
                format!("{stem}-{ch}")
            };
            Arc::new(MemorySource::new(name, data)) as Arc<dyn AudioSource>
        })
        .collect();

    log::debug!("Loaded {} channel(s), {} frames from {:?}", channels, frames, path);

    Ok(sources)
}
