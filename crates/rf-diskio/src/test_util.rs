//! Fixtures shared by the unit tests

use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use rf_core::{Sample, SampleCnt, SamplePos};
use rf_file::{
    AudioCaptureSink, AudioPlaylist, AudioRegion, AudioSource, CaptureMark, CaptureSinkFactory, FileError,
    FileResult, FileSinkFactory, MemorySource, MidiCaptureSink, RegionPlaylist,
};
use tempfile::TempDir;

use crate::config::{BufferingParameters, BufferingPreset, DiskIoConfig};
use crate::context::DiskIoContext;
use crate::notify::{DiskEvent, event_channel};
use crate::reader::DiskReader;
use crate::transport::TransportState;
use crate::trash::TrashQueue;
use crate::writer::DiskWriter;

/// 8 kHz, 2 s buffers (16384-sample rings), 2048-sample chunks
pub fn small_config() -> DiskIoConfig {
    DiskIoConfig {
        sample_rate: 8000,
        buffering_preset: BufferingPreset::Custom,
        custom_buffering: BufferingParameters {
            read_chunk_samples: 2048,
            write_chunk_samples: 2048,
            read_buffer_seconds: 2.0,
            write_buffer_seconds: 2.0,
        },
        max_block_size: 1024,
        playback_reservation: 1024,
        midi_ring_events: 1024,
        ..DiskIoConfig::default()
    }
}

pub struct TestRig {
    pub config: DiskIoConfig,
    pub transport: Arc<TransportState>,
    pub ctx: Arc<DiskIoContext>,
    pub events: Receiver<DiskEvent>,
    pub dir: TempDir,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_transport(|_| {})
    }

    pub fn with_transport(setup: impl FnOnce(&TransportState)) -> Self {
        Self::with_sinks(setup, |dir, rate| {
            Arc::new(FileSinkFactory::new(dir, rate)) as Arc<dyn CaptureSinkFactory>
        })
    }

    /// Capture files that refuse writes past `quota` samples each
    pub fn with_sink_quota(setup: impl FnOnce(&TransportState), quota: SampleCnt) -> Self {
        Self::with_sinks(setup, |dir, rate| {
            Arc::new(QuotaSinkFactory {
                inner: FileSinkFactory::new(dir, rate),
                quota,
            }) as Arc<dyn CaptureSinkFactory>
        })
    }

    fn with_sinks(
        setup: impl FnOnce(&TransportState),
        make_sinks: impl FnOnce(&Path, u32) -> Arc<dyn CaptureSinkFactory>,
    ) -> Self {
        let config = small_config();
        let transport = Arc::new(TransportState::new());
        setup(&transport);
        let (events_tx, events) = event_channel(64);
        let dir = tempfile::tempdir().unwrap();
        let sinks = make_sinks(dir.path(), config.sample_rate);
        let ctx = Arc::new(DiskIoContext::new(
            config.clone(),
            transport.clone(),
            events_tx,
            TrashQueue::new(64),
            sinks,
        ));
        Self {
            config,
            transport,
            ctx,
            events,
            dir,
        }
    }

    pub fn reader(&self, n_channels: usize) -> DiskReader {
        DiskReader::new(1, "reader", n_channels, self.ctx.clone())
    }

    pub fn writer(&self, n_channels: usize) -> DiskWriter {
        DiskWriter::new(1, "writer", n_channels, self.ctx.clone())
    }
}

/// One region from 0 whose every channel holds `value == position`
pub fn ramp_playlist(n_channels: usize, len: usize) -> Arc<dyn AudioPlaylist> {
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

struct QuotaSinkFactory {
    inner: FileSinkFactory,
    quota: SampleCnt,
}

impl CaptureSinkFactory for QuotaSinkFactory {
    fn create_audio_sink(
        &self,
        track: &str,
        take: u32,
        channel: usize,
        n_channels: usize,
    ) -> FileResult<Box<dyn AudioCaptureSink>> {
        let inner = self.inner.create_audio_sink(track, take, channel, n_channels)?;
        Ok(Box::new(QuotaSink {
            inner,
            quota: self.quota,
        }))
    }

    fn create_midi_sink(&self, track: &str, take: u32) -> FileResult<Box<dyn MidiCaptureSink>> {
        self.inner.create_midi_sink(track, take)
    }
}

/// A capture file on a volume that fills up
struct QuotaSink {
    inner: Box<dyn AudioCaptureSink>,
    quota: SampleCnt,
}

impl AudioCaptureSink for QuotaSink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn write(&mut self, samples: &[Sample]) -> FileResult<usize> {
        if self.inner.length() + samples.len() as SampleCnt > self.quota {
            return Err(FileError::WriteError("no space left on device".into()));
        }
        self.inner.write(samples)
    }

    fn length(&self) -> SampleCnt {
        self.inner.length()
    }

    fn mark_streaming_write_started(&mut self) {
        self.inner.mark_streaming_write_started();
    }

    fn mark_capture_start(&mut self, position: SamplePos) {
        self.inner.mark_capture_start(position);
    }

    fn mark_capture_end(&mut self) {
        self.inner.mark_capture_end();
    }

    fn capture_marks(&self) -> &[CaptureMark] {
        self.inner.capture_marks()
    }

    fn update_header(&mut self, natural_position: SamplePos) -> FileResult<()> {
        self.inner.update_header(natural_position)
    }

    fn mark_immutable(&mut self) -> FileResult<()> {
        self.inner.mark_immutable()
    }

    fn mark_for_remove(&mut self) {
        self.inner.mark_for_remove();
    }

    fn natural_position(&self) -> SamplePos {
        self.inner.natural_position()
    }

    fn source(&self) -> FileResult<Arc<dyn AudioSource>> {
        self.inner.source()
    }
}
