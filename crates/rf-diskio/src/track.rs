//! A disk-streaming track: one reader and one writer sharing a timeline

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;
use rf_core::SamplePos;
use rf_file::{AudioPlaylist, MidiPlaylist};
use serde::{Deserialize, Serialize};

use crate::capture::AlignStyle;
use crate::context::DiskIoContext;
use crate::error::DiskIoResult;
use crate::process::{MonitorState, ProcessBuffers};
use crate::reader::{DiskReader, RefillScratch};
use crate::transport::TransportSnapshot;
use crate::writer::DiskWriter;

pub type TrackId = u32;

/// User monitoring preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum MonitorChoice {
    /// Input while armed and recording or stopped, disk otherwise
    #[default]
    Auto = 0,
    Input = 1,
    Disk = 2,
    Cue = 3,
}

impl From<u8> for MonitorChoice {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Input,
            2 => Self::Disk,
            3 => Self::Cue,
            _ => Self::Auto,
        }
    }
}

/// Persisted per-track disk settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackDiskState {
    pub record_safe: bool,
    pub alignment_style: AlignStyle,
    pub monitoring: MonitorChoice,
}

pub struct DiskTrack {
    id: TrackId,
    name: String,
    reader: DiskReader,
    writer: DiskWriter,
    monitoring: AtomicU8,
    active: AtomicBool,
    /// Held while the channel lists are rebuilt; the process thread only
    /// try-locks it
    state_lock: Mutex<()>,
}

impl DiskTrack {
    pub fn new(id: TrackId, name: impl Into<String>, n_channels: usize, ctx: Arc<DiskIoContext>) -> Self {
        let name = name.into();
        Self {
            id,
            reader: DiskReader::new(id, name.clone(), n_channels, ctx.clone()),
            writer: DiskWriter::new(id, name.clone(), n_channels, ctx),
            name,
            monitoring: AtomicU8::new(MonitorChoice::Auto as u8),
            active: AtomicBool::new(true),
            state_lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reader(&self) -> &DiskReader {
        &self.reader
    }

    pub fn writer(&self) -> &DiskWriter {
        &self.writer
    }

    #[inline]
    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Inactive tracks are skipped by the process thread and the butler
    pub fn set_active(&self, yn: bool) {
        self.active.store(yn, Ordering::Release);
    }

    pub fn monitoring(&self) -> MonitorChoice {
        MonitorChoice::from(self.monitoring.load(Ordering::Acquire))
    }

    pub fn set_monitoring(&self, choice: MonitorChoice) {
        self.monitoring.store(choice as u8, Ordering::Release);
    }

    /// Same playlist for playback and for the regions of captured takes
    pub fn set_playlist(&self, playlist: Option<Arc<dyn AudioPlaylist>>) {
        self.writer.set_playlist(playlist.clone());
        self.reader.set_playlist(playlist);
    }

    pub fn set_midi_playlist(&self, playlist: Option<Arc<dyn MidiPlaylist>>) {
        self.writer.set_midi_playlist(playlist.clone());
        self.reader.set_midi_playlist(playlist);
    }

    pub fn monitor_state(&self, transport: &TransportSnapshot) -> MonitorState {
        match self.monitoring() {
            MonitorChoice::Input => MonitorState::Input,
            MonitorChoice::Disk => MonitorState::Disk,
            MonitorChoice::Cue => MonitorState::Cue,
            MonitorChoice::Auto => {
                if self.writer.record_enabled()
                    && (transport.actively_recording() || !transport.rolling())
                {
                    MonitorState::Input
                } else {
                    MonitorState::Disk
                }
            }
        }
    }

    /// One process cycle: capture the input in `bufs`, then replace or mix
    /// it with disk playback. Returns whether the butler has work for this
    /// track.
    pub fn process(
        &self,
        bufs: &mut ProcessBuffers<'_>,
        start: SamplePos,
        nframes: usize,
        transport: &TransportSnapshot,
    ) -> bool {
        if !self.active() {
            return false;
        }
        let Some(_lm) = self.state_lock.try_lock() else {
            // reconfiguration in progress
            bufs.silence(nframes);
            return false;
        };

        let ms = self.monitor_state(transport);
        self.writer.run(bufs, start, nframes, transport);
        self.reader
            .run(bufs, start, transport.speed, nframes, ms, true, transport);

        self.reader.need_butler() || self.writer.need_butler()
    }

    /// Reposition playback and drop unflushed capture data
    pub fn seek(&self, sample: SamplePos, complete_refill: bool, scratch: &mut RefillScratch) -> DiskIoResult<()> {
        self.writer.seek(sample);
        self.reader.seek(sample, complete_refill, scratch)
    }

    pub fn set_channel_count(&self, n_channels: usize) {
        let _lm = self.state_lock.lock();
        self.reader.set_channel_count(n_channels);
        self.writer.set_channel_count(n_channels);
    }

    /// Rebuild every ring buffer at the configured buffering size
    pub fn adjust_buffering(&self, scratch: &mut RefillScratch) -> DiskIoResult<()> {
        let _lm = self.state_lock.lock();
        self.writer.adjust_buffering();
        self.reader.adjust_buffering(scratch)
    }

    pub fn state(&self) -> TrackDiskState {
        TrackDiskState {
            record_safe: self.writer.record_safe(),
            alignment_style: self.writer.alignment_style(),
            monitoring: self.monitoring(),
        }
    }

    pub fn set_state(&self, state: &TrackDiskState) {
        self.writer.set_record_safe(state.record_safe);
        self.writer.set_align_style(state.alignment_style, true);
        self.set_monitoring(state.monitoring);
    }
}
