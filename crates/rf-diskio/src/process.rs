//! Per-cycle buffers and monitoring state handed to the disk processors

use rf_core::{MidiBuffer, Sample};

use crate::track::TrackId;

/// What a track lets through to its outputs this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorState {
    Silence,
    Input,
    #[default]
    Disk,
    /// Input and disk together
    Cue,
}

impl MonitorState {
    #[inline]
    pub fn disk(self) -> bool {
        matches!(self, MonitorState::Disk | MonitorState::Cue)
    }

    #[inline]
    pub fn input(self) -> bool {
        matches!(self, MonitorState::Input | MonitorState::Cue)
    }
}

/// A track's buffers for one process cycle. On entry they hold the track
/// input; after the reader runs they hold what the track outputs.
pub struct ProcessBuffers<'a> {
    /// One buffer per output channel, each at least one cycle long
    pub audio: &'a mut [Vec<Sample>],
    pub midi: &'a mut MidiBuffer,
    /// Events injected directly (not played by the performer); never captured
    pub immediate_midi: Option<&'a MidiBuffer>,
}

impl<'a> ProcessBuffers<'a> {
    pub fn new(audio: &'a mut [Vec<Sample>], midi: &'a mut MidiBuffer) -> Self {
        Self {
            audio,
            midi,
            immediate_midi: None,
        }
    }

    #[inline]
    pub fn n_audio(&self) -> usize {
        self.audio.len()
    }

    pub fn silence_audio(&mut self, nframes: usize) {
        for buf in self.audio.iter_mut() {
            let n = nframes.min(buf.len());
            buf[..n].fill(0.0);
        }
    }

    pub fn silence(&mut self, nframes: usize) {
        self.silence_audio(nframes);
        self.midi.clear();
    }
}

/// Buffers the host owns for one track, preallocated for the largest cycle
pub struct TrackIo {
    pub track: TrackId,
    pub audio: Vec<Vec<Sample>>,
    pub midi: MidiBuffer,
}

impl TrackIo {
    pub fn new(track: TrackId, n_channels: usize, max_block_size: usize, midi_events: usize) -> Self {
        Self {
            track,
            audio: vec![vec![0.0; max_block_size]; n_channels],
            midi: MidiBuffer::with_capacity(midi_events),
        }
    }

    pub fn buffers(&mut self) -> ProcessBuffers<'_> {
        ProcessBuffers::new(&mut self.audio, &mut self.midi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_state_flags() {
        assert!(MonitorState::Cue.disk() && MonitorState::Cue.input());
        assert!(MonitorState::Disk.disk() && !MonitorState::Disk.input());
        assert!(!MonitorState::Silence.disk() && !MonitorState::Silence.input());
    }
}
