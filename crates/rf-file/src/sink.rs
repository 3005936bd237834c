//! Capture sinks
//!
//! A capture sink is the file that receives one channel of one take while
//! recording. The disk writer streams into it from the butler thread, brackets
//! each punch pass with capture markers, and at transport stop either
//! finalizes it (header update, immutable) or marks it for removal.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use midly::num::{u4, u7, u15, u28};
use midly::{Format, Header, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use rf_core::{MidiBuffer, MidiEvent, NoteTracker, Sample, SampleCnt, SamplePos, status};

use crate::{AudioSource, FileError, FileResult, load_wav_sources};

/// Capture start/end marker recorded by destructive-mode writers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMark {
    /// Capture began at this timeline position; `file_offset` is where in
    /// the file the material starts
    Start {
        position: SamplePos,
        file_offset: SampleCnt,
    },
    End {
        file_offset: SampleCnt,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// SINK TRAITS
// ═══════════════════════════════════════════════════════════════════════════════

/// Destination for one channel of captured audio
pub trait AudioCaptureSink: Send {
    fn name(&self) -> &str;

    /// Append samples. Returns how many were written.
    fn write(&mut self, samples: &[Sample]) -> FileResult<usize>;

    /// Samples written so far
    fn length(&self) -> SampleCnt;

    fn mark_streaming_write_started(&mut self);

    fn mark_capture_start(&mut self, position: SamplePos);

    fn mark_capture_end(&mut self);

    fn capture_marks(&self) -> &[CaptureMark];

    /// Record the timeline position the material belongs at and bring the
    /// file header up to date
    fn update_header(&mut self, natural_position: SamplePos) -> FileResult<()>;

    /// Close the file for writing
    fn mark_immutable(&mut self) -> FileResult<()>;

    /// Delete the file once the sink is dropped
    fn mark_for_remove(&mut self);

    fn natural_position(&self) -> SamplePos;

    /// Readable view of the finished material
    fn source(&self) -> FileResult<Arc<dyn AudioSource>>;
}

/// Destination for captured MIDI
pub trait MidiCaptureSink: Send {
    fn name(&self) -> &str;

    fn mark_streaming_write_started(&mut self);

    /// Append events whose times are relative to the start of the capture
    fn write_events(&mut self, events: &[MidiEvent]) -> FileResult<usize>;

    /// Number of events written
    fn event_count(&self) -> usize;

    /// Finish the take: place it at `position`, resolve notes still sounding
    /// at `length` and write the file
    fn commit(&mut self, position: SamplePos, length: SampleCnt) -> FileResult<()>;

    fn mark_for_remove(&mut self);

    /// Events of the finished take, relative to its start
    fn events(&self) -> Arc<Vec<MidiEvent>>;
}

/// Creates the sinks for each new take
pub trait CaptureSinkFactory: Send + Sync {
    fn create_audio_sink(
        &self,
        track: &str,
        take: u32,
        channel: usize,
        n_channels: usize,
    ) -> FileResult<Box<dyn AudioCaptureSink>>;

    fn create_midi_sink(&self, track: &str, take: u32) -> FileResult<Box<dyn MidiCaptureSink>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// WAV SINK
// ═══════════════════════════════════════════════════════════════════════════════

/// Mono 32-bit float WAV capture file
pub struct WavCaptureSink {
    name: String,
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    length: SampleCnt,
    natural_position: SamplePos,
    marks: Vec<CaptureMark>,
    streaming: bool,
    remove: bool,
}

impl WavCaptureSink {
    pub fn create(path: PathBuf, sample_rate: u32) -> FileResult<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = hound::WavWriter::create(&path, spec)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        log::debug!("Created capture file {:?}", path);

        Ok(Self {
            name,
            path,
            writer: Some(writer),
            length: 0,
            natural_position: 0,
            marks: Vec::new(),
            streaming: false,
            remove: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }
}

impl AudioCaptureSink for WavCaptureSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, samples: &[Sample]) -> FileResult<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| FileError::WriteError(format!("{}: file is immutable", self.name)))?;

        let mut written = 0;
        for &s in samples {
            writer.write_sample(s)?;
            written += 1;
        }
        self.length += written as SampleCnt;
        Ok(written)
    }

    fn length(&self) -> SampleCnt {
        self.length
    }

    fn mark_streaming_write_started(&mut self) {
        self.streaming = true;
    }

    fn mark_capture_start(&mut self, position: SamplePos) {
        self.marks.push(CaptureMark::Start {
            position,
            file_offset: self.length,
        });
    }

    fn mark_capture_end(&mut self) {
        self.marks.push(CaptureMark::End {
            file_offset: self.length,
        });
    }

    fn capture_marks(&self) -> &[CaptureMark] {
        &self.marks
    }

    fn update_header(&mut self, natural_position: SamplePos) -> FileResult<()> {
        self.natural_position = natural_position;
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn mark_immutable(&mut self) -> FileResult<()> {
        self.streaming = false;
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            log::info!("Capture file finished: {:?} ({} samples)", self.path, self.length);
        }
        Ok(())
    }

    fn mark_for_remove(&mut self) {
        self.remove = true;
    }

    fn natural_position(&self) -> SamplePos {
        self.natural_position
    }

    fn source(&self) -> FileResult<Arc<dyn AudioSource>> {
        if self.writer.is_some() {
            return Err(FileError::ReadError(format!(
                "{}: capture file still open for writing",
                self.name
            )));
        }
        load_wav_sources(&self.path)?
            .into_iter()
            .next()
            .ok_or_else(|| FileError::InvalidFile(self.path.display().to_string()))
    }
}

impl Drop for WavCaptureSink {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                log::error!("Failed to close capture file {:?}: {}", self.path, e);
            }
        }
        if self.remove {
            match std::fs::remove_file(&self.path) {
                Ok(()) => log::info!("Removed capture file {:?}", self.path),
                Err(e) => log::warn!("Could not remove capture file {:?}: {}", self.path, e),
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SMF SINK
// ═══════════════════════════════════════════════════════════════════════════════

/// Pulses per quarter note in written files
const SMF_PPQN: u16 = 480;
/// Files are written at a fixed 120 bpm, two beats per second
const SMF_BEATS_PER_SECOND: i64 = 2;

/// Standard MIDI File capture (format 0), written at commit
pub struct SmfCaptureSink {
    name: String,
    path: PathBuf,
    sample_rate: u32,
    events: Vec<MidiEvent>,
    committed: Arc<Vec<MidiEvent>>,
    position: SamplePos,
    streaming: bool,
    written: bool,
    remove: bool,
}

impl SmfCaptureSink {
    pub fn create(path: PathBuf, sample_rate: u32) -> FileResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            path,
            sample_rate: sample_rate.max(1),
            events: Vec::new(),
            committed: Arc::new(Vec::new()),
            position: 0,
            streaming: false,
            written: false,
            remove: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> SamplePos {
        self.position
    }

    fn samples_to_ticks(&self, samples: SampleCnt) -> u64 {
        let ticks = samples.max(0) as i128 * SMF_PPQN as i128 * SMF_BEATS_PER_SECOND as i128
            / self.sample_rate as i128;
        ticks as u64
    }

    fn write_file(&self, events: &[MidiEvent]) -> FileResult<()> {
        let mut track = Vec::with_capacity(events.len() + 1);
        let mut last_tick = 0u64;

        for ev in events {
            let Some(message) = to_midly_message(ev) else {
                continue;
            };
            let tick = self.samples_to_ticks(ev.time);
            let delta = tick.saturating_sub(last_tick).min(0x0FFF_FFFF) as u32;
            last_tick = tick;
            track.push(TrackEvent {
                delta: u28::new(delta),
                kind: TrackEventKind::Midi {
                    channel: u4::new(ev.channel()),
                    message,
                },
            });
        }
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(midly::MetaMessage::EndOfTrack),
        });

        let smf = Smf {
            header: Header::new(Format::SingleTrack, Timing::Metrical(u15::new(SMF_PPQN))),
            tracks: vec![track],
        };
        smf.save(&self.path)?;
        Ok(())
    }
}

fn to_midly_message(ev: &MidiEvent) -> Option<MidiMessage> {
    let d1 = u7::new(ev.data[1] & 0x7F);
    let d2 = u7::new(ev.data[2] & 0x7F);
    Some(match ev.status() {
        status::NOTE_OFF => MidiMessage::NoteOff { key: d1, vel: d2 },
        status::NOTE_ON => MidiMessage::NoteOn { key: d1, vel: d2 },
        status::POLY_PRESSURE => MidiMessage::Aftertouch { key: d1, vel: d2 },
        status::CONTROL_CHANGE => MidiMessage::Controller {
            controller: d1,
            value: d2,
        },
        status::PROGRAM_CHANGE => MidiMessage::ProgramChange { program: d1 },
        status::CHANNEL_PRESSURE => MidiMessage::ChannelAftertouch { vel: d1 },
        status::PITCH_BEND => MidiMessage::PitchBend {
            bend: midly::PitchBend(midly::num::u14::new(
                ((ev.data[2] as u16 & 0x7F) << 7) | (ev.data[1] as u16 & 0x7F),
            )),
        },
        _ => return None,
    })
}

impl MidiCaptureSink for SmfCaptureSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn mark_streaming_write_started(&mut self) {
        self.streaming = true;
    }

    fn write_events(&mut self, events: &[MidiEvent]) -> FileResult<usize> {
        if self.written {
            return Err(FileError::WriteError(format!(
                "{}: take already committed",
                self.name
            )));
        }
        self.events.extend_from_slice(events);
        Ok(events.len())
    }

    fn event_count(&self) -> usize {
        self.events.len()
    }

    fn commit(&mut self, position: SamplePos, length: SampleCnt) -> FileResult<()> {
        self.position = position;
        self.streaming = false;

        let mut events: Vec<MidiEvent> = self
            .events
            .iter()
            .filter(|ev| ev.time < length)
            .copied()
            .collect();
        events.sort_by_key(|ev| ev.time);

        let mut tracker = NoteTracker::new();
        for ev in &events {
            tracker.track(ev);
        }
        if tracker.on() > 0 {
            let mut offs = MidiBuffer::with_capacity(tracker.on() as usize);
            tracker.resolve(&mut offs, (length - 1).max(0));
            log::debug!("{}: resolved {} stuck note(s) at end of take", self.name, offs.len());
            events.extend_from_slice(offs.as_slice());
        }

        self.write_file(&events)?;
        self.written = true;
        self.committed = Arc::new(events);
        log::info!("MIDI capture file finished: {:?}", self.path);
        Ok(())
    }

    fn mark_for_remove(&mut self) {
        self.remove = true;
    }

    fn events(&self) -> Arc<Vec<MidiEvent>> {
        self.committed.clone()
    }
}

impl Drop for SmfCaptureSink {
    fn drop(&mut self) {
        if self.remove && self.written {
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("Could not remove MIDI capture file {:?}: {}", self.path, e);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FACTORY
// ═══════════════════════════════════════════════════════════════════════════════

/// Creates capture files in one directory, named `{track}-{take:03}[-{channel}]`
#[derive(Debug, Clone)]
pub struct FileSinkFactory {
    dir: PathBuf,
    sample_rate: u32,
}

impl FileSinkFactory {
    pub fn new(dir: impl Into<PathBuf>, sample_rate: u32) -> Self {
        Self {
            dir: dir.into(),
            sample_rate,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn audio_path(&self, track: &str, take: u32, channel: usize, n_channels: usize) -> PathBuf {
        let name = if n_channels > 1 {
            format!("{}-{:03}-{}.wav", sanitize(track), take, channel)
        } else {
            format!("{}-{:03}.wav", sanitize(track), take)
        };
        self.dir.join(name)
    }

    pub fn midi_path(&self, track: &str, take: u32) -> PathBuf {
        self.dir.join(format!("{}-{:03}.mid", sanitize(track), take))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl CaptureSinkFactory for FileSinkFactory {
    fn create_audio_sink(
        &self,
        track: &str,
        take: u32,
        channel: usize,
        n_channels: usize,
    ) -> FileResult<Box<dyn AudioCaptureSink>> {
        let path = self.audio_path(track, take, channel, n_channels);
        Ok(Box::new(WavCaptureSink::create(path, self.sample_rate)?))
    }

    fn create_midi_sink(&self, track: &str, take: u32) -> FileResult<Box<dyn MidiCaptureSink>> {
        Ok(Box::new(SmfCaptureSink::create(
            self.midi_path(track, take),
            self.sample_rate,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_sink_write_and_source() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FileSinkFactory::new(dir.path(), 48000);
        let mut sink = factory.create_audio_sink("Audio 1", 1, 0, 1).unwrap();

        assert_eq!(sink.write(&[0.5, -0.5, 0.25]).unwrap(), 3);
        assert_eq!(sink.length(), 3);
        assert!(sink.source().is_err());

        sink.update_header(4800).unwrap();
        sink.mark_immutable().unwrap();
        assert_eq!(sink.natural_position(), 4800);
        assert!(sink.write(&[1.0]).is_err());

        let src = sink.source().unwrap();
        let mut out = [0.0; 3];
        src.read(&mut out, 0).unwrap();
        assert_eq!(out, [0.5, -0.5, 0.25]);
        assert!(dir.path().join("Audio_1-001.wav").exists());
    }

    #[test]
    fn test_wav_sink_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FileSinkFactory::new(dir.path(), 44100);
        let path = factory.audio_path("gtr", 2, 1, 2);
        {
            let mut sink = factory.create_audio_sink("gtr", 2, 1, 2).unwrap();
            sink.write(&[0.0; 16]).unwrap();
            assert!(path.exists());
            sink.mark_for_remove();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_capture_marks_track_file_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = WavCaptureSink::create(dir.path().join("d.wav"), 48000).unwrap();
        sink.mark_capture_start(1000);
        sink.write(&[0.0; 10]).unwrap();
        sink.mark_capture_end();
        assert_eq!(
            sink.capture_marks(),
            &[
                CaptureMark::Start {
                    position: 1000,
                    file_offset: 0
                },
                CaptureMark::End { file_offset: 10 }
            ]
        );
    }

    #[test]
    fn test_smf_commit_resolves_stuck_notes() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FileSinkFactory::new(dir.path(), 48000);
        let mut sink = factory.create_midi_sink("keys", 1).unwrap();
        sink.mark_streaming_write_started();
        sink.write_events(&[
            MidiEvent::note_on(0, 0, 60, 100),
            MidiEvent::note_on(24000, 0, 64, 100),
            MidiEvent::note_off(36000, 0, 64, 0),
        ])
        .unwrap();

        sink.commit(96000, 48000).unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 4);
        let last = events.last().unwrap();
        assert!(last.is_note_off());
        assert_eq!(last.note(), 60);

        let bytes = std::fs::read(factory.midi_path("keys", 1)).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.tracks.len(), 1);
        // three events plus the resolved note off plus end of track
        assert_eq!(smf.tracks[0].len(), 5);
        // 24000 samples at 48k is one beat
        assert_eq!(smf.tracks[0][1].delta.as_int(), 480);
    }
}
