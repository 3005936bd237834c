//! Disk Writer - Capture Streaming
//!
//! Moves recorded input from the process thread to disk:
//! - [`DiskWriter::run`] copies the part of each cycle that falls inside the
//!   punch window into one ring buffer per channel, without blocking
//! - the butler drains those rings into capture files in bounded chunks
//!   ([`DiskWriter::do_flush`])
//! - at transport stop the take is flushed completely and turned into
//!   regions, or discarded on abort
//!
//! Locking: `capture` is held by the process thread for a cycle (try-lock
//! only) and briefly by the non-RT stop path; `flush` serializes the
//! consumers of the capture rings.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use rf_core::{MAX_SAMPLEPOS, MidiEvent, SampleCnt, SamplePos};
use rf_file::{AudioCaptureSink, AudioPlaylist, AudioRegion, AudioSource, MidiCaptureSink, MidiPlaylist, MidiRegion};

use crate::capture::{
    AlignStyle, CaptureEvent, CaptureInfo, CaptureTransition, CaptureTransitionKind, RecordSpan,
    record_span,
};
use crate::channel::{ChannelList, ChannelSet, WriterChannel};
use crate::context::DiskIoContext;
use crate::error::{DiskIoError, DiskIoResult, IoStatus};
use crate::midi_ring::MidiRingBuffer;
use crate::notify::DiskEvent;
use crate::process::ProcessBuffers;
use crate::track::TrackId;
use crate::transport::TransportSnapshot;

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

const TRANSPORT_ROLLING: u8 = 0x4;
const TRACK_REC_ENABLED: u8 = 0x2;
const GLOBAL_REC_ENABLED: u8 = 0x1;
const FULLY_REC_ENABLED: u8 = TRANSPORT_ROLLING | TRACK_REC_ENABLED | GLOBAL_REC_ENABLED;

/// Capture passes and xruns queued between two stops before the process
/// thread starts dropping them
const CAPTURE_EVENT_SLOTS: usize = 1024;
/// Slots xruns leave free so that finished passes still get through
const FINISHED_RESERVE: usize = 64;

// ═══════════════════════════════════════════════════════════════════════════
// CAPTURED TAKE
// ═══════════════════════════════════════════════════════════════════════════

/// What a transport stop produced for one track
#[derive(Debug, Clone, Default)]
pub struct CapturedTake {
    /// Region spanning the whole capture file, not placed on any playlist
    pub whole_file: Option<AudioRegion>,
    /// One region per punch pass, already added to the track's playlist
    pub regions: Vec<AudioRegion>,
    pub midi_region: Option<MidiRegion>,
    pub captures: Vec<CaptureInfo>,
}

// ═══════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Owned by whoever holds the `capture` lock
struct CaptureState {
    last_possibly_recording: u8,
    was_recording: bool,
    capture_start: SamplePos,
    first_recordable: SamplePos,
    last_recordable: SamplePos,
    /// Samples captured in the current pass
    captured: SampleCnt,
    captured_loops: SampleCnt,
    loop_length: SampleCnt,
    /// Samples captured in the whole take; the MIDI timeline
    take_position: SamplePos,
    /// Overruns of the current pass with no room left in `events`
    lost_xruns: u32,
    events: rtrb::Producer<CaptureEvent>,
}

/// Completed passes collected from the process thread
struct FinishedCaptures {
    events: rtrb::Consumer<CaptureEvent>,
    pending_xruns: Vec<SampleCnt>,
    infos: Vec<CaptureInfo>,
}

impl FinishedCaptures {
    fn collect(&mut self) {
        while let Ok(ev) = self.events.pop() {
            match ev {
                CaptureEvent::Xrun(at) => self.pending_xruns.push(at),
                CaptureEvent::Finished {
                    start,
                    samples,
                    loop_offset,
                    lost_xruns,
                } => self.infos.push(CaptureInfo {
                    start,
                    samples,
                    xruns: std::mem::take(&mut self.pending_xruns),
                    lost_xruns,
                    loop_offset,
                }),
            }
        }
    }
}

/// Owned by whoever holds the `flush` lock
struct FlushState {
    midi: Vec<MidiEvent>,
    /// Take position up to which MIDI has been handed to the sink
    midi_flushed: SamplePos,
}

// ═══════════════════════════════════════════════════════════════════════════
// DISK WRITER
// ═══════════════════════════════════════════════════════════════════════════

pub struct DiskWriter {
    id: TrackId,
    name: String,
    ctx: Arc<DiskIoContext>,
    channels: ChannelSet<WriterChannel>,
    midi_buf: MidiRingBuffer,
    midi_sink: Mutex<Option<Box<dyn MidiCaptureSink>>>,
    playlist: Mutex<Option<Arc<dyn AudioPlaylist>>>,
    midi_playlist: Mutex<Option<Arc<dyn MidiPlaylist>>>,

    record_enabled: AtomicBool,
    record_safe: AtomicBool,
    midi_capture: AtomicBool,
    destructive: AtomicBool,
    alignment_style: AtomicU8,
    capture_offset: AtomicI64,
    playback_offset: AtomicI64,
    preroll_trim: AtomicI64,
    take: AtomicU32,

    // published by the process thread
    need_butler: AtomicBool,
    was_recording: AtomicBool,
    capture_start: AtomicI64,
    captured: AtomicI64,
    midi_captured: AtomicI64,
    overruns: AtomicU64,

    capture: Mutex<CaptureState>,
    finished: Mutex<FinishedCaptures>,
    flush: Mutex<FlushState>,
}

impl DiskWriter {
    pub fn new(id: TrackId, name: impl Into<String>, n_channels: usize, ctx: Arc<DiskIoContext>) -> Self {
        let config = ctx.config();
        let channels = ChannelSet::new(ctx.trash().clone());
        channels.set_count(n_channels, config.capture_buffer_samples(), 0);
        let (producer, consumer) = rtrb::RingBuffer::new(CAPTURE_EVENT_SLOTS);

        Self {
            id,
            name: name.into(),
            channels,
            midi_buf: MidiRingBuffer::new(config.midi_ring_events),
            midi_sink: Mutex::new(None),
            playlist: Mutex::new(None),
            midi_playlist: Mutex::new(None),
            record_enabled: AtomicBool::new(false),
            record_safe: AtomicBool::new(false),
            midi_capture: AtomicBool::new(false),
            destructive: AtomicBool::new(false),
            alignment_style: AtomicU8::new(align_to_u8(AlignStyle::default())),
            capture_offset: AtomicI64::new(0),
            playback_offset: AtomicI64::new(0),
            preroll_trim: AtomicI64::new(0),
            take: AtomicU32::new(1),
            need_butler: AtomicBool::new(false),
            was_recording: AtomicBool::new(false),
            capture_start: AtomicI64::new(0),
            captured: AtomicI64::new(0),
            midi_captured: AtomicI64::new(0),
            overruns: AtomicU64::new(0),
            capture: Mutex::new(CaptureState {
                last_possibly_recording: 0,
                was_recording: false,
                capture_start: 0,
                first_recordable: MAX_SAMPLEPOS,
                last_recordable: MAX_SAMPLEPOS,
                captured: 0,
                captured_loops: 0,
                loop_length: 0,
                take_position: 0,
                lost_xruns: 0,
                events: producer,
            }),
            finished: Mutex::new(FinishedCaptures {
                events: consumer,
                pending_xruns: Vec::new(),
                infos: Vec::new(),
            }),
            flush: Mutex::new(FlushState {
                midi: Vec::with_capacity(1024),
                midi_flushed: 0,
            }),
            ctx,
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Accessors
    // ───────────────────────────────────────────────────────────────────────

    #[inline]
    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> ChannelList<WriterChannel> {
        self.channels.snapshot()
    }

    #[inline]
    pub fn need_butler(&self) -> bool {
        self.need_butler.load(Ordering::Relaxed)
    }

    /// True while a punch pass is being captured
    #[inline]
    pub fn is_recording(&self) -> bool {
        self.was_recording.load(Ordering::Acquire)
    }

    #[inline]
    pub fn record_enabled(&self) -> bool {
        self.record_enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn record_safe(&self) -> bool {
        self.record_safe.load(Ordering::Acquire)
    }

    #[inline]
    pub fn destructive(&self) -> bool {
        self.destructive.load(Ordering::Acquire)
    }

    pub fn set_destructive(&self, yn: bool) {
        self.destructive.store(yn, Ordering::Release);
    }

    pub fn midi_capture(&self) -> bool {
        self.midi_capture.load(Ordering::Acquire)
    }

    /// Capture MIDI input alongside audio; takes effect at the next record
    /// enable
    pub fn set_midi_capture(&self, yn: bool) {
        self.midi_capture.store(yn, Ordering::Release);
    }

    pub fn alignment_style(&self) -> AlignStyle {
        align_from_u8(self.alignment_style.load(Ordering::Acquire))
    }

    /// Input latency of the capture path
    pub fn set_capture_offset(&self, samples: SampleCnt) {
        self.capture_offset.store(samples.max(0), Ordering::Release);
    }

    /// Output latency (plus roll delay) of the monitored playback path
    pub fn set_playback_offset(&self, samples: SampleCnt) {
        self.playback_offset.store(samples.max(0), Ordering::Release);
    }

    /// Samples trimmed from the front of the first region of a take
    pub fn set_preroll_trim(&self, samples: SampleCnt) {
        self.preroll_trim.store(samples.max(0), Ordering::Release);
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Number of the take the next capture files belong to
    pub fn take(&self) -> u32 {
        self.take.load(Ordering::Acquire)
    }

    /// Fraction of the capture buffers still free; 1.0 with no channels
    pub fn buffer_load(&self) -> f32 {
        let chans = self.channels.reader();
        chans.first().map_or(1.0, |c| {
            c.wbuf().write_space() as f32 / c.wbuf().capacity().saturating_sub(1).max(1) as f32
        })
    }

    pub fn set_playlist(&self, playlist: Option<Arc<dyn AudioPlaylist>>) {
        *self.playlist.lock() = playlist;
    }

    pub fn playlist(&self) -> Option<Arc<dyn AudioPlaylist>> {
        self.playlist.lock().clone()
    }

    pub fn set_midi_playlist(&self, playlist: Option<Arc<dyn MidiPlaylist>>) {
        *self.midi_playlist.lock() = playlist;
    }

    pub fn midi_playlist(&self) -> Option<Arc<dyn MidiPlaylist>> {
        self.midi_playlist.lock().clone()
    }

    /// Timeline start of completed pass `n`, or of the pass in progress
    pub fn get_capture_start_sample(&self, n: usize) -> SamplePos {
        let mut fin = self.finished.lock();
        fin.collect();
        match fin.infos.get(n) {
            Some(info) => info.start,
            None => self.capture_start.load(Ordering::Acquire),
        }
    }

    /// Length of completed pass `n`, or of the pass in progress
    pub fn get_captured_samples(&self, n: usize) -> SampleCnt {
        let mut fin = self.finished.lock();
        fin.collect();
        match fin.infos.get(n) {
            Some(info) => info.samples,
            None => self.captured.load(Ordering::Acquire),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Record control (non-RT)
    // ───────────────────────────────────────────────────────────────────────

    /// Arm or disarm the track. Arming creates the capture files for the
    /// next take and fails if they cannot be created.
    pub fn set_record_enabled(&self, yn: bool) -> DiskIoResult<()> {
        if yn {
            if self.record_safe() {
                return Err(DiskIoError::RecordSafe(self.name.clone()));
            }
            if self.channels.is_empty() && !self.midi_capture() {
                return Err(DiskIoError::NoChannels(self.name.clone()));
            }
            self.prepare_write_sources()?;
        }

        if self.record_enabled.swap(yn, Ordering::AcqRel) != yn {
            log::debug!("{}: record {}", self.name, if yn { "enabled" } else { "disabled" });
            self.ctx.events().send(DiskEvent::RecordEnableChanged {
                track: self.id,
                enabled: yn,
            });
        }
        Ok(())
    }

    pub fn set_record_safe(&self, yn: bool) {
        if self.record_safe.swap(yn, Ordering::AcqRel) != yn {
            self.ctx.events().send(DiskEvent::RecordSafeChanged {
                track: self.id,
                safe: yn,
            });
        }
    }

    /// Refused while the track is capturing unless `force` is set
    pub fn set_align_style(&self, style: AlignStyle, force: bool) {
        if self.record_enabled() && self.ctx.transport().actively_recording() && !force {
            log::warn!("{}: cannot change capture alignment while recording", self.name);
            return;
        }
        let old = self.alignment_style.swap(align_to_u8(style), Ordering::AcqRel);
        if old != align_to_u8(style) || force {
            self.ctx.events().send(DiskEvent::AlignmentStyleChanged { track: self.id });
        }
    }

    /// Create the capture files of the current take where missing. All of
    /// them are created before any is installed, so a failure leaves no
    /// partial set behind.
    fn prepare_write_sources(&self) -> DiskIoResult<()> {
        let chans = self.channels.snapshot();
        let take = self.take();
        let sinks = self.ctx.sinks();
        let n_chans = chans.len();

        let mut created: Vec<(usize, Box<dyn AudioCaptureSink>)> = Vec::new();
        for (n, chan) in chans.iter().enumerate() {
            if chan.sink().lock().is_some() {
                continue;
            }
            let sink = sinks
                .create_audio_sink(&self.name, take, n, n_chans)
                .map_err(|source| DiskIoError::SinkCreation {
                    track: self.name.clone(),
                    source,
                });
            match sink {
                Ok(sink) => created.push((n, sink)),
                Err(e) => {
                    for (_, mut sink) in created {
                        sink.mark_for_remove();
                    }
                    return Err(e);
                }
            }
        }

        let midi = if self.midi_capture() && self.midi_sink.lock().is_none() {
            match sinks.create_midi_sink(&self.name, take) {
                Ok(sink) => Some(sink),
                Err(source) => {
                    for (_, mut sink) in created {
                        sink.mark_for_remove();
                    }
                    return Err(DiskIoError::SinkCreation {
                        track: self.name.clone(),
                        source,
                    });
                }
            }
        } else {
            None
        };

        for (n, mut sink) in created {
            sink.mark_streaming_write_started();
            *chans[n].sink().lock() = Some(sink);
        }
        if let Some(mut sink) = midi {
            sink.mark_streaming_write_started();
            *self.midi_sink.lock() = Some(sink);
        }
        Ok(())
    }

    /// Start a new take: drop the current files and, if armed, create the
    /// next set
    fn reset_write_sources(&self) -> DiskIoResult<()> {
        if self.destructive() {
            return Ok(());
        }
        for chan in self.channels.snapshot().iter() {
            chan.sink().lock().take();
            chan.reset_capture_count();
        }
        self.midi_sink.lock().take();
        self.take.fetch_add(1, Ordering::AcqRel);

        if self.record_enabled() {
            self.prepare_write_sources()?;
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Process thread
    // ───────────────────────────────────────────────────────────────────────

    /// Capture one cycle of input. `start` is the transport position of the
    /// cycle; `bufs` holds the track's input.
    pub fn run(
        &self,
        bufs: &ProcessBuffers<'_>,
        start: SamplePos,
        nframes: usize,
        transport: &TransportSnapshot,
    ) {
        let Some(mut guard) = self.capture.try_lock() else {
            return;
        };
        let st = &mut *guard;
        self.need_butler.store(false, Ordering::Relaxed);

        let re = self.record_enabled();
        let punch_in = transport.punch_in_range();
        let can_record = transport.actively_recording()
            || (transport.rolling()
                && transport.record_enabled()
                && punch_in.is_some_and(|p| transport.transport_sample <= p.start));

        self.check_record_status(st, transport, can_record);

        if nframes == 0 {
            return;
        }

        let nominally_recording = can_record && re;
        if st.last_recordable < st.first_recordable {
            st.last_recordable = MAX_SAMPLEPOS;
        }
        st.loop_length = transport.loop_range.map_or(0, |l| l.length());

        let chans = self.channels.reader();
        let allowed = nominally_recording
            || (re && st.was_recording && transport.record_enabled() && punch_in.is_some());

        // a loop end inside the cycle closes the pass at exactly that sample
        let wrap = transport.loop_wrap(start, nframes);
        let head = wrap.map_or(nframes, |(at, _)| at);

        let mut kept = self.capture_segment(st, &chans, bufs, allowed, 0, start, head);
        if let Some((_, lp)) = wrap {
            self.loop_pass(st, lp.start);
            if kept && head < nframes {
                kept = self.capture_segment(st, &chans, bufs, allowed, head, lp.start, nframes - head);
            }
        }
        if !kept {
            self.need_butler.store(true, Ordering::Relaxed);
            return;
        }

        let chunk = self.ctx.write_chunk();
        let audio_pending = chans
            .first()
            .is_some_and(|c| c.wbuf().read_space() >= chunk);
        let midi_pending = self.midi_buf.read_space() > self.midi_buf.capacity() / 2;
        if audio_pending || midi_pending {
            self.need_butler.store(true, Ordering::Relaxed);
        }
    }

    /// Capture the part of `bufs[base..base + len]` that falls inside the
    /// record window, where `base` sits at timeline position `seg_start`.
    /// Returns false on overrun.
    #[allow(clippy::too_many_arguments)]
    fn capture_segment(
        &self,
        st: &mut CaptureState,
        chans: &[Arc<WriterChannel>],
        bufs: &ProcessBuffers<'_>,
        allowed: bool,
        base: usize,
        seg_start: SamplePos,
        len: usize,
    ) -> bool {
        let span = if allowed {
            record_span(
                st.first_recordable,
                st.last_recordable,
                seg_start,
                len as SampleCnt,
            )
        } else {
            RecordSpan::NONE
        };

        if span.count > 0 {
            let span = RecordSpan {
                offset: span.offset + base as SampleCnt,
                ..span
            };
            if !st.was_recording {
                st.captured = 0;
                st.was_recording = true;
                self.was_recording.store(true, Ordering::Release);
            }

            if !self.capture_audio(st, chans, bufs, span) {
                return false;
            }
            if self.midi_capture() {
                self.capture_midi(st, bufs, span);
            }

            st.captured += span.count;
            st.take_position += span.count;
            self.captured.store(st.captured, Ordering::Release);
            self.midi_captured.store(st.take_position, Ordering::Release);
        } else if st.was_recording {
            self.finish_capture(st);
        }
        true
    }

    fn alignment_offset(&self) -> SampleCnt {
        match self.alignment_style() {
            AlignStyle::ExistingMaterial => {
                self.capture_offset.load(Ordering::Acquire)
                    + self.playback_offset.load(Ordering::Acquire)
            }
            AlignStyle::CaptureTime => 0,
        }
    }

    /// Recompute the punch window when rolling, track arming or global
    /// arming changed since the last cycle
    fn check_record_status(&self, st: &mut CaptureState, transport: &TransportSnapshot, can_record: bool) {
        let mut possibly = 0;
        if transport.rolling() {
            possibly |= TRANSPORT_ROLLING;
        }
        if self.record_enabled() {
            possibly |= TRACK_REC_ENABLED;
        }
        if can_record {
            possibly |= GLOBAL_REC_ENABLED;
        }

        if possibly ^ st.last_possibly_recording == 0 {
            return;
        }

        if possibly == FULLY_REC_ENABLED {
            let offset = self.alignment_offset();
            st.capture_start = match transport.punch_in_range() {
                Some(punch) => punch.start,
                None => transport.transport_sample,
            };
            st.first_recordable = st.capture_start + offset;
            st.last_recordable = match transport.punch_out_range() {
                Some(punch) => punch.end.saturating_add(offset),
                None => MAX_SAMPLEPOS,
            };
            self.capture_start.store(st.capture_start, Ordering::Release);

            if self.destructive() {
                self.push_transition(CaptureTransitionKind::CaptureStart, st.capture_start);
            }
        }

        st.last_possibly_recording = possibly;
    }

    fn push_transition(&self, kind: CaptureTransitionKind, capture_val: SamplePos) {
        let t = CaptureTransition { kind, capture_val };
        for chan in self.channels.reader().iter() {
            if chan.transitions().write(std::slice::from_ref(&t)) != 1 {
                panic!("{}: capture transition buffer full", self.name);
            }
        }
    }

    /// Copy the recorded span of each input into its capture ring. Returns
    /// false on overrun, in which case nothing of this cycle is kept.
    fn capture_audio(
        &self,
        st: &mut CaptureState,
        chans: &[Arc<WriterChannel>],
        bufs: &ProcessBuffers<'_>,
        span: RecordSpan,
    ) -> bool {
        let offset = span.offset as usize;
        let count = span.count as usize;

        if chans.iter().any(|c| c.wbuf().write_space() < count) {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            self.ctx.events().send(DiskEvent::Overrun { track: self.id });
            let queued = st.events.slots() > FINISHED_RESERVE
                && st.events.push(CaptureEvent::Xrun(st.captured)).is_ok();
            if !queued {
                st.lost_xruns = st.lost_xruns.saturating_add(1);
            }
            return false;
        }

        for (n, chan) in chans.iter().enumerate() {
            // surplus channels record the last input
            let src = bufs
                .audio
                .get(n)
                .or_else(|| bufs.audio.last())
                .and_then(|b| b.get(offset..offset + count));
            match src {
                Some(src) => chan.wbuf().write(src),
                None => chan.wbuf().write_zero(count),
            };
        }
        true
    }

    /// Queue the played events of the recorded span on the take timeline
    fn capture_midi(&self, st: &mut CaptureState, bufs: &ProcessBuffers<'_>, span: RecordSpan) {
        let end = span.offset + span.count;
        for ev in bufs.midi.iter() {
            if ev.time < span.offset {
                continue;
            }
            if ev.time >= end {
                break;
            }
            let injected = bufs
                .immediate_midi
                .is_some_and(|imm| imm.iter().any(|i| i.time == ev.time && i.same_message(ev)));
            if injected {
                continue;
            }
            let ev = ev.with_time(st.take_position + ev.time - span.offset);
            if !self.midi_buf.write(ev) {
                self.ctx.events().send(DiskEvent::Overrun { track: self.id });
                break;
            }
        }
    }

    /// Close the pass in progress and queue its `CaptureInfo`
    fn finish_capture(&self, st: &mut CaptureState) {
        st.was_recording = false;
        self.was_recording.store(false, Ordering::Release);
        st.first_recordable = MAX_SAMPLEPOS;
        st.last_recordable = MAX_SAMPLEPOS;

        if st.captured == 0 {
            return;
        }

        if self.destructive() {
            self.push_transition(CaptureTransitionKind::CaptureEnd, st.captured);
        }

        let finished = CaptureEvent::Finished {
            start: st.capture_start,
            samples: st.captured,
            loop_offset: st.captured_loops * st.loop_length,
            lost_xruns: std::mem::take(&mut st.lost_xruns),
        };
        if st.events.push(finished).is_err() {
            self.ctx.events().send(DiskEvent::Overrun { track: self.id });
        }

        st.captured = 0;
        self.captured.store(0, Ordering::Release);
    }

    /// The transport wrapped to `loop_start` between cycles: end the current
    /// pass and begin the next one there. A loop end inside a cycle is
    /// handled by `run` itself.
    pub fn transport_looped(&self, loop_start: SamplePos) {
        let Some(mut guard) = self.capture.try_lock() else {
            return;
        };
        self.loop_pass(&mut guard, loop_start);
    }

    fn loop_pass(&self, st: &mut CaptureState, loop_start: SamplePos) {
        if !st.was_recording {
            return;
        }

        self.finish_capture(st);

        st.capture_start = loop_start;
        st.first_recordable = loop_start;
        st.last_recordable = MAX_SAMPLEPOS;
        st.was_recording = true;
        self.was_recording.store(true, Ordering::Release);
        self.capture_start.store(loop_start, Ordering::Release);

        if self.destructive() {
            self.push_transition(CaptureTransitionKind::CaptureStart, loop_start);
        }
        st.captured_loops += 1;
    }

    // ───────────────────────────────────────────────────────────────────────
    // Butler
    // ───────────────────────────────────────────────────────────────────────

    /// Write at most one chunk per channel to disk. `force` drains whatever
    /// is buffered regardless of the chunk threshold.
    pub fn do_flush(&self, force: bool) -> DiskIoResult<IoStatus> {
        self.flush_chunk(force).inspect_err(|e| {
            log::error!("{}: capture flush failed: {}", self.name, e);
            self.ctx.events().send(DiskEvent::WriteError { track: self.id });
        })
    }

    fn flush_chunk(&self, force: bool) -> DiskIoResult<IoStatus> {
        let mut fl = self.flush.lock();
        let chans = self.channels.snapshot();
        let chunk = self.ctx.write_chunk();
        let was_recording = self.is_recording();
        let destructive = self.destructive();
        let mut status = IoStatus::Done;

        for chan in chans.iter() {
            let wbuf = chan.wbuf();
            let total = wbuf.read_space();
            if total == 0 || (total < chunk && !force && was_recording) {
                continue;
            }

            // more than one chunk left means the butler should come back soon
            if total >= 2 * chunk || ((force || !was_recording) && total > chunk) {
                status = IoStatus::MoreWork;
            }

            let mut guard = chan.sink().lock();
            let Some(sink) = guard.as_mut() else {
                return Err(DiskIoError::CaptureWrite {
                    track: self.name.clone(),
                    source: rf_file::FileError::WriteError("no capture file".into()),
                });
            };

            // SAFETY: the flush lock makes this the only consumer of `wbuf`
            let (v1, v2) = unsafe { wbuf.read_vector() };
            let mut to_write = chunk.min(v1.len());
            let mut end_after_write = false;

            if destructive {
                let (end_here, outstanding) = self.apply_transitions(chan, sink.as_mut(), &mut to_write);
                end_after_write = end_here;
                if outstanding {
                    status = IoStatus::MoreWork;
                }
            }

            self.write_to_sink(sink.as_mut(), &v1[..to_write])?;
            let mut flushed = to_write;

            // the ring wrapped inside this chunk
            if !destructive && to_write == v1.len() && total > to_write && to_write < chunk {
                let extra = (chunk - to_write).min(v2.len());
                self.write_to_sink(sink.as_mut(), &v2[..extra])?;
                flushed += extra;
            }

            if end_after_write {
                sink.mark_capture_end();
            }
            wbuf.increment_read_ptr(flushed);
            chan.add_capture_count(flushed as SampleCnt);
        }

        if self.flush_midi(&mut fl, chunk, force, was_recording)? {
            status = IoStatus::MoreWork;
        }
        Ok(status)
    }

    /// Consume the capture transitions due within this write. Returns
    /// whether a capture end falls at the end of the (possibly shortened)
    /// write, and whether a transition is still outstanding.
    fn apply_transitions(
        &self,
        chan: &WriterChannel,
        sink: &mut dyn AudioCaptureSink,
        to_write: &mut usize,
    ) -> (bool, bool) {
        let transitions = chan.transitions();
        let mut t = [CaptureTransition::default()];
        let mut consumed = 0;
        let mut end_here = false;
        let mut outstanding = false;

        while transitions.read(&mut t, 1, false, consumed) == 1 {
            match t[0].kind {
                CaptureTransitionKind::CaptureStart => {
                    sink.mark_capture_start(t[0].capture_val);
                    chan.reset_capture_count();
                    consumed += 1;
                }
                CaptureTransitionKind::CaptureEnd => {
                    let remaining = (t[0].capture_val - chan.capture_count()).max(0) as usize;
                    if remaining <= *to_write {
                        if remaining < *to_write {
                            outstanding = true;
                        }
                        *to_write = remaining;
                        end_here = true;
                        consumed += 1;
                    } else {
                        outstanding = true;
                    }
                    break;
                }
            }
        }
        transitions.increment_read_ptr(consumed);
        (end_here, outstanding)
    }

    fn write_to_sink(&self, sink: &mut dyn AudioCaptureSink, data: &[rf_core::Sample]) -> DiskIoResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let written = sink.write(data).map_err(|source| DiskIoError::CaptureWrite {
            track: self.name.clone(),
            source,
        })?;
        if written != data.len() {
            return Err(DiskIoError::ShortWrite {
                track: self.name.clone(),
                wanted: data.len(),
                written,
            });
        }
        Ok(())
    }

    /// Hand captured MIDI up to one chunk of take time to the sink. Returns
    /// whether more than one chunk is still pending.
    fn flush_midi(&self, fl: &mut FlushState, chunk: usize, force: bool, was_recording: bool) -> DiskIoResult<bool> {
        let mut guard = self.midi_sink.lock();
        let Some(sink) = guard.as_mut() else {
            return Ok(false);
        };
        let chunk = chunk as SampleCnt;
        let pending = self.midi_captured.load(Ordering::Acquire) - fl.midi_flushed;
        if self.midi_buf.read_space() == 0 || (pending < chunk && !force && was_recording) {
            return Ok(false);
        }

        let end = if force {
            MAX_SAMPLEPOS
        } else {
            fl.midi_flushed + chunk.min(pending.max(0))
        };
        fl.midi.clear();
        self.midi_buf.drain_until(&mut fl.midi, end);
        fl.midi_flushed = if force {
            self.midi_captured.load(Ordering::Acquire)
        } else {
            end
        };

        let written = sink.write_events(&fl.midi).map_err(|source| DiskIoError::CaptureWrite {
            track: self.name.clone(),
            source,
        })?;
        if written != fl.midi.len() {
            return Err(DiskIoError::ShortWrite {
                track: self.name.clone(),
                wanted: fl.midi.len(),
                written,
            });
        }
        Ok(pending - chunk >= chunk)
    }

    /// Flush with `force` until everything buffered is on disk
    pub fn force_flush(&self) -> DiskIoResult<()> {
        while self.do_flush(true)?.more_work() {}
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Transport (non-RT)
    // ───────────────────────────────────────────────────────────────────────

    /// The transport stopped: finish the take. With `abort` the capture
    /// files are discarded; otherwise they are closed and turned into
    /// regions on the track's playlists. Returns `None` when nothing was
    /// captured or the take was discarded.
    pub fn transport_stopped(&self, abort: bool) -> DiskIoResult<Option<CapturedTake>> {
        {
            let mut st = self.capture.lock();
            self.finish_capture(&mut st);
            st.captured_loops = 0;
            st.lost_xruns = 0;
        }

        let flushed = self.force_flush().is_ok();
        if !flushed {
            log::warn!("{}: take {} lost unflushed data", self.name, self.take());
            self.discard_buffered();
        }

        let mut infos = {
            let mut fin = self.finished.lock();
            fin.collect();
            fin.pending_xruns.clear();
            std::mem::take(&mut fin.infos)
        };
        if !flushed && !self.destructive() {
            infos = self.trim_to_written(infos);
        }
        let take_length = self.reset_take_position();

        if infos.is_empty() {
            return Ok(None);
        }

        if abort {
            log::info!("{}: discarding take {}", self.name, self.take());
            for chan in self.channels.snapshot().iter() {
                if let Some(mut sink) = chan.sink().lock().take() {
                    sink.mark_for_remove();
                }
            }
            if let Some(mut sink) = self.midi_sink.lock().take() {
                sink.mark_for_remove();
            }
            self.reset_write_sources()?;
            return Ok(None);
        }

        let take = if self.destructive() {
            CapturedTake {
                captures: infos,
                ..CapturedTake::default()
            }
        } else {
            let mut take = self.build_audio_regions(infos)?;
            take.midi_region = self.build_midi_region(&take.captures, take_length)?;
            take
        };

        self.reset_write_sources()?;
        Ok(Some(take))
    }

    /// Shorten the passes to the material that reached the capture files;
    /// passes with nothing on disk are dropped
    fn trim_to_written(&self, infos: Vec<CaptureInfo>) -> Vec<CaptureInfo> {
        let written = self
            .channels
            .snapshot()
            .iter()
            .filter_map(|c| c.sink().lock().as_ref().map(|s| s.length()))
            .min()
            .unwrap_or(0);
        let mut offset: SampleCnt = 0;
        let mut kept = Vec::with_capacity(infos.len());
        for mut info in infos {
            let samples = info.samples.min((written - offset).max(0));
            offset += info.samples;
            if samples == 0 {
                continue;
            }
            info.samples = samples;
            kept.push(info);
        }
        kept
    }

    fn reset_take_position(&self) -> SampleCnt {
        let length = {
            let mut st = self.capture.lock();
            std::mem::take(&mut st.take_position)
        };
        self.midi_captured.store(0, Ordering::Release);
        self.flush.lock().midi_flushed = 0;
        self.midi_buf.reset();
        length
    }

    /// Close the capture files and place one region per pass
    fn build_audio_regions(&self, infos: Vec<CaptureInfo>) -> DiskIoResult<CapturedTake> {
        let chans = self.channels.snapshot();
        let first_start = infos[0].start;
        let mut sources: Vec<Arc<dyn AudioSource>> = Vec::with_capacity(chans.len());
        let mut take_name = None;

        for chan in chans.iter() {
            let mut guard = chan.sink().lock();
            let Some(sink) = guard.as_mut() else {
                continue;
            };
            sink.update_header(first_start)?;
            sink.mark_immutable()?;
            take_name.get_or_insert_with(|| sink.name().to_string());
            sources.push(sink.source()?);
        }

        if sources.is_empty() {
            return Ok(CapturedTake {
                captures: infos,
                ..CapturedTake::default()
            });
        }

        let name = take_name.unwrap_or_else(|| self.name.clone());
        let length = sources.iter().map(|s| s.length()).max().unwrap_or(0);
        let whole_file = AudioRegion::new(name.clone(), sources.clone(), 0, length, first_start);

        let preroll = self.preroll_trim.load(Ordering::Acquire);
        let playlist = self.playlist();
        let mut regions = Vec::with_capacity(infos.len());
        let mut buffer_position: SampleCnt = 0;

        for (i, info) in infos.iter().enumerate() {
            let mut region = AudioRegion::new(
                format!("{name}.{}", i + 1),
                sources.clone(),
                buffer_position,
                info.samples,
                info.start,
            );
            if i == 0 && preroll > 0 {
                let trim = preroll.min(info.samples);
                region.start += trim;
                region.length -= trim;
                region.position += trim;
            }
            if let Some(playlist) = &playlist {
                playlist.add_region(region.clone());
            }
            log::debug!(
                "{}: captured region {} at {} ({} samples)",
                self.name,
                region.name,
                region.position,
                region.length
            );
            regions.push(region);
            buffer_position += info.samples;
        }

        log::info!(
            "{}: take {} finished, {} pass(es), {} samples",
            self.name,
            self.take(),
            infos.len(),
            length
        );

        Ok(CapturedTake {
            whole_file: Some(whole_file),
            regions,
            midi_region: None,
            captures: infos,
        })
    }

    fn build_midi_region(&self, infos: &[CaptureInfo], length: SampleCnt) -> DiskIoResult<Option<MidiRegion>> {
        let mut guard = self.midi_sink.lock();
        let Some(sink) = guard.as_mut() else {
            return Ok(None);
        };
        if sink.event_count() == 0 {
            sink.mark_for_remove();
            return Ok(None);
        }

        let position = infos.first().map_or(0, |i| i.start);
        sink.commit(position, length)?;
        let region = MidiRegion {
            name: sink.name().to_string(),
            position,
            start: 0,
            length,
            events: sink.events(),
        };
        if let Some(playlist) = self.midi_playlist() {
            playlist.add_region(region.clone());
        }
        Ok(Some(region))
    }

    /// Discard buffered capture data; used on locate while stopped
    pub fn seek(&self, _sample: SamplePos) {
        self.discard_buffered();
    }

    fn discard_buffered(&self) {
        let _fl = self.flush.lock();
        for chan in self.channels.snapshot().iter() {
            chan.wbuf().reset();
            chan.transitions().reset();
        }
        self.midi_buf.reset();
    }

    /// Rebuild the capture rings at the configured size
    pub fn adjust_buffering(&self) {
        let _fl = self.flush.lock();
        let samples = self.ctx.config().capture_buffer_samples();
        self.channels.resize_all(samples, 0);
    }

    pub fn set_channel_count(&self, n_channels: usize) {
        let _fl = self.flush.lock();
        let samples = self.ctx.config().capture_buffer_samples();
        self.channels.set_count(n_channels, samples, 0);
    }
}

fn align_to_u8(style: AlignStyle) -> u8 {
    match style {
        AlignStyle::ExistingMaterial => 0,
        AlignStyle::CaptureTime => 1,
    }
}

fn align_from_u8(value: u8) -> AlignStyle {
    match value {
        1 => AlignStyle::CaptureTime,
        _ => AlignStyle::ExistingMaterial,
    }
}
