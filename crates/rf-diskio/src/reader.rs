//! Disk Reader - Playback Streaming
//!
//! Streams a track's playlists from disk to the process thread:
//! - The butler refills one ring buffer per channel ahead of the playhead
//! - The process thread consumes them in [`DiskReader::run`] without
//!   blocking, allocating or touching disk
//! - Declick ramps on start/stop, cubic varispeed, loop wrap with fades
//! - MIDI is read ahead into its own ring with monotonic timestamps
//!
//! Locking: `process` is held by the process thread for a cycle (try-lock
//! only) and by seek/overwrite for the whole repositioning; `refill` is the
//! butler's. Lock order is always `process` before `refill`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use rf_core::{
    Gain, Location, MAX_SAMPLEPOS, MidiBuffer, MidiEvent, NoteTracker, Range, Sample, SampleCnt,
    SamplePos, apply_gain_to_buffer, mix_buffers_no_gain,
};
use rf_file::{AudioPlaylist, MidiPlaylist};

use crate::channel::{ChannelList, ChannelSet, ReaderChannel};
use crate::config::LoopFadeMode;
use crate::context::DiskIoContext;
use crate::declick::{DeclickAmp, LoopDeclicker, LoopFadeTables, loop_fades};
use crate::error::{DiskIoError, DiskIoResult, IoStatus};
use crate::interpolation::CubicInterpolation;
use crate::midi_ring::MidiRingBuffer;
use crate::notify::DiskEvent;
use crate::process::{MonitorState, ProcessBuffers};
use crate::track::TrackId;
use crate::transport::TransportSnapshot;

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

const MIN_REFILL_BYTES: usize = 256 * 1024;
const MAX_REFILL_BYTES: usize = 4 * 1024 * 1024;
const REFILL_BYTE_ALIGN: usize = 16 * 1024;

/// A locate closer than `reserved / SEEK_SLACK_DIVISOR` keeps the buffered
/// material instead of refilling
const SEEK_SLACK_DIVISOR: usize = 6;

/// Extra input samples the cubic interpolator reads past a cycle
const INTERPOLATION_LOOKAHEAD: usize = 3;

/// Events one cycle of disk MIDI can carry before the rest are dropped
const MIDI_CYCLE_EVENTS: usize = 1024;

/// Samples to read in one refill pass: the free space measured in bytes,
/// clamped to [256 KiB, 4 MiB], rounded down to a 16 KiB multiple, and
/// never more than the free space itself.
pub fn refill_read_samples(total_space: usize, bytes_per_sample: usize) -> usize {
    let bps = bytes_per_sample.max(1);
    let bytes = total_space
        .saturating_mul(bps)
        .clamp(MIN_REFILL_BYTES, MAX_REFILL_BYTES);
    let bytes = bytes / REFILL_BYTE_ALIGN * REFILL_BYTE_ALIGN;
    total_space.min(bytes / bps)
}

// ═══════════════════════════════════════════════════════════════════════════
// REFILL SCRATCH
// ═══════════════════════════════════════════════════════════════════════════

/// Scratch space for playlist reads, owned by the thread doing the refill
/// (normally the butler) and shared by every track it services
#[derive(Default)]
pub struct RefillScratch {
    mixdown: Vec<Sample>,
    gain: Vec<Gain>,
    midi: Vec<MidiEvent>,
}

impl RefillScratch {
    pub fn new(samples: usize) -> Self {
        Self {
            mixdown: vec![0.0; samples],
            gain: vec![0.0; samples],
            midi: Vec::with_capacity(1024),
        }
    }

    fn ensure(&mut self, samples: usize) {
        if self.mixdown.len() < samples {
            self.mixdown.resize(samples, 0.0);
            self.gain.resize(samples, 0.0);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Owned by whoever holds the `process` lock
struct ProcessState {
    declick: DeclickAmp,
    /// Peek offset into the ring while fading out of a stop
    declick_offs: usize,
    interp: CubicInterpolation,
    max_speed: f64,
    disk: Vec<Sample>,
    vari_in: Vec<Sample>,
    midi: MidiBuffer,
    tracker: NoteTracker,
    /// Sounding notes must be turned off on the next cycle
    resolve_pending: bool,
    /// Unrolled MIDI read position
    midi_read_pos: SamplePos,
}

/// Owned by whoever holds the `refill` lock
struct RefillState {
    /// Timeline position of the next audio read
    file_sample: SamplePos,
    /// Timeline position of the next MIDI read
    midi_file_sample: SamplePos,
    /// Unrolled position up to which MIDI has been read
    midi_write_pos: SamplePos,
    last_read_reversed: Option<bool>,
    /// Loop start and length the pre-loop buffers were filled for
    pre_loop_for: Option<(SamplePos, usize)>,
}

// ═══════════════════════════════════════════════════════════════════════════
// DISK READER
// ═══════════════════════════════════════════════════════════════════════════

pub struct DiskReader {
    id: TrackId,
    name: String,
    ctx: Arc<DiskIoContext>,
    channels: ChannelSet<ReaderChannel>,
    playlist: Mutex<Option<Arc<dyn AudioPlaylist>>>,
    midi_playlist: Mutex<Option<Arc<dyn MidiPlaylist>>>,
    has_playlist: AtomicBool,
    has_midi_playlist: AtomicBool,
    midi_buf: MidiRingBuffer,
    playback_sample: AtomicI64,
    /// Unrolled MIDI positions, published for the need-butler check
    midi_read: AtomicI64,
    midi_written: AtomicI64,
    need_butler: AtomicBool,
    pending_overwrite: AtomicBool,
    /// Set by the first refill; underruns before that are expected
    initialized: AtomicBool,
    underruns: AtomicU64,
    process: Mutex<ProcessState>,
    refill: Mutex<RefillState>,
}

impl DiskReader {
    pub fn new(id: TrackId, name: impl Into<String>, n_channels: usize, ctx: Arc<DiskIoContext>) -> Self {
        let config = ctx.config();
        let channels = ChannelSet::new(ctx.trash().clone());
        channels.set_count(
            n_channels,
            config.playback_buffer_samples(),
            config.playback_reservation,
        );
        let scratch = config.varispeed_scratch_samples();

        Self {
            id,
            name: name.into(),
            channels,
            playlist: Mutex::new(None),
            midi_playlist: Mutex::new(None),
            has_playlist: AtomicBool::new(false),
            has_midi_playlist: AtomicBool::new(false),
            midi_buf: MidiRingBuffer::new(config.midi_ring_events),
            playback_sample: AtomicI64::new(0),
            midi_read: AtomicI64::new(0),
            midi_written: AtomicI64::new(0),
            need_butler: AtomicBool::new(false),
            pending_overwrite: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
            process: Mutex::new(ProcessState {
                declick: DeclickAmp::new(config.sample_rate),
                declick_offs: 0,
                interp: CubicInterpolation::new(n_channels),
                max_speed: config.max_speed.abs().max(1.0),
                disk: vec![0.0; config.max_block_size],
                vari_in: vec![0.0; scratch],
                midi: MidiBuffer::with_capacity(MIDI_CYCLE_EVENTS),
                tracker: NoteTracker::new(),
                resolve_pending: false,
                midi_read_pos: 0,
            }),
            refill: Mutex::new(RefillState {
                file_sample: 0,
                midi_file_sample: 0,
                midi_write_pos: 0,
                last_read_reversed: None,
                pre_loop_for: None,
            }),
            ctx,
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Accessors
    // ───────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// Current channel list
    pub fn channels(&self) -> ChannelList<ReaderChannel> {
        self.channels.snapshot()
    }

    /// Timeline position of the next sample the process thread will play
    pub fn playback_sample(&self) -> SamplePos {
        self.playback_sample.load(Ordering::Acquire)
    }

    /// Timeline position of the next sample the butler will read
    pub fn file_sample(&self) -> SamplePos {
        self.refill.lock().file_sample
    }

    /// Whether the last cycle left room for a refill
    pub fn need_butler(&self) -> bool {
        self.need_butler.load(Ordering::Acquire)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn pending_overwrite(&self) -> bool {
        self.pending_overwrite.load(Ordering::Acquire)
    }

    /// Ask for the buffered material to be re-read (after a playlist edit)
    pub fn set_pending_overwrite(&self) {
        self.pending_overwrite.store(true, Ordering::Release);
    }

    /// Fill level of the playback buffer in `[0, 1]`; 1 without channels
    pub fn buffer_load(&self) -> f32 {
        let chans = self.channels.reader();
        chans.first().map_or(1.0, |c| {
            c.rbuf().read_space() as f32 / c.rbuf().capacity().saturating_sub(1).max(1) as f32
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // Configuration (non-RT)
    // ───────────────────────────────────────────────────────────────────────

    pub fn set_playlist(&self, playlist: Option<Arc<dyn AudioPlaylist>>) {
        self.has_playlist
            .store(playlist.is_some(), Ordering::Release);
        *self.playlist.lock() = playlist;
        self.refill.lock().pre_loop_for = None;
        self.set_pending_overwrite();
    }

    pub fn playlist(&self) -> Option<Arc<dyn AudioPlaylist>> {
        self.playlist.lock().clone()
    }

    pub fn set_midi_playlist(&self, playlist: Option<Arc<dyn MidiPlaylist>>) {
        self.has_midi_playlist
            .store(playlist.is_some(), Ordering::Release);
        *self.midi_playlist.lock() = playlist;
        self.set_pending_overwrite();
    }

    pub fn midi_playlist(&self) -> Option<Arc<dyn MidiPlaylist>> {
        self.midi_playlist.lock().clone()
    }

    /// Add or remove channels. New channels start silent and aligned with
    /// the existing ones; an overwrite fills them.
    pub fn set_channel_count(&self, n_channels: usize) {
        let config = self.ctx.config();
        let mut st = self.process.lock();
        self.channels.set_count(
            n_channels,
            config.playback_buffer_samples(),
            config.playback_reservation,
        );
        st.interp.set_channels(n_channels);
        self.set_pending_overwrite();
    }

    /// Resize every ring buffer to the configured buffering and refill from
    /// the current playback position
    pub fn adjust_buffering(&self, scratch: &mut RefillScratch) -> DiskIoResult<()> {
        let config = self.ctx.config();
        let mut st = self.process.lock();
        let mut rf = self.refill.lock();

        self.channels
            .resize_all(config.playback_buffer_samples(), config.playback_reservation);
        st.disk.resize(config.max_block_size, 0.0);
        st.vari_in
            .resize(config.varispeed_scratch_samples(), 0.0);
        st.max_speed = config.max_speed.abs().max(1.0);
        rf.pre_loop_for = None;

        let pos = self.playback_sample();
        self.seek_locked(&mut st, &mut rf, pos, true, true, scratch)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Process thread
    // ───────────────────────────────────────────────────────────────────────

    /// Deliver one cycle of disk material into `bufs`.
    ///
    /// `start` is the transport position of the cycle. With input monitoring
    /// the disk signal is mixed into the input already in `bufs`; otherwise
    /// it replaces it. When `result_required` is false the buffers are only
    /// advanced.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        bufs: &mut ProcessBuffers<'_>,
        start: SamplePos,
        speed: f64,
        nframes: usize,
        ms: MonitorState,
        result_required: bool,
        transport: &TransportSnapshot,
    ) {
        let Some(mut guard) = self.process.try_lock() else {
            // repositioning in progress
            if ms == MonitorState::Disk {
                bufs.silence(nframes);
            }
            return;
        };
        let st = &mut *guard;
        self.need_butler.store(false, Ordering::Relaxed);

        let nframes = nframes.min(st.disk.len());
        let speed = speed.clamp(-st.max_speed, st.max_speed);
        let stopping = speed == 0.0;
        let target_gain: Gain = if stopping || !ms.disk() { 0.0 } else { 1.0 };

        if stopping && st.declick.gain() == 0.0 {
            st.declick_offs = 0;
            if ms == MonitorState::Disk {
                bufs.silence(nframes);
            }
            if st.tracker.on() > 0 {
                st.tracker.resolve(bufs.midi, 0);
            }
            return;
        }

        let chans = self.channels.reader();
        let has_audio = self.has_playlist.load(Ordering::Acquire) && !chans.is_empty();
        let has_midi = self.has_midi_playlist.load(Ordering::Acquire);
        // loops only apply when rolling forward
        let loop_range = transport.loop_range.filter(|_| speed > 0.0);
        let mut playback = self.playback_sample();

        if !stopping {
            let (target, current) = match loop_range {
                Some(loc) => {
                    let r = Range::from_location(&loc);
                    (r.squish(start), r.squish(playback))
                }
                None => (start, playback),
            };
            playback = current;
            if target != current {
                let distance = target - current;
                let reversed = speed < 0.0;
                if self.can_internal_seek(&chans, distance, reversed) {
                    self.internal_seek_locked(st, &chans, distance, reversed);
                    playback = target;
                }
            }
        }

        let disk_samples = if stopping || speed.abs() == 1.0 {
            nframes
        } else {
            st.interp.set_speed(speed);
            st.interp.distance(nframes)
        };

        if has_audio {
            if !stopping {
                let available = chans
                    .iter()
                    .map(|c| c.rbuf().read_space())
                    .min()
                    .unwrap_or(0);
                if available < disk_samples {
                    self.underrun(bufs, nframes, ms);
                    return;
                }
            }

            let declicking = st.declick.gain() != target_gain;
            if result_required && (ms.disk() || declicking) {
                self.render_audio(st, &chans, bufs, nframes, disk_samples, speed, ms, target_gain);
            } else {
                if !stopping {
                    for c in chans.iter() {
                        c.rbuf().increment_read_ptr(disk_samples);
                    }
                }
                st.declick.set_gain(target_gain);
            }
        } else {
            if ms == MonitorState::Disk {
                bufs.silence_audio(nframes);
            }
            st.declick.set_gain(target_gain);
        }

        let cycle_start = playback;
        if !stopping {
            playback = if speed < 0.0 {
                playback - disk_samples as SampleCnt
            } else {
                playback + disk_samples as SampleCnt
            };
            if let Some(loc) = loop_range {
                playback = Range::from_location(&loc).squish(playback);
            }
            self.playback_sample.store(playback, Ordering::Release);
        }

        if has_midi && speed > 0.0 {
            if result_required && ms.disk() {
                self.render_midi(st, bufs, cycle_start, disk_samples, nframes, ms, loop_range);
            } else {
                st.midi_read_pos += disk_samples as SampleCnt;
                self.midi_buf.skip_to(st.midi_read_pos);
                self.midi_read
                    .store(st.midi_read_pos, Ordering::Release);
            }
        }

        let mut need = false;
        if has_audio {
            let rbuf = chans[0].rbuf();
            let ws = rbuf.write_space();
            need = if transport.slaved {
                ws >= rbuf.capacity() / 2
            } else {
                ws >= self.ctx.read_chunk()
            };
        }
        if has_midi {
            let written = self.midi_written.load(Ordering::Acquire);
            let read = self.midi_read.load(Ordering::Acquire);
            if read > written
                || (written - read) + (disk_samples as SampleCnt) < self.ctx.midi_readahead()
            {
                need = true;
            }
        }
        self.need_butler.store(need, Ordering::Release);
    }

    fn underrun(&self, bufs: &mut ProcessBuffers<'_>, nframes: usize, ms: MonitorState) {
        if self.initialized.load(Ordering::Acquire) {
            self.underruns.fetch_add(1, Ordering::Relaxed);
            self.ctx
                .events()
                .send(DiskEvent::Underrun { track: self.id });
        }
        if ms == MonitorState::Disk {
            bufs.silence_audio(nframes);
        }
        self.need_butler.store(true, Ordering::Release);
    }

    #[allow(clippy::too_many_arguments)]
    fn render_audio(
        &self,
        st: &mut ProcessState,
        chans: &[Arc<ReaderChannel>],
        bufs: &mut ProcessBuffers<'_>,
        nframes: usize,
        disk_samples: usize,
        speed: f64,
        ms: MonitorState,
        target_gain: Gain,
    ) {
        let stopping = speed == 0.0;
        let n_buffers = bufs.n_audio();
        if n_buffers == 0 {
            if !stopping {
                for c in chans {
                    c.rbuf().increment_read_ptr(disk_samples);
                }
            }
            st.declick.set_gain(target_gain);
            return;
        }

        let n_chans = chans.len();
        let scaling: Gain = if n_chans > n_buffers {
            n_buffers as Gain / n_chans as Gain
        } else {
            1.0
        };
        let varispeed = !stopping && speed.abs() != 1.0;
        let initial = st.declick;
        let mut last = initial;

        let ProcessState {
            disk,
            vari_in,
            interp,
            declick_offs,
            ..
        } = st;

        for (n, chan) in chans.iter().enumerate() {
            let rbuf = chan.rbuf();
            let out = &mut disk[..nframes];

            if stopping {
                let got = rbuf.read(out, nframes, false, *declick_offs);
                out[got..].fill(0.0);
            } else if varispeed {
                let want = (disk_samples + INTERPOLATION_LOOKAHEAD).min(vari_in.len());
                let input = &mut vari_in[..want];
                let got = rbuf.read(input, want, false, 0);
                input[got..].fill(0.0);
                interp.interpolate(n, input, out);
                rbuf.increment_read_ptr(disk_samples);
            } else {
                let got = rbuf.read(out, nframes, true, 0);
                out[got..].fill(0.0);
            }

            // every channel ramps from the same starting gain
            let mut amp = initial;
            amp.apply_gain(out, target_gain);
            last = amp;

            if scaling != 1.0 {
                apply_gain_to_buffer(out, scaling);
            }

            let dst = &mut bufs.audio[n % n_buffers][..nframes];
            if ms.input() || !ms.disk() || n >= n_buffers {
                mix_buffers_no_gain(dst, out);
            } else {
                dst.copy_from_slice(out);
            }
        }

        st.declick = last;
        if stopping {
            st.declick_offs += nframes;
        } else {
            st.declick_offs = 0;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn render_midi(
        &self,
        st: &mut ProcessState,
        bufs: &mut ProcessBuffers<'_>,
        cycle_start: SamplePos,
        distance: usize,
        nframes: usize,
        ms: MonitorState,
        loop_range: Option<Location>,
    ) {
        let ProcessState {
            midi,
            tracker,
            resolve_pending,
            midi_read_pos,
            ..
        } = st;

        let dst: &mut MidiBuffer = if ms.input() {
            midi.clear();
            midi
        } else {
            bufs.midi.clear();
            &mut *bufs.midi
        };

        if *resolve_pending {
            tracker.resolve(dst, 0);
            *resolve_pending = false;
        }

        let pos = *midi_read_pos;
        let d = distance as SampleCnt;
        match loop_range {
            Some(loc) if cycle_start < loc.end && cycle_start + d > loc.end => {
                let first = loc.end - cycle_start;
                self.midi_buf
                    .read(dst, pos, pos + first, 0, tracker);
                // nothing may sound across the wrap
                tracker.resolve(dst, first);
                self.midi_buf
                    .read(dst, pos + first, pos + d, first, tracker);
            }
            _ => {
                self.midi_buf.read(dst, pos, pos + d, 0, tracker);
            }
        }
        *midi_read_pos = pos + d;
        self.midi_read.store(pos + d, Ordering::Release);

        if distance != nframes && distance > 0 {
            let ratio = nframes as f64 / distance as f64;
            let last = nframes.saturating_sub(1) as SamplePos;
            for ev in dst.iter_mut() {
                *ev = ev.with_time(((ev.time as f64 * ratio) as SamplePos).min(last));
            }
        }

        if ms.input() {
            bufs.midi.merge_from(midi);
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Seeking
    // ───────────────────────────────────────────────────────────────────────

    /// `distance` is on the timeline; reverse play stores the ring in
    /// reverse timeline order, so the ring moves the other way
    fn can_internal_seek(&self, chans: &[Arc<ReaderChannel>], distance: SampleCnt, reversed: bool) -> bool {
        let ring_distance = if reversed { -distance } else { distance };
        if !chans.iter().all(|c| c.rbuf().can_seek(ring_distance)) {
            return false;
        }
        if reversed || !self.has_midi_playlist.load(Ordering::Acquire) {
            // MIDI only plays forward
            return true;
        }
        // MIDI has no history: it can only skip forward through what is buffered
        let buffered =
            self.midi_written.load(Ordering::Acquire) - self.midi_read.load(Ordering::Acquire);
        distance >= 0 && buffered >= distance
    }

    /// Whether the playhead can move by `distance` using buffered material
    pub fn can_internal_playback_seek(&self, distance: SampleCnt) -> bool {
        let chans = self.channels.reader();
        let reversed = self.ctx.transport().speed() < 0.0;
        self.can_internal_seek(&chans, distance, reversed)
    }

    /// Move the ring read pointers by the timeline `distance`; the caller
    /// updates `playback_sample`
    fn internal_seek_locked(
        &self,
        st: &mut ProcessState,
        chans: &[Arc<ReaderChannel>],
        distance: SampleCnt,
        reversed: bool,
    ) {
        let ring_distance = if reversed { -distance } else { distance };
        for c in chans {
            if ring_distance > 0 {
                c.rbuf().increment_read_ptr(ring_distance as usize);
            } else if ring_distance < 0 {
                c.rbuf()
                    .decrement_read_ptr(ring_distance.unsigned_abs() as usize);
            }
        }
        if !reversed && distance > 0 && self.has_midi_playlist.load(Ordering::Acquire) {
            st.midi_read_pos += distance;
            self.midi_buf.skip_to(st.midi_read_pos);
            self.midi_read
                .store(st.midi_read_pos, Ordering::Release);
        }
    }

    /// Reposition the playhead to `sample`.
    ///
    /// Uses buffered material when it can; otherwise empties the buffers and
    /// refills from slightly before `sample`, so the new position starts with
    /// rewind history. `complete_refill` keeps reading until the buffers are
    /// full. Blocks the process thread (it plays silence) until done.
    pub fn seek(&self, sample: SamplePos, complete_refill: bool, scratch: &mut RefillScratch) -> DiskIoResult<()> {
        let mut st = self.process.lock();
        let mut rf = self.refill.lock();
        self.seek_locked(&mut st, &mut rf, sample, complete_refill, false, scratch)
    }

    /// Re-read everything buffered from the current playback position, for
    /// when the playlist changed under it
    pub fn overwrite_existing_buffers(&self, scratch: &mut RefillScratch) -> DiskIoResult<()> {
        let mut st = self.process.lock();
        let mut rf = self.refill.lock();
        rf.pre_loop_for = None;
        let pos = self.playback_sample();
        log::debug!("{}: overwriting buffers from {}", self.name, pos);
        self.seek_locked(&mut st, &mut rf, pos, true, true, scratch)
    }

    fn seek_locked(
        &self,
        st: &mut ProcessState,
        rf: &mut RefillState,
        sample: SamplePos,
        complete_refill: bool,
        force: bool,
        scratch: &mut RefillScratch,
    ) -> DiskIoResult<()> {
        let chans = self.channels.snapshot();
        let reversed = self.ctx.transport().speed() < 0.0;
        let playback = self.playback_sample();
        let same_direction = rf.last_read_reversed.is_none_or(|r| r == reversed);

        if !force
            && !self.pending_overwrite()
            && same_direction
            && self.initialized.load(Ordering::Acquire)
        {
            if sample == playback {
                return Ok(());
            }
            let distance = sample - playback;
            if self.can_internal_seek(&chans, distance, reversed) {
                self.internal_seek_locked(st, &chans, distance, reversed);
                self.playback_sample.store(sample, Ordering::Release);
                return Ok(());
            }
            let reserved = chans
                .iter()
                .map(|c| c.rbuf().reserved_size())
                .min()
                .unwrap_or(0);
            if (distance.unsigned_abs() as usize) < reserved / SEEK_SLACK_DIVISOR {
                return Ok(());
            }
        }

        for c in chans.iter() {
            c.rbuf().reset();
        }
        self.midi_buf.reset();
        if st.tracker.on() > 0 {
            st.resolve_pending = true;
        }
        st.interp.reset();
        st.declick_offs = 0;

        let midi_start = match self.ctx.transport().loop_range() {
            Some(loc) if !reversed => Range::from_location(&loc).squish(sample),
            _ => sample,
        };
        st.midi_read_pos = sample;
        rf.midi_write_pos = sample;
        rf.midi_file_sample = midi_start;
        self.midi_read.store(sample, Ordering::Release);
        self.midi_written.store(sample, Ordering::Release);

        let shift = if reversed {
            0
        } else {
            let reservation = chans
                .first()
                .map_or(0, |c| c.rbuf().reservation_size());
            (reservation as SampleCnt).min(sample.max(0))
        };
        rf.file_sample = sample - shift;
        rf.last_read_reversed = Some(reversed);
        self.playback_sample
            .store(sample - shift, Ordering::Release);
        self.pending_overwrite.store(false, Ordering::Release);

        let mut status = self.refill_audio(rf, scratch)?;
        while complete_refill && status.more_work() {
            status = self.refill_audio(rf, scratch)?;
        }
        self.refill_midi(rf, scratch)?;

        if shift > 0 {
            for c in chans.iter() {
                c.rbuf().increment_read_ptr(shift as usize);
            }
        }
        self.playback_sample.store(sample, Ordering::Release);
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Refill (butler)
    // ───────────────────────────────────────────────────────────────────────

    /// One refill pass for audio and MIDI. `MoreWork` means more than a
    /// chunk of space is still free after this pass.
    pub fn do_refill(&self, scratch: &mut RefillScratch) -> DiskIoResult<IoStatus> {
        let mut rf = self.refill.lock();
        let result = self
            .refill_audio(&mut rf, scratch)
            .and_then(|status| self.refill_midi(&mut rf, scratch).map(|_| status));
        result.inspect_err(|e| {
            log::error!("{}: refill failed: {}", self.name, e);
            self.ctx
                .events()
                .send(DiskEvent::ReadError { track: self.id });
        })
    }

    fn refill_audio(&self, rf: &mut RefillState, scratch: &mut RefillScratch) -> DiskIoResult<IoStatus> {
        let chans = self.channels.snapshot();
        let Some(playlist) = self.playlist.lock().clone() else {
            return Ok(IoStatus::Done);
        };
        if chans.is_empty() {
            return Ok(IoStatus::Done);
        }

        let transport = self.ctx.transport();
        let speed = transport.speed();
        let reversed = speed < 0.0;
        let chunk = self.ctx.read_chunk();
        let first = chans[0].rbuf();

        let mut total_space = first.write_space();
        if total_space == 0 {
            return Ok(IoStatus::Done);
        }
        if transport.slaved() && total_space < first.capacity() / 2 {
            return Ok(IoStatus::Done);
        }
        // at non-unity speed the process thread may drain faster than the
        // butler wakes, so take whatever space there is
        if total_space < chunk && (speed == 0.0 || speed.abs() == 1.0) {
            return Ok(IoStatus::Done);
        }
        if rf.last_read_reversed.is_some_and(|r| r != reversed) {
            // direction changed: only a locate can make the buffer coherent
            return Ok(IoStatus::Done);
        }

        let ffa = rf.file_sample;
        let mut zero_fill = 0;
        if reversed {
            if ffa <= 0 {
                for c in chans.iter() {
                    c.rbuf().write_zero(total_space);
                }
                return Ok(IoStatus::Done);
            }
            if (ffa as usize) < total_space {
                zero_fill = total_space - ffa as usize;
                total_space = ffa as usize;
            }
        } else {
            if ffa >= MAX_SAMPLEPOS {
                for c in chans.iter() {
                    c.rbuf().write_zero(total_space);
                }
                return Ok(IoStatus::Done);
            }
            let room = (MAX_SAMPLEPOS - ffa) as usize;
            if room < total_space {
                zero_fill = total_space - room;
                total_space = room;
            }
        }

        let bytes_per_sample = (self.ctx.config().native_sample_bits / 8) as usize;
        let samples_to_read = refill_read_samples(total_space, bytes_per_sample);
        scratch.ensure(samples_to_read);

        let loop_range = if reversed { None } else { transport.loop_range() };
        let fades = loop_fades().filter(|t| t.mode() != LoopFadeMode::NoFade);
        if let (Some(loc), Some(tables)) = (loop_range, fades.as_deref()) {
            if tables.mode() == LoopFadeMode::Crossfade {
                self.prepare_pre_loop(rf, &chans, playlist.as_ref(), scratch, &loc, tables)?;
            }
        }

        let mut next = ffa;
        for (n, chan) in chans.iter().enumerate() {
            let rbuf = chan.rbuf();
            let pre_loop = chan.pre_loop().lock();
            let mut pos = ffa;
            // SAFETY: the refill lock makes this the only producer; both
            // slices are dropped before the write pointer moves
            let (v1, v2) = unsafe { rbuf.write_vector() };
            let len1 = v1.len().min(samples_to_read);
            let len2 = v2.len().min(samples_to_read - len1);
            let io = ReadIo {
                playlist: playlist.as_ref(),
                channel: n,
                reversed,
                loop_range,
                fades: fades.as_deref(),
                pre_loop: &pre_loop,
            };
            self.audio_read(&io, &mut v1[..len1], scratch, &mut pos)?;
            if len2 > 0 {
                self.audio_read(&io, &mut v2[..len2], scratch, &mut pos)?;
            }
            rbuf.increment_write_ptr(len1 + len2);
            if zero_fill > 0 && samples_to_read == total_space {
                rbuf.write_zero(zero_fill);
            }
            next = pos;
        }

        rf.file_sample = next;
        rf.last_read_reversed = Some(reversed);
        self.initialized.store(true, Ordering::Release);

        if total_space - samples_to_read > chunk {
            Ok(IoStatus::MoreWork)
        } else {
            Ok(IoStatus::Done)
        }
    }

    /// Read `buf.len()` samples of one channel starting at `*start`,
    /// wrapping at the loop end and applying loop fades. Reverse reads end
    /// up in playback order. Advances `*start` in the read direction.
    fn audio_read(
        &self,
        io: &ReadIo<'_>,
        buf: &mut [Sample],
        scratch: &mut RefillScratch,
        start: &mut SamplePos,
    ) -> DiskIoResult<()> {
        let cnt = buf.len();
        if cnt == 0 {
            return Ok(());
        }

        if io.reversed {
            *start -= cnt as SampleCnt;
        } else if let Some(loc) = io.loop_range {
            if *start >= loc.end {
                *start = Range::from_location(&loc).squish(*start);
            }
        }

        let mut pos = *start;
        let mut offset = 0;
        while offset < cnt {
            let mut this_read = cnt - offset;
            let mut reloop = false;
            if let Some(loc) = io.loop_range {
                if pos < loc.end && loc.end - pos <= this_read as SampleCnt {
                    this_read = (loc.end - pos) as usize;
                    reloop = true;
                }
            }

            let dst = &mut buf[offset..offset + this_read];
            let got = io
                .playlist
                .read(
                    dst,
                    &mut scratch.mixdown[..this_read],
                    &mut scratch.gain[..this_read],
                    pos,
                    this_read as SampleCnt,
                    io.channel,
                )
                .map_err(|source| DiskIoError::PlaylistRead {
                    track: self.name.clone(),
                    count: this_read as SampleCnt,
                    position: pos,
                    source,
                })?;
            if got != this_read as SampleCnt {
                return Err(DiskIoError::ShortRead {
                    track: self.name.clone(),
                    wanted: this_read as SampleCnt,
                    got,
                    position: pos,
                });
            }

            if let (Some(loc), Some(tables)) = (io.loop_range, io.fades) {
                apply_loop_fades(dst, pos, pos + this_read as SampleCnt, &loc, tables, io.pre_loop);
            }

            pos = match io.loop_range {
                Some(loc) if reloop => loc.start,
                _ => pos + this_read as SampleCnt,
            };
            offset += this_read;
        }

        if io.reversed {
            buf.reverse();
        } else {
            *start = pos;
        }
        Ok(())
    }

    /// Fill each channel's pre-loop buffer with the material leading into
    /// the loop start, padded with silence near the session start
    fn prepare_pre_loop(
        &self,
        rf: &mut RefillState,
        chans: &[Arc<ReaderChannel>],
        playlist: &dyn AudioPlaylist,
        scratch: &mut RefillScratch,
        loc: &Location,
        tables: &LoopFadeTables,
    ) -> DiskIoResult<()> {
        let len = tables.crossfade_length();
        let current = rf.pre_loop_for == Some((loc.start, len))
            && chans.iter().all(|c| c.pre_loop().lock().len() == len);
        if current {
            return Ok(());
        }

        scratch.ensure(len);
        let avail = loc.start.clamp(0, len as SamplePos) as usize;
        for (n, chan) in chans.iter().enumerate() {
            let mut pre = chan.pre_loop().lock();
            pre.clear();
            pre.resize(len, 0.0);
            if avail == 0 {
                continue;
            }
            let from = loc.start - avail as SamplePos;
            playlist
                .read(
                    &mut pre[len - avail..],
                    &mut scratch.mixdown[..avail],
                    &mut scratch.gain[..avail],
                    from,
                    avail as SampleCnt,
                    n,
                )
                .map_err(|source| DiskIoError::PlaylistRead {
                    track: self.name.clone(),
                    count: avail as SampleCnt,
                    position: from,
                    source,
                })?;
        }
        rf.pre_loop_for = Some((loc.start, len));
        Ok(())
    }

    fn refill_midi(&self, rf: &mut RefillState, scratch: &mut RefillScratch) -> DiskIoResult<()> {
        let Some(playlist) = self.midi_playlist.lock().clone() else {
            return Ok(());
        };
        let transport = self.ctx.transport();
        if transport.speed() < 0.0 {
            return Ok(());
        }
        let loop_range = transport.loop_range();
        let squish = |pos: SamplePos| match loop_range {
            Some(loc) => Range::from_location(&loc).squish(pos),
            None => pos,
        };

        let read = self.midi_read.load(Ordering::Acquire);
        if rf.midi_write_pos < read {
            // the process thread ran past the read-ahead; skip the gap
            rf.midi_file_sample = squish(rf.midi_file_sample + (read - rf.midi_write_pos));
            rf.midi_write_pos = read;
        }

        let buffered = rf.midi_write_pos - read;
        let mut to_read = self.ctx.midi_readahead() - buffered;
        if to_read <= 0 || self.midi_buf.write_space() == 0 {
            self.midi_written
                .store(rf.midi_write_pos, Ordering::Release);
            return Ok(());
        }

        while to_read > 0 {
            let pos = rf.midi_file_sample;
            let mut seg = to_read;
            if let Some(loc) = loop_range {
                if pos < loc.end {
                    seg = seg.min(loc.end - pos);
                }
            }

            scratch.midi.clear();
            playlist
                .read(&mut scratch.midi, pos, seg)
                .map_err(|source| DiskIoError::PlaylistRead {
                    track: self.name.clone(),
                    count: seg,
                    position: pos,
                    source,
                })?;
            for ev in &scratch.midi {
                let unrolled = rf.midi_write_pos + (ev.time - pos);
                if !self.midi_buf.write(ev.with_time(unrolled)) {
                    log::warn!("{}: MIDI read-ahead buffer full, dropping events", self.name);
                    break;
                }
            }

            rf.midi_write_pos += seg;
            rf.midi_file_sample = pos + seg;
            if let Some(loc) = loop_range {
                if rf.midi_file_sample >= loc.end {
                    rf.midi_file_sample = loc.start;
                }
            }
            to_read -= seg;
        }

        self.midi_written
            .store(rf.midi_write_pos, Ordering::Release);
        Ok(())
    }
}

/// Per-channel parameters of one refill read
struct ReadIo<'a> {
    playlist: &'a dyn AudioPlaylist,
    channel: usize,
    reversed: bool,
    loop_range: Option<Location>,
    fades: Option<&'a LoopFadeTables>,
    pre_loop: &'a [Sample],
}

fn apply_loop_fades(
    buf: &mut [Sample],
    read_start: SamplePos,
    read_end: SamplePos,
    loc: &Location,
    tables: &LoopFadeTables,
    pre_loop: &[Sample],
) {
    let fade_out = LoopDeclicker::fade_out(loc, tables);
    match tables.mode() {
        LoopFadeMode::NoFade => {}
        LoopFadeMode::EndFade => fade_out.run(buf, read_start, read_end, tables.fade_out()),
        LoopFadeMode::BothFades => {
            LoopDeclicker::fade_in(loc, tables).run(buf, read_start, read_end, tables.fade_in());
            fade_out.run(buf, read_start, read_end, tables.fade_out());
        }
        LoopFadeMode::Crossfade => {
            if pre_loop.len() >= tables.crossfade_length() {
                fade_out.crossfade(buf, read_start, read_end, tables, pre_loop);
            } else {
                fade_out.run(buf, read_start, read_end, tables.fade_out());
            }
        }
    }
}
