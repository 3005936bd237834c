//! Session Glue
//!
//! [`DiskSession`] owns the track list and queues transport work for the
//! butler; [`DiskEngine`] ties session, butler and transport together and
//! provides the process-thread entry point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicI64, AtomicU8, AtomicU32, Ordering};

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rf_core::SamplePos;
use rf_file::CaptureSinkFactory;

use crate::butler::{Butler, ButlerHost};
use crate::config::DiskIoConfig;
use crate::context::DiskIoContext;
use crate::declick::init_loop_fades;
use crate::error::DiskIoResult;
use crate::notify::{DiskEvent, event_channel};
use crate::process::TrackIo;
use crate::reader::{RefillScratch, refill_read_samples};
use crate::track::{DiskTrack, TrackId};
use crate::transport::{RecordStatus, TransportState};
use crate::trash::TrashQueue;
use crate::writer::CapturedTake;

const TRASH_QUEUE_SIZE: usize = 256;

const STOP_NONE: u8 = 0;
const STOP_KEEP: u8 = 1;
const STOP_ABORT: u8 = 2;

// ═══════════════════════════════════════════════════════════════════════════
// TRACK LIST
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct TrackList {
    tracks: Vec<Arc<DiskTrack>>,
    auditioner: Option<Arc<DiskTrack>>,
}

impl TrackList {
    /// Tracks followed by the auditioner
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DiskTrack>> {
        self.tracks.iter().chain(self.auditioner.iter())
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SESSION
// ═══════════════════════════════════════════════════════════════════════════

pub struct DiskSession {
    ctx: Arc<DiskIoContext>,
    tracks: RwLock<TrackList>,
    next_id: AtomicU32,
    // transport work, requested from any thread and serviced by the butler
    locate_pending: AtomicBool,
    locate_target: AtomicI64,
    overwrite_pending: AtomicBool,
    stop_pending: AtomicU8,
    buffering_pending: AtomicBool,
    stop_requested: AtomicBool,
    takes: Mutex<Vec<(TrackId, CapturedTake)>>,
}

impl DiskSession {
    pub fn new(ctx: Arc<DiskIoContext>) -> Self {
        Self {
            ctx,
            tracks: RwLock::new(TrackList::default()),
            next_id: AtomicU32::new(1),
            locate_pending: AtomicBool::new(false),
            locate_target: AtomicI64::new(0),
            overwrite_pending: AtomicBool::new(false),
            stop_pending: AtomicU8::new(STOP_NONE),
            buffering_pending: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            takes: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<DiskIoContext> {
        &self.ctx
    }

    pub fn add_track(&self, name: impl Into<String>, n_channels: usize) -> Arc<DiskTrack> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let track = Arc::new(DiskTrack::new(id, name, n_channels, self.ctx.clone()));
        self.tracks.write().tracks.push(track.clone());
        log::debug!("Added track {} ({} channels)", track.name(), n_channels);
        track
    }

    pub fn remove_track(&self, id: TrackId) -> bool {
        let removed = {
            let mut list = self.tracks.write();
            list.tracks
                .iter()
                .position(|t| t.id() == id)
                .map(|idx| list.tracks.remove(idx))
        };
        match removed {
            Some(track) => {
                self.ctx.trash().push(track);
                true
            }
            None => false,
        }
    }

    pub fn track(&self, id: TrackId) -> Option<Arc<DiskTrack>> {
        self.tracks.read().iter().find(|t| t.id() == id).cloned()
    }

    /// Preview track, serviced like the others but never part of the list
    pub fn set_auditioner(&self, track: Option<Arc<DiskTrack>>) {
        let old = std::mem::replace(&mut self.tracks.write().auditioner, track);
        if let Some(old) = old {
            self.ctx.trash().push(old);
        }
    }

    /// Non-blocking view for the process thread
    pub fn try_tracks(&self) -> Option<RwLockReadGuard<'_, TrackList>> {
        self.tracks.try_read()
    }

    pub fn all_tracks(&self) -> Vec<Arc<DiskTrack>> {
        self.tracks.read().iter().cloned().collect()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Transport work requests (lock-free)
    // ───────────────────────────────────────────────────────────────────────

    pub fn request_locate(&self, sample: SamplePos) {
        self.ctx.transport().set_transport_sample(sample);
        self.locate_target.store(sample, Ordering::Release);
        self.locate_pending.store(true, Ordering::Release);
    }

    /// Refill the tracks whose reader has a pending overwrite
    pub fn request_overwrite(&self) {
        self.overwrite_pending.store(true, Ordering::Release);
    }

    /// Finish the takes of every track; `abort` discards them
    pub fn request_stop(&self, abort: bool) {
        let kind = if abort { STOP_ABORT } else { STOP_KEEP };
        self.stop_pending.fetch_max(kind, Ordering::AcqRel);
    }

    pub fn request_buffering_change(&self) {
        self.buffering_pending.store(true, Ordering::Release);
    }

    /// Whether the butler asked for a transport stop since the last call
    pub fn take_stop_request(&self) -> bool {
        self.stop_requested.swap(false, Ordering::AcqRel)
    }

    /// Takes finished by transport stops since the last call
    pub fn take_captured(&self) -> Vec<(TrackId, CapturedTake)> {
        std::mem::take(&mut *self.takes.lock())
    }

    fn non_realtime_stop(&self, abort: bool, tracks: &[Arc<DiskTrack>]) {
        log::debug!("Transport stop{}", if abort { " (abort)" } else { "" });
        for track in tracks {
            match track.writer().transport_stopped(abort) {
                Ok(Some(take)) => {
                    if !take.regions.is_empty() || take.midi_region.is_some() {
                        track.reader().set_pending_overwrite();
                        self.overwrite_pending.store(true, Ordering::Release);
                    }
                    self.takes.lock().push((track.id(), take));
                }
                Ok(None) => {}
                Err(e) => log::error!("{}: could not finish take: {}", track.name(), e),
            }
        }
    }
}

impl ButlerHost for DiskSession {
    fn transport_work(&self, scratch: &mut RefillScratch) -> bool {
        let tracks = self.all_tracks();

        match self.stop_pending.swap(STOP_NONE, Ordering::AcqRel) {
            STOP_NONE => {}
            kind => self.non_realtime_stop(kind == STOP_ABORT, &tracks),
        }

        if self.buffering_pending.swap(false, Ordering::AcqRel) {
            for track in &tracks {
                if let Err(e) = track.adjust_buffering(scratch) {
                    log::error!("{}: could not resize buffers: {}", track.name(), e);
                }
            }
        }

        let located = self.locate_pending.swap(false, Ordering::AcqRel);
        if located {
            let target = self.locate_target.load(Ordering::Acquire);
            for track in &tracks {
                if let Err(e) = track.seek(target, true, scratch) {
                    log::error!("{}: locate to {} failed: {}", track.name(), target, e);
                }
            }
        }

        if self.overwrite_pending.swap(false, Ordering::AcqRel) {
            for track in tracks.iter().filter(|t| t.reader().pending_overwrite()) {
                if let Err(e) = track.reader().overwrite_existing_buffers(scratch) {
                    log::warn!("{}: overwrite failed: {}", track.name(), e);
                }
            }
        }

        located
    }

    fn tracks(&self) -> Vec<Arc<DiskTrack>> {
        self.all_tracks()
    }

    fn actively_recording(&self) -> bool {
        self.ctx.transport().actively_recording()
    }

    fn request_transport_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.ctx.events().send(DiskEvent::TransportStopRequested);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════

pub struct DiskEngine {
    ctx: Arc<DiskIoContext>,
    session: Arc<DiskSession>,
    butler: Butler,
    events: Receiver<DiskEvent>,
    /// Sign of the last non-zero speed
    direction: AtomicI8,
}

impl DiskEngine {
    pub fn new(config: DiskIoConfig, sinks: Arc<dyn CaptureSinkFactory>) -> DiskIoResult<Self> {
        config.validate()?;
        init_loop_fades(config.sample_rate, config.loop_fade_mode);

        let bytes_per_sample = (config.native_sample_bits / 8) as usize;
        let scratch = refill_read_samples(config.playback_buffer_samples(), bytes_per_sample);
        let (events_tx, events) = event_channel(config.event_queue_capacity);
        let trash = TrashQueue::new(TRASH_QUEUE_SIZE);
        let collector = trash.collector();

        log::info!(
            "Disk engine: {} Hz, {:?} buffering",
            config.sample_rate,
            config.buffering_preset
        );

        let ctx = Arc::new(DiskIoContext::new(
            config,
            Arc::new(TransportState::new()),
            events_tx,
            trash,
            sinks,
        ));
        let session = Arc::new(DiskSession::new(ctx.clone()));
        let butler = Butler::new(session.clone(), collector, scratch)?;

        Ok(Self {
            ctx,
            session,
            butler,
            events,
            direction: AtomicI8::new(0),
        })
    }

    pub fn context(&self) -> &Arc<DiskIoContext> {
        &self.ctx
    }

    pub fn session(&self) -> &Arc<DiskSession> {
        &self.session
    }

    pub fn butler(&self) -> &Butler {
        &self.butler
    }

    pub fn transport(&self) -> &TransportState {
        self.ctx.transport()
    }

    /// Notifications from the audio thread and the butler
    pub fn events(&self) -> &Receiver<DiskEvent> {
        &self.events
    }

    /// Add a track and fill it from the current position
    pub fn add_track(&self, name: impl Into<String>, n_channels: usize) -> Arc<DiskTrack> {
        let track = self.session.add_track(name, n_channels);
        self.locate(self.transport().transport_sample());
        track
    }

    pub fn set_speed(&self, speed: f64) {
        self.transport().set_speed(speed);
        self.butler.summon();
    }

    pub fn locate(&self, sample: SamplePos) {
        self.session.request_locate(sample);
        self.butler.schedule_transport_work();
    }

    /// Stop the transport and finish the takes on the butler thread
    pub fn stop(&self, abort: bool) {
        let transport = self.transport();
        transport.set_speed(0.0);
        if transport.actively_recording() {
            transport.set_record_status(RecordStatus::Enabled);
        }
        self.session.request_stop(abort);
        self.butler.schedule_transport_work();
    }

    /// Re-read the playlist of `track` under the playhead
    pub fn request_overwrite(&self, track: &DiskTrack) {
        track.reader().set_pending_overwrite();
        self.session.request_overwrite();
        self.butler.schedule_transport_work();
    }

    /// Apply new settings; buffers are resized on the butler thread
    pub fn set_config(&self, config: DiskIoConfig) -> DiskIoResult<()> {
        config.validate()?;
        init_loop_fades(config.sample_rate, config.loop_fade_mode);
        self.ctx.set_config(config);
        self.session.request_buffering_change();
        self.butler.schedule_transport_work();
        Ok(())
    }

    /// Block until the butler has serviced everything requested so far
    pub fn sync(&self) {
        self.butler.wait_until_finished();
    }

    /// Process-thread entry: run every track for one cycle and move the
    /// transport. Tracks without an entry in `io` are skipped.
    pub fn process(&self, nframes: usize, io: &mut [TrackIo]) {
        let transport = self.ctx.transport();
        let Some(tracks) = self.session.try_tracks() else {
            for tio in io.iter_mut() {
                tio.buffers().silence(nframes);
            }
            return;
        };

        let speed = transport.speed();
        let direction = direction_of(speed);
        if direction != 0 {
            let last = self.direction.swap(direction, Ordering::AcqRel);
            if last != 0 && last != direction {
                // buffered material runs the wrong way
                self.session.request_locate(transport.transport_sample());
                self.butler.schedule_transport_work();
            }
        }

        let start = transport.transport_sample();
        if speed != 0.0 && transport.record_status() == RecordStatus::Enabled {
            let punch_in = transport.snapshot().punch_in_range();
            if punch_in.is_none_or(|p| start >= p.start) {
                transport.set_record_status(RecordStatus::Recording);
            }
        }
        let snapshot = transport.snapshot();

        let mut need_butler = false;
        for track in tracks.iter() {
            let Some(tio) = io.iter_mut().find(|t| t.track == track.id()) else {
                continue;
            };
            let mut bufs = tio.buffers();
            need_butler |= track.process(&mut bufs, start, nframes, &snapshot);
        }

        if snapshot.rolling() {
            let distance = snapshot.cycle_distance(nframes);
            let mut next = if speed > 0.0 {
                start + distance
            } else {
                (start - distance).max(0)
            };
            // writers split their pass at the wrap point themselves
            if let Some((_, lp)) = snapshot.loop_wrap(start, nframes) {
                next = lp.start + (next - lp.end) % lp.length();
            }
            transport.set_transport_sample(next);
        }

        if need_butler {
            self.butler.summon();
        }
    }
}

fn direction_of(speed: f64) -> i8 {
    if speed > 0.0 {
        1
    } else if speed < 0.0 {
        -1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TestRig, ramp_playlist};

    #[test]
    fn test_track_ids_and_removal() {
        let rig = TestRig::new();
        let session = DiskSession::new(rig.ctx.clone());
        let a = session.add_track("a", 1);
        let b = session.add_track("b", 2);
        assert_ne!(a.id(), b.id());
        assert_eq!(session.all_tracks().len(), 2);

        assert!(session.remove_track(a.id()));
        assert!(!session.remove_track(a.id()));
        assert!(session.track(a.id()).is_none());
        assert_eq!(rig.ctx.trash().len(), 1);
    }

    #[test]
    fn test_auditioner_is_serviced_with_tracks() {
        let rig = TestRig::new();
        let session = DiskSession::new(rig.ctx.clone());
        session.add_track("a", 1);
        session.set_auditioner(Some(Arc::new(DiskTrack::new(99, "audition", 2, rig.ctx.clone()))));
        let list = session.try_tracks().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().count(), 2);
    }

    #[test]
    fn test_locate_work_seeks_every_track() {
        let rig = TestRig::new();
        let session = DiskSession::new(rig.ctx.clone());
        let t = session.add_track("a", 1);
        t.set_playlist(Some(ramp_playlist(1, 50_000)));

        session.request_locate(12_000);
        let mut scratch = RefillScratch::new(4096);
        assert!(session.transport_work(&mut scratch));
        assert_eq!(t.reader().playback_sample(), 12_000);
        assert_eq!(rig.transport.transport_sample(), 12_000);

        // nothing pending any more
        assert!(!session.transport_work(&mut scratch));
    }

    #[test]
    fn test_abort_wins_over_stop() {
        let rig = TestRig::new();
        let session = DiskSession::new(rig.ctx.clone());
        session.request_stop(true);
        session.request_stop(false);
        assert_eq!(session.stop_pending.load(Ordering::Acquire), STOP_ABORT);
    }

    #[test]
    fn test_stop_request_raises_event() {
        let rig = TestRig::new();
        let session = DiskSession::new(rig.ctx.clone());
        session.request_transport_stop();
        assert!(session.take_stop_request());
        assert!(!session.take_stop_request());
        assert_eq!(rig.events.try_recv().unwrap(), DiskEvent::TransportStopRequested);
    }
}
