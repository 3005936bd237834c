//! Butler - Background Disk I/O Thread
//!
//! One long-lived thread does all disk work for the streaming tracks:
//! - transport work (locate, stop, overwrite) first, whenever requested
//! - a refill pass over every track's reader
//! - a flush pass over every track's writer
//! - releasing retired channel lists from the trash queue
//!
//! The scheduler is level-triggered: it keeps servicing while any track
//! reports more work and only sleeps once a whole pass came back idle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::{Condvar, Mutex};

use crate::error::{DiskIoError, DiskIoResult};
use crate::reader::RefillScratch;
use crate::track::DiskTrack;
use crate::trash::TrashCollector;

/// Pending wake-ups before further summons are dropped
const REQUEST_QUEUE_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButlerRequest {
    Run,
    Pause,
    Quit,
}

/// What the butler needs from the session it serves
pub trait ButlerHost: Send + Sync + 'static {
    /// Service queued transport work. Returns true if a locate was among
    /// it, in which case disk servicing is skipped for this pass.
    fn transport_work(&self, scratch: &mut RefillScratch) -> bool;

    /// Every streaming track, including the auditioner
    fn tracks(&self) -> Vec<Arc<DiskTrack>>;

    fn actively_recording(&self) -> bool;

    /// Ask for the transport to stop; called after a flush error while
    /// recording
    fn request_transport_stop(&self);
}

// ═══════════════════════════════════════════════════════════════════════════
// SHARED STATE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct ButlerStats {
    passes: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
}

struct ButlerShared {
    requests: Sender<ButlerRequest>,
    transport_work: AtomicU32,
    should_run: AtomicBool,
    /// Bumped every time the thread goes idle
    paused: Mutex<u64>,
    paused_cond: Condvar,
    stats: ButlerStats,
}

impl ButlerShared {
    fn signal_paused(&self) {
        let mut generation = self.paused.lock();
        *generation = generation.wrapping_add(1);
        self.paused_cond.notify_all();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BUTLER
// ═══════════════════════════════════════════════════════════════════════════

pub struct Butler {
    shared: Arc<ButlerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Butler {
    /// Spawn the butler thread. `scratch_samples` sizes the refill scratch.
    pub fn new(
        host: Arc<dyn ButlerHost>,
        trash: TrashCollector,
        scratch_samples: usize,
    ) -> DiskIoResult<Self> {
        let (tx, rx) = bounded(REQUEST_QUEUE_SIZE);
        let shared = Arc::new(ButlerShared {
            requests: tx,
            transport_work: AtomicU32::new(0),
            should_run: AtomicBool::new(true),
            paused: Mutex::new(0),
            paused_cond: Condvar::new(),
            stats: ButlerStats::default(),
        });

        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name("rf-butler".into())
            .spawn(move || {
                let scratch = RefillScratch::new(scratch_samples);
                thread_work(&worker, &rx, host.as_ref(), trash, scratch);
            })
            .map_err(|e| DiskIoError::Butler(format!("cannot spawn butler thread: {e}")))?;

        log::info!("Butler thread started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Wake the butler for a pass. Non-blocking; a dropped wake-up is
    /// harmless because the thread is then busy anyway.
    #[inline]
    pub fn summon(&self) {
        let _ = self.shared.requests.try_send(ButlerRequest::Run);
    }

    /// Count one unit of transport work and wake the butler for it
    pub fn schedule_transport_work(&self) {
        self.shared.transport_work.fetch_add(1, Ordering::AcqRel);
        self.summon();
    }

    #[inline]
    pub fn transport_work_pending(&self) -> bool {
        self.shared.transport_work.load(Ordering::Acquire) > 0
    }

    /// Pause disk servicing and wait until the butler is idle. Transport
    /// work is still serviced; `summon` resumes disk work.
    pub fn stop(&self) {
        self.request_and_wait(ButlerRequest::Pause);
    }

    /// Block until the butler has no work left, keeping its run state
    pub fn wait_until_finished(&self) {
        let req = if self.is_running() {
            ButlerRequest::Run
        } else {
            ButlerRequest::Pause
        };
        self.request_and_wait(req);
    }

    fn request_and_wait(&self, req: ButlerRequest) {
        if self.thread.as_ref().is_none_or(|t| t.is_finished()) {
            return;
        }
        let seen = *self.shared.paused.lock();
        if self.shared.requests.send(req).is_err() {
            return;
        }
        let mut generation = self.shared.paused.lock();
        while *generation == seen {
            self.shared.paused_cond.wait(&mut generation);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.should_run.load(Ordering::Acquire)
    }

    pub fn passes(&self) -> u64 {
        self.shared.stats.passes.load(Ordering::Relaxed)
    }

    pub fn read_errors(&self) -> u64 {
        self.shared.stats.read_errors.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.shared.stats.write_errors.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it to exit
    pub fn quit(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if self.shared.requests.send(ButlerRequest::Quit).is_err() {
            log::warn!("Butler request channel closed before quit");
        }
        if thread.join().is_err() {
            log::error!("Butler thread panicked");
        }
    }
}

impl Drop for Butler {
    fn drop(&mut self) {
        self.quit();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// THREAD
// ═══════════════════════════════════════════════════════════════════════════

/// Apply one request; false on quit
fn handle_request(shared: &ButlerShared, req: ButlerRequest) -> bool {
    match req {
        ButlerRequest::Run => shared.should_run.store(true, Ordering::Release),
        ButlerRequest::Pause => shared.should_run.store(false, Ordering::Release),
        ButlerRequest::Quit => return false,
    }
    true
}

fn thread_work(
    shared: &ButlerShared,
    requests: &Receiver<ButlerRequest>,
    host: &dyn ButlerHost,
    mut trash: TrashCollector,
    mut scratch: RefillScratch,
) {
    let mut idle = true;

    'outer: loop {
        if idle {
            match requests.recv() {
                Ok(req) => {
                    if !handle_request(shared, req) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        while let Ok(req) = requests.try_recv() {
            if !handle_request(shared, req) {
                break 'outer;
            }
        }

        shared.stats.passes.fetch_add(1, Ordering::Relaxed);

        if shared.transport_work.swap(0, Ordering::AcqRel) > 0 && host.transport_work(&mut scratch) {
            // a locate just repositioned every track
            idle = false;
            continue;
        }

        let mut disk_work_outstanding = false;
        if shared.should_run.load(Ordering::Acquire) {
            let tracks = host.tracks();
            disk_work_outstanding |= refill_pass(shared, &tracks, &mut scratch);
            disk_work_outstanding |= flush_pass(shared, host, &tracks);
        }

        trash.collect();

        if disk_work_outstanding || shared.transport_work.load(Ordering::Acquire) > 0 {
            idle = false;
        } else {
            shared.signal_paused();
            idle = true;
        }
    }

    shared.signal_paused();
    log::info!("Butler thread exiting");
}

/// Returns true if some track has more to read, or if the pass was cut
/// short for transport work
fn refill_pass(shared: &ButlerShared, tracks: &[Arc<DiskTrack>], scratch: &mut RefillScratch) -> bool {
    let mut outstanding = false;
    for track in tracks.iter().filter(|t| t.active()) {
        if shared.transport_work.load(Ordering::Acquire) > 0 {
            return true;
        }
        match track.reader().do_refill(scratch) {
            Ok(status) => outstanding |= status.more_work(),
            Err(_) => {
                // already logged and reported by the reader
                shared.stats.read_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    outstanding
}

fn flush_pass(shared: &ButlerShared, host: &dyn ButlerHost, tracks: &[Arc<DiskTrack>]) -> bool {
    let mut outstanding = false;
    for track in tracks.iter().filter(|t| t.active()) {
        if shared.transport_work.load(Ordering::Acquire) > 0 {
            return true;
        }
        match track.writer().do_flush(false) {
            Ok(status) => outstanding |= status.more_work(),
            Err(_) => {
                // already logged and reported by the writer
                shared.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                if host.actively_recording() {
                    log::warn!("Stopping transport to protect the take");
                    host.request_transport_stop();
                }
            }
        }
    }
    outstanding
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::DiskEvent;
    use crate::test_util::{TestRig, ramp_playlist};
    use crate::trash::TrashQueue;
    use std::sync::atomic::AtomicUsize;

    struct Host {
        tracks: Vec<Arc<DiskTrack>>,
        locates: AtomicUsize,
        stops: AtomicUsize,
    }

    impl ButlerHost for Host {
        fn transport_work(&self, scratch: &mut RefillScratch) -> bool {
            for t in &self.tracks {
                t.seek(0, false, scratch).unwrap();
            }
            self.locates.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn tracks(&self) -> Vec<Arc<DiskTrack>> {
            self.tracks.clone()
        }

        fn actively_recording(&self) -> bool {
            true
        }

        fn request_transport_stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn host(rig: &TestRig, n: usize) -> Arc<Host> {
        let tracks = (0..n)
            .map(|i| {
                let t = Arc::new(DiskTrack::new(i as u32, format!("t{i}"), 1, rig.ctx.clone()));
                t.set_playlist(Some(ramp_playlist(1, 200_000)));
                t
            })
            .collect();
        Arc::new(Host {
            tracks,
            locates: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_refills_until_idle() {
        let rig = TestRig::new();
        let host = host(&rig, 3);
        let butler = Butler::new(host.clone(), TrashQueue::new(8).collector(), 4096).unwrap();

        butler.summon();
        butler.wait_until_finished();

        for t in &host.tracks {
            let rbuf = t.reader().channels()[0].clone();
            // full apart from less than one read chunk
            assert!(rbuf.rbuf().write_space() < rig.ctx.read_chunk());
        }
        assert_eq!(butler.read_errors(), 0);
    }

    #[test]
    fn test_transport_work_resumes_and_locates() {
        let rig = TestRig::new();
        let host = host(&rig, 1);
        let butler = Butler::new(host.clone(), TrashQueue::new(8).collector(), 4096).unwrap();
        butler.stop();
        assert!(!butler.is_running());

        butler.schedule_transport_work();
        butler.wait_until_finished();
        assert_eq!(host.locates.load(Ordering::SeqCst), 1);
        assert!(!butler.transport_work_pending());
    }

    #[test]
    fn test_flush_error_requests_stop() {
        let rig = TestRig::with_transport(|t| {
            t.set_speed(1.0);
            t.set_record_status(crate::transport::RecordStatus::Recording);
        });
        let host = host(&rig, 1);
        let track = host.tracks[0].clone();
        track.writer().set_record_enabled(true).unwrap();

        // lose the capture file so the flush has nowhere to write
        let mut audio = vec![vec![0.25; 1024]; 1];
        let mut midi = rf_core::MidiBuffer::with_capacity(4);
        for i in 0..3 {
            let bufs = crate::process::ProcessBuffers::new(&mut audio, &mut midi);
            track
                .writer()
                .run(&bufs, i * 1024, 1024, &rig.transport.snapshot());
        }
        track.writer().channels()[0].sink().lock().take();

        let butler = Butler::new(host.clone(), TrashQueue::new(8).collector(), 4096).unwrap();
        butler.summon();
        butler.wait_until_finished();
        assert!(butler.write_errors() >= 1);
        assert!(host.stops.load(Ordering::SeqCst) >= 1);
        assert!(
            rig.events
                .try_iter()
                .any(|e| matches!(e, DiskEvent::WriteError { track: 0 }))
        );
    }

    #[test]
    fn test_quit_joins_thread() {
        let rig = TestRig::new();
        let mut butler = Butler::new(host(&rig, 1), TrashQueue::new(8).collector(), 1024).unwrap();
        butler.quit();
        // idempotent
        butler.quit();
        butler.summon();
        butler.wait_until_finished();
    }
}
