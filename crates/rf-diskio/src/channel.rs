//! Per-channel streaming buffers and the copy-on-write channel list
//!
//! The audio thread reads the channel list through a lock-free snapshot.
//! Reconfiguration builds a new list and publishes it; the retired list goes
//! to the trash queue and is released by the butler once no snapshot of it
//! remains.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;
use rf_core::{Sample, SampleCnt};
use rf_file::AudioCaptureSink;

use crate::capture::CaptureTransition;
use crate::ringbuf::RingBuffer;
use crate::trash::TrashQueue;

/// Capture transitions a channel can hold before the flush path drains them
pub const CAPTURE_TRANSITION_SLOTS: usize = 256;

/// What every streaming channel provides to the channel list
pub trait ChannelBuffers: Send + Sync + Sized + 'static {
    fn with_buffer(buffer_samples: usize, reservation: usize) -> Self;

    /// Sample ring buffer between disk and the process thread
    fn buffer(&self) -> &RingBuffer<Sample>;

    /// Same channel with a fresh ring buffer of a new size; other
    /// per-channel state carries over
    fn resized(&self, buffer_samples: usize, reservation: usize) -> Self;
}

// ═══════════════════════════════════════════════════════════════════════════
// READER CHANNEL
// ═══════════════════════════════════════════════════════════════════════════

pub struct ReaderChannel {
    rbuf: RingBuffer<Sample>,
    /// Material leading into the loop start, used by the loop crossfade.
    /// Only touched by the refill path.
    pre_loop: Mutex<Vec<Sample>>,
}

impl ReaderChannel {
    #[inline]
    pub fn rbuf(&self) -> &RingBuffer<Sample> {
        &self.rbuf
    }

    pub fn pre_loop(&self) -> &Mutex<Vec<Sample>> {
        &self.pre_loop
    }
}

impl ChannelBuffers for ReaderChannel {
    fn with_buffer(buffer_samples: usize, reservation: usize) -> Self {
        Self {
            rbuf: RingBuffer::new(buffer_samples, reservation),
            pre_loop: Mutex::new(Vec::new()),
        }
    }

    fn buffer(&self) -> &RingBuffer<Sample> {
        &self.rbuf
    }

    fn resized(&self, buffer_samples: usize, reservation: usize) -> Self {
        Self {
            rbuf: RingBuffer::new(buffer_samples, reservation),
            pre_loop: Mutex::new(std::mem::take(&mut *self.pre_loop.lock())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WRITER CHANNEL
// ═══════════════════════════════════════════════════════════════════════════

pub struct WriterChannel {
    wbuf: RingBuffer<Sample>,
    transitions: RingBuffer<CaptureTransition>,
    sink: Mutex<Option<Box<dyn AudioCaptureSink>>>,
    /// Samples of the current capture already written to the sink
    capture_count: AtomicI64,
}

impl WriterChannel {
    #[inline]
    pub fn wbuf(&self) -> &RingBuffer<Sample> {
        &self.wbuf
    }

    #[inline]
    pub fn transitions(&self) -> &RingBuffer<CaptureTransition> {
        &self.transitions
    }

    pub fn sink(&self) -> &Mutex<Option<Box<dyn AudioCaptureSink>>> {
        &self.sink
    }

    #[inline]
    pub fn capture_count(&self) -> SampleCnt {
        self.capture_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_capture_count(&self, n: SampleCnt) {
        self.capture_count.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn reset_capture_count(&self) {
        self.capture_count.store(0, Ordering::Release);
    }
}

impl ChannelBuffers for WriterChannel {
    fn with_buffer(buffer_samples: usize, _reservation: usize) -> Self {
        Self {
            wbuf: RingBuffer::new(buffer_samples, 0),
            transitions: RingBuffer::new(CAPTURE_TRANSITION_SLOTS, 0),
            sink: Mutex::new(None),
            capture_count: AtomicI64::new(0),
        }
    }

    fn buffer(&self) -> &RingBuffer<Sample> {
        &self.wbuf
    }

    fn resized(&self, buffer_samples: usize, reservation: usize) -> Self {
        let ch = Self::with_buffer(buffer_samples, reservation);
        *ch.sink.lock() = self.sink.lock().take();
        ch.capture_count
            .store(self.capture_count(), Ordering::Release);
        ch
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CHANNEL SET
// ═══════════════════════════════════════════════════════════════════════════

pub type ChannelList<C> = Arc<Vec<Arc<C>>>;

pub struct ChannelSet<C: ChannelBuffers> {
    current: ArcSwap<Vec<Arc<C>>>,
    trash: TrashQueue,
}

impl<C: ChannelBuffers> ChannelSet<C> {
    pub fn new(trash: TrashQueue) -> Self {
        Self {
            current: ArcSwap::from_pointee(Vec::new()),
            trash,
        }
    }

    /// Lock-free snapshot for the process thread
    #[inline]
    pub fn reader(&self) -> Guard<ChannelList<C>> {
        self.current.load()
    }

    /// Owned snapshot for non-RT callers
    pub fn snapshot(&self) -> ChannelList<C> {
        self.current.load_full()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, channels: Vec<Arc<C>>) {
        let old = self.current.swap(Arc::new(channels));
        self.trash.push(old);
    }

    /// Grow or shrink to `count` channels. New channels follow the read and
    /// write positions of the first existing channel, with silent contents.
    /// Callers hold the owner's state-change lock.
    pub fn set_count(&self, count: usize, buffer_samples: usize, reservation: usize) {
        let current = self.snapshot();
        if current.len() == count {
            return;
        }

        let mut next: Vec<Arc<C>> = current.iter().take(count).cloned().collect();
        while next.len() < count {
            let ch = C::with_buffer(buffer_samples, reservation);
            if let Some(first) = current.first() {
                if first.buffer().bufsize() == ch.buffer().bufsize() {
                    ch.buffer().align_to(first.buffer());
                }
            }
            next.push(Arc::new(ch));
        }
        self.publish(next);
    }

    /// Replace every channel's ring buffer. Contents are discarded; callers
    /// refill or reposition afterwards.
    pub fn resize_all(&self, buffer_samples: usize, reservation: usize) {
        let current = self.snapshot();
        let next = current
            .iter()
            .map(|ch| Arc::new(ch.resized(buffer_samples, reservation)))
            .collect();
        self.publish(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_channels_align_with_siblings() {
        let trash = TrashQueue::new(16);
        let set: ChannelSet<ReaderChannel> = ChannelSet::new(trash.clone());
        set.set_count(1, 1024, 64);

        let first = set.snapshot()[0].clone();
        first.rbuf().write(&[1.0; 300]);
        first.rbuf().increment_read_ptr(100);

        set.set_count(2, 1024, 64);
        let list = set.reader();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].rbuf().read_space(), 200);
        assert_eq!(list[1].rbuf().reserved_size(), 64);
        assert!(Arc::ptr_eq(&list[0], &first));
        // two retired snapshots
        assert_eq!(trash.len(), 2);
    }

    #[test]
    fn test_snapshot_survives_reconfiguration() {
        let trash = TrashQueue::new(16);
        let mut collector = trash.collector();
        let set: ChannelSet<WriterChannel> = ChannelSet::new(trash);
        set.set_count(2, 512, 0);

        let held = set.reader();
        set.set_count(1, 512, 0);
        assert_eq!(held.len(), 2);
        assert_eq!(set.len(), 1);

        // the empty initial list is free, the held one is not
        assert_eq!(collector.collect(), 1);
        assert_eq!(collector.pending(), 1);
        drop(held);
        assert_eq!(collector.collect(), 1);
    }

    #[test]
    fn test_resize_keeps_capture_count() {
        let set: ChannelSet<WriterChannel> = ChannelSet::new(TrashQueue::new(8));
        set.set_count(1, 512, 0);
        set.snapshot()[0].add_capture_count(77);

        set.resize_all(4096, 0);
        let ch = set.snapshot()[0].clone();
        assert_eq!(ch.wbuf().capacity(), 4096);
        assert_eq!(ch.capture_count(), 77);
    }
}
