//! Lock-free SPSC ring buffer with a reservation zone
//!
//! Producer: butler thread (refill) or audio thread (capture)
//! Consumer: audio thread (playback) or butler thread (flush)
//!
//! Besides the usual read/write pointers the buffer keeps up to
//! `reservation` already-consumed elements intact behind the read pointer,
//! so the consumer can rewind (`decrement_read_ptr`) without touching disk.
//! One slot is always left empty to tell "full" from "empty": a buffer of
//! capacity N holds at most N - 1 readable elements.

use std::cell::UnsafeCell;
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

/// Default rewind zone kept behind the read pointer
pub const DEFAULT_RESERVATION: usize = 8191;

// ═══════════════════════════════════════════════════════════════════════════
// SPIN LOCK
// ═══════════════════════════════════════════════════════════════════════════

/// Guards the `reserved` counter together with the read pointer. Held for a
/// handful of instructions only, so spinning is cheaper than parking.
struct SpinLock(AtomicBool);

struct SpinGuard<'a>(&'a SpinLock);

impl SpinLock {
    const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[inline]
    fn lock(&self) -> SpinGuard<'_> {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        SpinGuard(self)
    }
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.0.0.store(false, Ordering::Release);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RING BUFFER
// ═══════════════════════════════════════════════════════════════════════════

pub struct RingBuffer<T> {
    storage: Box<[UnsafeCell<T>]>,
    size_mask: usize,
    capacity: usize,
    reservation: usize,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
    reserved: AtomicUsize,
    reservation_lock: SpinLock,
    reset_lock: Mutex<()>,
}

// SAFETY: one producer touches only the free region, one consumer only the
// readable region; the index atomics publish ownership changes between them.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a buffer holding at least `size - 1` elements (rounded up to a
    /// power of two), plus `reservation` elements of rewind history.
    pub fn new(size: usize, reservation: usize) -> Self {
        let capacity = size.max(2).next_power_of_two();
        let storage_size = (capacity + reservation).next_power_of_two();
        let storage = (0..storage_size)
            .map(|_| UnsafeCell::new(T::default()))
            .collect();

        Self {
            storage,
            size_mask: storage_size - 1,
            capacity,
            reservation,
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            reservation_lock: SpinLock::new(),
            reset_lock: Mutex::new(()),
        }
    }

    /// Buffer able to hold `seconds` of material at `sample_rate`, accounting
    /// for the sacrificed slot
    pub fn for_duration(seconds: f64, sample_rate: u32, reservation: usize) -> Self {
        let samples = (seconds.max(0.0) * sample_rate as f64).ceil() as usize;
        Self::new(samples + 1, reservation)
    }

    #[inline]
    fn base(&self) -> *mut T {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    #[inline]
    fn storage_size(&self) -> usize {
        self.storage.len()
    }

    /// Usable capacity (power of two, including the sacrificed slot)
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Physical storage size including the reservation zone
    #[inline]
    pub fn bufsize(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn reservation_size(&self) -> usize {
        self.reservation
    }

    /// Elements behind the read pointer that may be rewound over
    #[inline]
    pub fn reserved_size(&self) -> usize {
        let _sl = self.reservation_lock.lock();
        self.reserved.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn read_space(&self) -> usize {
        let w = self.write_idx.load(Ordering::Acquire);
        let r = self.read_idx.load(Ordering::Acquire);
        w.wrapping_sub(r) & self.size_mask
    }

    #[inline]
    pub fn write_space(&self) -> usize {
        (self.capacity - 1).saturating_sub(self.read_space())
    }

    /// Copy elements in; returns how many fit
    pub fn write(&self, src: &[T]) -> usize {
        let n = src.len().min(self.write_space());
        if n == 0 {
            return 0;
        }
        let w = self.write_idx.load(Ordering::Relaxed);
        let first = n.min(self.storage_size() - w);

        // SAFETY: sole producer; [w, w + n) lies in the free region
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(w), first);
            if n > first {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(first), self.base(), n - first);
            }
        }

        self.write_idx.store((w + n) & self.size_mask, Ordering::Release);
        n
    }

    /// Write `cnt` default (silent) elements; returns how many fit
    pub fn write_zero(&self, cnt: usize) -> usize {
        let n = cnt.min(self.write_space());
        if n == 0 {
            return 0;
        }
        let w = self.write_idx.load(Ordering::Relaxed);
        let first = n.min(self.storage_size() - w);

        // SAFETY: sole producer; [w, w + n) lies in the free region
        unsafe {
            for i in 0..first {
                self.base().add(w + i).write(T::default());
            }
            for i in 0..(n - first) {
                self.base().add(i).write(T::default());
            }
        }

        self.write_idx.store((w + n) & self.size_mask, Ordering::Release);
        n
    }

    /// Copy up to `cnt` elements into `dest`.
    ///
    /// With `commit == false` the read pointer is left alone and `offset`
    /// elements past it are skipped first, which lets the caller peek ahead.
    /// Returns 0 if a reset is in progress.
    pub fn read(&self, dest: &mut [T], cnt: usize, commit: bool, offset: usize) -> usize {
        let Some(_lm) = self.reset_lock.try_lock() else {
            return 0;
        };

        let w = self.write_idx.load(Ordering::Acquire);
        let mut r = self.read_idx.load(Ordering::Relaxed);
        let mut available = w.wrapping_sub(r) & self.size_mask;

        if !commit && offset > 0 {
            if offset > available {
                return 0;
            }
            available -= offset;
            r = (r + offset) & self.size_mask;
        }

        let n = cnt.min(dest.len()).min(available);
        if n == 0 {
            return 0;
        }
        let first = n.min(self.storage_size() - r);

        // SAFETY: sole consumer; [r, r + n) lies in the readable region
        unsafe {
            std::ptr::copy_nonoverlapping(self.base().add(r), dest.as_mut_ptr(), first);
            if n > first {
                std::ptr::copy_nonoverlapping(self.base(), dest.as_mut_ptr().add(first), n - first);
            }
        }

        if commit {
            let _sl = self.reservation_lock.lock();
            self.read_idx
                .store((r + n) & self.size_mask, Ordering::Release);
            let reserved = self.reserved.load(Ordering::Relaxed);
            self.reserved
                .store(self.reservation.min(reserved + n), Ordering::Relaxed);
        }

        n
    }

    /// Consume up to `cnt` elements without copying them
    pub fn increment_read_ptr(&self, cnt: usize) -> usize {
        let n = cnt.min(self.read_space());
        let _sl = self.reservation_lock.lock();
        let r = self.read_idx.load(Ordering::Relaxed);
        self.read_idx.store((r + n) & self.size_mask, Ordering::Release);
        let reserved = self.reserved.load(Ordering::Relaxed);
        self.reserved
            .store(self.reservation.min(reserved + n), Ordering::Relaxed);
        n
    }

    /// Rewind the read pointer by up to `cnt` elements, bounded by the
    /// reserved history. Returns how far it moved.
    pub fn decrement_read_ptr(&self, cnt: usize) -> usize {
        let _sl = self.reservation_lock.lock();
        let reserved = self.reserved.load(Ordering::Relaxed);
        let n = cnt.min(reserved);
        let r = self.read_idx.load(Ordering::Relaxed);
        self.read_idx
            .store(r.wrapping_sub(n) & self.size_mask, Ordering::Release);
        self.reserved.store(reserved - n, Ordering::Relaxed);
        n
    }

    /// Publish up to `cnt` elements written through `write_vector`
    pub fn increment_write_ptr(&self, cnt: usize) -> usize {
        let n = cnt.min(self.write_space());
        let w = self.write_idx.load(Ordering::Relaxed);
        self.write_idx.store((w + n) & self.size_mask, Ordering::Release);
        n
    }

    /// Whether the read pointer can move by `distance` (forward if positive,
    /// rewind if negative) without leaving valid data
    pub fn can_seek(&self, distance: i64) -> bool {
        if distance > 0 {
            self.read_space() >= distance as usize
        } else if distance < 0 {
            self.reserved_size() >= distance.unsigned_abs() as usize
        } else {
            true
        }
    }

    /// Drop all contents and history
    pub fn reset(&self) {
        let _lm = self.reset_lock.lock();
        let _sl = self.reservation_lock.lock();
        self.write_idx.store(0, Ordering::Release);
        self.read_idx.store(0, Ordering::Release);
        self.reserved.store(0, Ordering::Relaxed);
    }

    /// Take over `other`'s pointer positions with silent contents. Used when
    /// a channel is added next to running siblings. Neither buffer may be in
    /// use by a producer or consumer.
    pub fn align_to(&self, other: &RingBuffer<T>) {
        debug_assert_eq!(self.storage_size(), other.storage_size());
        let _lm = self.reset_lock.lock();
        let _sl = self.reservation_lock.lock();

        self.write_idx.store(
            other.write_idx.load(Ordering::Acquire) & self.size_mask,
            Ordering::Release,
        );
        self.read_idx.store(
            other.read_idx.load(Ordering::Acquire) & self.size_mask,
            Ordering::Release,
        );
        self.reserved
            .store(other.reserved_size().min(self.reservation), Ordering::Relaxed);

        // SAFETY: no producer or consumer is active (caller's contract)
        unsafe {
            for i in 0..self.storage_size() {
                self.base().add(i).write(T::default());
            }
        }
    }

    /// Free region as two slices: up to the end of storage, then from the
    /// start. Fill them, then publish with `increment_write_ptr`.
    ///
    /// # Safety
    /// Only the single producer may call this, and the slices must be dropped
    /// before the next call to `increment_write_ptr`, `write`, `reset` or
    /// `align_to`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn write_vector(&self) -> (&mut [T], &mut [T]) {
        let free = self.write_space();
        let w = self.write_idx.load(Ordering::Relaxed);
        let first = free.min(self.storage_size() - w);
        let second = free - first;
        // SAFETY: caller is the sole producer; both ranges are free space
        unsafe {
            (
                std::slice::from_raw_parts_mut(self.base().add(w), first),
                std::slice::from_raw_parts_mut(self.base(), second),
            )
        }
    }

    /// Readable region as two slices. Consume with `increment_read_ptr`.
    ///
    /// # Safety
    /// Only the single consumer may call this, and the slices must be dropped
    /// before the next call that moves the read pointer.
    pub unsafe fn read_vector(&self) -> (&[T], &[T]) {
        let available = self.read_space();
        let r = self.read_idx.load(Ordering::Relaxed);
        let first = available.min(self.storage_size() - r);
        let second = available - first;
        // SAFETY: caller is the sole consumer; both ranges hold readable data
        unsafe {
            (
                std::slice::from_raw_parts(self.base().add(r), first),
                std::slice::from_raw_parts(self.base(), second),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn seq(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| i as f32).collect()
    }

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        let rb = RingBuffer::<f32>::new(1000, 64);
        assert_eq!(rb.capacity(), 1024);
        assert_eq!(rb.write_space(), 1023);
        assert_eq!(rb.bufsize(), 2048);
    }

    #[test]
    fn test_for_duration_accounts_for_sacrificed_slot() {
        let rb = RingBuffer::<f32>::for_duration(1.0, 1024, 0);
        // 1024 samples + 1 does not fit in 1024
        assert_eq!(rb.capacity(), 2048);
        assert!(rb.write_space() >= 1024);
    }

    #[test]
    fn test_full_buffer() {
        let rb = RingBuffer::<f32>::new(65536, DEFAULT_RESERVATION);
        let data = vec![0.5f32; 65535];
        assert_eq!(rb.write(&data), 65535);
        assert_eq!(rb.read_space(), 65535);
        assert_eq!(rb.write_space(), 0);
        assert_eq!(rb.write(&[1.0]), 0);
    }

    #[test]
    fn test_space_invariant_across_wrap() {
        let rb = RingBuffer::<f32>::new(16, 4);
        let mut out = [0.0f32; 16];
        for round in 0..20 {
            let w = rb.write(&seq(round, 7));
            assert_eq!(w, 7);
            assert_eq!(rb.read_space() + rb.write_space(), rb.capacity() - 1);
            let r = rb.read(&mut out, 7, true, 0);
            assert_eq!(r, 7);
            assert_eq!(&out[..7], seq(round, 7).as_slice());
            assert_eq!(rb.read_space() + rb.write_space(), rb.capacity() - 1);
        }
    }

    #[test]
    fn test_peek_then_commit_returns_same_data() {
        let rb = RingBuffer::<f32>::new(64, 8);
        rb.write(&seq(0, 40));

        let mut peek = [0.0f32; 10];
        assert_eq!(rb.read(&mut peek, 10, false, 0), 10);
        assert_eq!(rb.read_space(), 40);

        let mut got = [0.0f32; 10];
        assert_eq!(rb.read(&mut got, 10, true, 0), 10);
        assert_eq!(peek, got);
        assert_eq!(rb.read_space(), 30);
    }

    #[test]
    fn test_peek_with_offset() {
        let rb = RingBuffer::<f32>::new(64, 8);
        rb.write(&seq(0, 20));

        let mut out = [0.0f32; 4];
        assert_eq!(rb.read(&mut out, 4, false, 5), 4);
        assert_eq!(out, [5.0, 6.0, 7.0, 8.0]);
        // offset beyond readable data
        assert_eq!(rb.read(&mut out, 4, false, 21), 0);
        assert_eq!(rb.read_space(), 20);
    }

    #[test]
    fn test_rewind_within_reservation() {
        let rb = RingBuffer::<f32>::new(256, 32);
        rb.write(&seq(0, 200));

        for n in [1usize, 16, 32] {
            assert_eq!(rb.increment_read_ptr(n), n);
            assert!(rb.can_seek(-(n as i64)));
            assert_eq!(rb.decrement_read_ptr(n), n);
            assert!(rb.reserved_size() <= rb.reservation_size());
        }

        // rewound data is the data that was there
        rb.increment_read_ptr(10);
        rb.decrement_read_ptr(10);
        let mut out = [0.0f32; 3];
        rb.read(&mut out, 3, true, 0);
        assert_eq!(out[0], 0.0);
    }

    #[test]
    fn test_rewind_beyond_reservation_fails() {
        let rb = RingBuffer::<f32>::new(256, 32);
        rb.write(&seq(0, 200));
        rb.increment_read_ptr(100);
        assert_eq!(rb.reserved_size(), 32);
        assert!(!rb.can_seek(-33));
        assert!(rb.can_seek(-32));
        assert_eq!(rb.decrement_read_ptr(100), 32);
        assert_eq!(rb.read_space(), 132);
    }

    #[test]
    fn test_can_seek_forward() {
        let rb = RingBuffer::<f32>::new(64, 8);
        rb.write(&seq(0, 10));
        assert!(rb.can_seek(10));
        assert!(!rb.can_seek(11));
        assert!(rb.can_seek(0));
    }

    #[test]
    fn test_rewound_history_is_not_overwritten() {
        let rb = RingBuffer::<f32>::new(16, 8);
        rb.write(&seq(0, 15));
        rb.increment_read_ptr(15);
        // refill completely while 8 samples of history are held
        assert_eq!(rb.write(&seq(100, 15)), 15);
        assert_eq!(rb.decrement_read_ptr(8), 8);

        let mut out = [0.0f32; 8];
        rb.read(&mut out, 8, true, 0);
        assert_eq!(out.to_vec(), seq(7, 8));
    }

    #[test]
    fn test_write_vector_and_increment_write_ptr() {
        let rb = RingBuffer::<f32>::new(8, 0);
        rb.write(&seq(0, 5));
        rb.increment_read_ptr(5);

        let (a, b) = unsafe { rb.write_vector() };
        assert_eq!(a.len() + b.len(), 7);
        for (i, s) in a.iter_mut().chain(b.iter_mut()).enumerate() {
            *s = 10.0 + i as f32;
        }
        assert_eq!(rb.increment_write_ptr(7), 7);

        let (ra, rb2) = unsafe { rb.read_vector() };
        let joined: Vec<f32> = ra.iter().chain(rb2.iter()).copied().collect();
        assert_eq!(joined, seq(10, 7));
    }

    #[test]
    fn test_write_zero() {
        let rb = RingBuffer::<f32>::new(8, 0);
        rb.write(&[1.0, 1.0]);
        rb.increment_read_ptr(2);
        assert_eq!(rb.write_zero(3), 3);
        let mut out = [9.0f32; 3];
        rb.read(&mut out, 3, true, 0);
        assert_eq!(out, [0.0; 3]);
    }

    #[test]
    fn test_reset_and_align() {
        let a = RingBuffer::<f32>::new(64, 16);
        let b = RingBuffer::<f32>::new(64, 16);
        a.write(&seq(1, 30));
        a.increment_read_ptr(12);

        b.align_to(&a);
        assert_eq!(b.read_space(), a.read_space());
        assert_eq!(b.reserved_size(), a.reserved_size());
        let mut out = [1.0f32; 4];
        b.read(&mut out, 4, true, 0);
        assert_eq!(out, [0.0; 4]);

        a.reset();
        assert_eq!(a.read_space(), 0);
        assert_eq!(a.reserved_size(), 0);
        assert_eq!(a.write_space(), 63);
    }

    #[test]
    fn test_spsc_threaded_order_preserved() {
        let rb = Arc::new(RingBuffer::<f32>::new(1024, 64));
        let total = 100_000usize;

        let producer = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                let mut next = 0usize;
                while next < total {
                    let len = 97.min(total - next);
                    let chunk = seq(next, len);
                    let n = rb.write(&chunk);
                    next += n;
                    if n == 0 {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0usize;
        let mut out = [0.0f32; 61];
        while expected < total {
            let n = rb.read(&mut out, 61, true, 0);
            for s in &out[..n] {
                assert_eq!(*s, expected as f32);
                expected += 1;
            }
            assert!(rb.reserved_size() <= rb.reservation_size());
            if n == 0 {
                thread::yield_now();
            }
        }

        producer.join().unwrap();
    }
}
