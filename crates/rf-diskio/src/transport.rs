//! Shared transport state
//!
//! Written by the session (non-RT) and read by the audio thread and butler.
//! The audio thread takes one [`TransportSnapshot`] per cycle so that every
//! track sees the same loop and punch ranges for that cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use rf_core::{Location, SampleCnt, SamplePos};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RecordStatus {
    #[default]
    Disabled = 0,
    /// Armed; recording starts when the transport rolls (or reaches punch-in)
    Enabled = 1,
    Recording = 2,
}

impl From<u8> for RecordStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Enabled,
            2 => Self::Recording,
            _ => Self::Disabled,
        }
    }
}

pub struct TransportState {
    speed_bits: AtomicU64,
    transport_sample: AtomicI64,
    record_status: AtomicU8,
    punch_in: AtomicBool,
    punch_out: AtomicBool,
    punch_range: ArcSwapOption<Location>,
    loop_range: ArcSwapOption<Location>,
    slaved: AtomicBool,
}

impl TransportState {
    pub fn new() -> Self {
        Self {
            speed_bits: AtomicU64::new(0f64.to_bits()),
            transport_sample: AtomicI64::new(0),
            record_status: AtomicU8::new(RecordStatus::Disabled as u8),
            punch_in: AtomicBool::new(false),
            punch_out: AtomicBool::new(false),
            punch_range: ArcSwapOption::const_empty(),
            loop_range: ArcSwapOption::const_empty(),
            slaved: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Acquire))
    }

    pub fn set_speed(&self, speed: f64) {
        self.speed_bits.store(speed.to_bits(), Ordering::Release);
    }

    #[inline]
    pub fn rolling(&self) -> bool {
        self.speed() != 0.0
    }

    #[inline]
    pub fn transport_sample(&self) -> SamplePos {
        self.transport_sample.load(Ordering::Acquire)
    }

    pub fn set_transport_sample(&self, pos: SamplePos) {
        self.transport_sample.store(pos, Ordering::Release);
    }

    #[inline]
    pub fn record_status(&self) -> RecordStatus {
        RecordStatus::from(self.record_status.load(Ordering::Acquire))
    }

    pub fn set_record_status(&self, status: RecordStatus) {
        self.record_status.store(status as u8, Ordering::Release);
    }

    #[inline]
    pub fn actively_recording(&self) -> bool {
        self.record_status() == RecordStatus::Recording
    }

    pub fn set_punch(&self, punch_in: bool, punch_out: bool) {
        self.punch_in.store(punch_in, Ordering::Release);
        self.punch_out.store(punch_out, Ordering::Release);
    }

    pub fn set_punch_range(&self, range: Option<Location>) {
        self.punch_range.store(range.map(Arc::new));
    }

    pub fn set_loop_range(&self, range: Option<Location>) {
        self.loop_range.store(range.filter(|l| !l.is_empty()).map(Arc::new));
    }

    #[inline]
    pub fn loop_range(&self) -> Option<Location> {
        self.loop_range.load().as_deref().copied()
    }

    pub fn set_slaved(&self, slaved: bool) {
        self.slaved.store(slaved, Ordering::Release);
    }

    #[inline]
    pub fn slaved(&self) -> bool {
        self.slaved.load(Ordering::Acquire)
    }

    /// Consistent view for one process cycle; lock- and allocation-free
    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            speed: self.speed(),
            transport_sample: self.transport_sample(),
            record_status: self.record_status(),
            punch_in: self.punch_in.load(Ordering::Acquire),
            punch_out: self.punch_out.load(Ordering::Acquire),
            punch_range: self.punch_range.load().as_deref().copied(),
            loop_range: self.loop_range(),
            slaved: self.slaved(),
        }
    }
}

impl Default for TransportState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportSnapshot {
    pub speed: f64,
    pub transport_sample: SamplePos,
    pub record_status: RecordStatus,
    pub punch_in: bool,
    pub punch_out: bool,
    pub punch_range: Option<Location>,
    pub loop_range: Option<Location>,
    pub slaved: bool,
}

impl TransportSnapshot {
    #[inline]
    pub fn rolling(&self) -> bool {
        self.speed != 0.0
    }

    #[inline]
    pub fn actively_recording(&self) -> bool {
        self.record_status == RecordStatus::Recording
    }

    #[inline]
    pub fn record_enabled(&self) -> bool {
        self.record_status != RecordStatus::Disabled
    }

    /// Punch-in range if punch-in is enabled and a range is set
    #[inline]
    pub fn punch_in_range(&self) -> Option<Location> {
        self.punch_range.filter(|_| self.punch_in)
    }

    #[inline]
    pub fn punch_out_range(&self) -> Option<Location> {
        self.punch_range.filter(|_| self.punch_out)
    }

    /// Timeline samples the transport moves over a cycle of `nframes`
    pub fn cycle_distance(&self, nframes: usize) -> SampleCnt {
        let speed = self.speed.abs();
        if speed == 0.0 {
            0
        } else if speed == 1.0 {
            nframes as SampleCnt
        } else {
            (nframes as f64 * speed).floor() as SampleCnt
        }
    }

    /// Where a forward loop wraps inside the cycle starting at `start`:
    /// the cycle offset of the first sample past the loop end, and the
    /// loop. `None` when the cycle stays inside the loop.
    pub fn loop_wrap(&self, start: SamplePos, nframes: usize) -> Option<(usize, Location)> {
        let lp = self
            .loop_range
            .filter(|l| self.speed > 0.0 && l.length() > 0)?;
        if start >= lp.end || start + self.cycle_distance(nframes) < lp.end {
            return None;
        }
        let remaining = lp.end - start;
        let at = if self.speed == 1.0 {
            remaining as usize
        } else {
            (remaining as f64 / self.speed).ceil() as usize
        };
        Some((at.clamp(1, nframes), lp))
    }
}

impl Default for TransportSnapshot {
    fn default() -> Self {
        TransportState::new().snapshot()
    }
}
