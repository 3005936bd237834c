//! Capture bookkeeping shared by the disk writer and its flush path

use serde::{Deserialize, Serialize};

use rf_core::{OverlapType, SampleCnt, SamplePos, coverage_exclusive_ends};

/// Where captured material is placed on the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlignStyle {
    /// Line up with what the performer heard: compensate for output
    /// latency and roll delay
    #[default]
    ExistingMaterial,
    /// Place at the transport position when the input arrived
    CaptureTime,
}

/// One contiguous punch pass of a take
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaptureInfo {
    /// Timeline position of the first captured sample
    pub start: SamplePos,
    pub samples: SampleCnt,
    /// Offsets (from `start`) where the capture buffer overran
    pub xruns: Vec<SampleCnt>,
    /// Overruns whose offsets did not fit in the event queue
    pub lost_xruns: u32,
    /// Loop iterations already captured when this pass ended, times the loop
    /// length
    pub loop_offset: SampleCnt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureTransitionKind {
    #[default]
    CaptureStart,
    CaptureEnd,
}

/// Marker passed from the audio thread to the flush path in destructive
/// mode, so the file can record where each punch pass begins and ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureTransition {
    pub kind: CaptureTransitionKind,
    /// Timeline position for starts, captured sample count for ends
    pub capture_val: SamplePos,
}

/// Audio thread to non-RT handoff; `Copy` so it can go through a
/// preallocated queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaptureEvent {
    Xrun(SampleCnt),
    Finished {
        start: SamplePos,
        samples: SampleCnt,
        loop_offset: SampleCnt,
        lost_xruns: u32,
    },
}

/// Part of a cycle that falls inside the record window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSpan {
    pub overlap: OverlapType,
    /// Samples to capture
    pub count: SampleCnt,
    /// Offset into the cycle of the first captured sample
    pub offset: SampleCnt,
}

impl RecordSpan {
    pub const NONE: Self = Self {
        overlap: OverlapType::None,
        count: 0,
        offset: 0,
    };
}

/// Intersect the cycle `[start, start + nframes)` with the record window
/// `[first, last)`.
///
/// The captured samples always satisfy `offset + count <= nframes` and lie
/// inside the window; windows and cycles are half-open so a cycle ending
/// exactly at `first` captures nothing.
pub fn record_span(
    first: SamplePos,
    last: SamplePos,
    start: SamplePos,
    nframes: SampleCnt,
) -> RecordSpan {
    if nframes <= 0 {
        return RecordSpan::NONE;
    }
    let end = start.saturating_add(nframes);
    let overlap = coverage_exclusive_ends(first, last, start, end);
    if overlap == OverlapType::None {
        return RecordSpan::NONE;
    }
    let from = first.max(start);
    let to = last.min(end);
    RecordSpan {
        overlap,
        count: (to - from).max(0),
        offset: from - start,
    }
}
