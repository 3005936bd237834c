//! Time-related types for audio processing

use serde::{Deserialize, Serialize};

/// Absolute sample position on the timeline
pub type SamplePos = i64;

/// Signed sample count
pub type SampleCnt = i64;

/// Largest representable timeline position ("end of timeline")
pub const MAX_SAMPLEPOS: SamplePos = i64::MAX;

/// Convert seconds to a sample count at the given rate
#[inline]
pub fn samples_from_seconds(seconds: f64, sample_rate: u32) -> SampleCnt {
    (seconds * sample_rate as f64).floor() as SampleCnt
}

/// A half-open timeline range `[start, end)` such as the loop or punch range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub start: SamplePos,
    pub end: SamplePos,
}

impl Location {
    pub fn new(start: SamplePos, end: SamplePos) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    #[inline]
    pub fn length(&self) -> SampleCnt {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn contains(&self, pos: SamplePos) -> bool {
        pos >= self.start && pos < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_normalizes_order() {
        let loc = Location::new(500, 100);
        assert_eq!(loc.start, 100);
        assert_eq!(loc.end, 500);
        assert_eq!(loc.length(), 400);
        assert!(loc.contains(100));
        assert!(!loc.contains(500));
    }

    #[test]
    fn test_samples_from_seconds() {
        assert_eq!(samples_from_seconds(1.5, 48000), 72000);
        assert_eq!(samples_from_seconds(0.0, 44100), 0);
    }
}
