//! Range overlap classification and loop squishing
//!
//! `coverage` answers "how does range B overlap range A" for inclusive ranges.
//! The capture window, the loop declick fades and the process cycle are all
//! half-open, so callers normally go through [`coverage_exclusive_ends`].

use crate::time::{Location, SampleCnt, SamplePos};

/// How range B overlaps range A
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapType {
    /// No overlap
    None,
    /// B is entirely inside A, touching neither end
    Internal,
    /// B covers the start of A, ends inside A
    Start,
    /// B starts inside A, covers the end of A
    End,
    /// B covers all of A (ends may coincide)
    External,
}

/// Classify inclusive ranges `[sa, ea]` (A) and `[sb, eb]` (B)
pub fn coverage(sa: SamplePos, ea: SamplePos, sb: SamplePos, eb: SamplePos) -> OverlapType {
    if sa > ea || sb > eb {
        return OverlapType::None;
    }

    if sb < sa {
        if eb < sa {
            OverlapType::None
        } else if eb < ea {
            OverlapType::Start
        } else {
            OverlapType::External
        }
    } else if sb == sa {
        if eb < ea {
            OverlapType::Start
        } else {
            OverlapType::External
        }
    } else if eb < ea {
        OverlapType::Internal
    } else if sb <= ea {
        OverlapType::End
    } else {
        OverlapType::None
    }
}

/// Classify half-open ranges `[sa, ea)` and `[sb, eb)`
#[inline]
pub fn coverage_exclusive_ends(
    sa: SamplePos,
    ea: SamplePos,
    sb: SamplePos,
    eb: SamplePos,
) -> OverlapType {
    if sa == ea || sb == eb {
        return OverlapType::None;
    }
    coverage(sa, ea - 1, sb, eb - 1)
}

/// Inclusive range `[from, to]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub from: SamplePos,
    pub to: SamplePos,
}

impl Range {
    pub fn new(from: SamplePos, to: SamplePos) -> Self {
        Self { from, to }
    }

    /// Inclusive range covering the samples of a half-open location
    pub fn from_location(loc: &Location) -> Self {
        Self {
            from: loc.start,
            to: loc.end - 1,
        }
    }

    #[inline]
    pub fn length(&self) -> SampleCnt {
        self.to - self.from + 1
    }

    /// Wrap a position past the end of the range back into it, keeping the
    /// distance travelled past the end. Positions at or before `to` are
    /// returned unchanged.
    #[inline]
    pub fn squish(&self, t: SamplePos) -> SamplePos {
        if t > self.to && self.length() > 0 {
            self.from + ((t - self.from) % self.length())
        } else {
            t
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coverage_cases() {
        assert_eq!(coverage(10, 20, 0, 5), OverlapType::None);
        assert_eq!(coverage(10, 20, 25, 30), OverlapType::None);
        assert_eq!(coverage(10, 20, 12, 18), OverlapType::Internal);
        assert_eq!(coverage(10, 20, 5, 15), OverlapType::Start);
        assert_eq!(coverage(10, 20, 10, 15), OverlapType::Start);
        assert_eq!(coverage(10, 20, 15, 25), OverlapType::End);
        assert_eq!(coverage(10, 20, 15, 20), OverlapType::End);
        assert_eq!(coverage(10, 20, 5, 25), OverlapType::External);
        assert_eq!(coverage(10, 20, 10, 20), OverlapType::External);
        assert_eq!(coverage(10, 20, 20, 30), OverlapType::End);
    }

    #[test]
    fn test_coverage_exclusive_touching_ranges_do_not_overlap() {
        assert_eq!(coverage_exclusive_ends(100, 200, 200, 300), OverlapType::None);
        assert_eq!(coverage_exclusive_ends(100, 200, 0, 100), OverlapType::None);
        assert_eq!(coverage_exclusive_ends(100, 200, 0, 101), OverlapType::Start);
        assert_eq!(coverage_exclusive_ends(100, 200, 199, 300), OverlapType::End);
    }

    #[test]
    fn test_squish() {
        let r = Range::from_location(&Location::new(1000, 2000));
        assert_eq!(r.length(), 1000);
        assert_eq!(r.squish(1500), 1500);
        assert_eq!(r.squish(1999), 1999);
        assert_eq!(r.squish(2000), 1000);
        assert_eq!(r.squish(2250), 1250);
        assert_eq!(r.squish(3100), 1100);
        // before the range is untouched
        assert_eq!(r.squish(10), 10);
    }
}
