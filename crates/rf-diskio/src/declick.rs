//! Declicking: start/stop gain ramps and loop boundary fades
//!
//! Two mechanisms:
//! - [`DeclickAmp`] ramps playback gain exponentially towards 0 or 1 when the
//!   transport starts, stops or monitoring changes (~40 dB in 1/50 s).
//! - Loop fades shape the stream at the loop boundary at refill time. The
//!   fade curves are process-wide and immutable; they are rebuilt only by
//!   [`init_loop_fades`] when the sample rate or policy changes.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rf_core::{Gain, GAIN_COEFF_DELTA, Location, OverlapType, Sample, SamplePos, coverage_exclusive_ends};

use crate::config::LoopFadeMode;

// ═══════════════════════════════════════════════════════════════════════════
// DECLICK AMP
// ═══════════════════════════════════════════════════════════════════════════

/// Samples processed between gain coefficient updates
const DECLICK_STEP: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct DeclickAmp {
    a: Gain,
    g: Gain,
}

impl DeclickAmp {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            a: 800.0 / sample_rate.max(1) as Gain,
            g: 0.0,
        }
    }

    #[inline]
    pub fn gain(&self) -> Gain {
        self.g
    }

    #[inline]
    pub fn set_gain(&mut self, g: Gain) {
        self.g = g;
    }

    /// Apply the ramp towards `target` to `buf`, advancing the internal gain
    pub fn apply_gain(&mut self, buf: &mut [Sample], target: Gain) {
        if buf.is_empty() {
            return;
        }

        let mut g = self.g;
        if g == target {
            if target != 1.0 {
                for s in buf.iter_mut() {
                    *s *= target;
                }
            }
            return;
        }

        for chunk in buf.chunks_mut(DECLICK_STEP) {
            for s in chunk.iter_mut() {
                *s *= g;
            }
            g += self.a * (target - g);
        }

        self.g = if (g - target).abs() < GAIN_COEFF_DELTA {
            target
        } else {
            g
        };
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOOP FADE TABLES
// ═══════════════════════════════════════════════════════════════════════════

/// Table length: long enough for the exponential shape to decay to
/// `GAIN_COEFF_DELTA / 2` with a ~1/1024 s time constant
pub fn loop_fade_length(sample_rate: u32) -> usize {
    let sr = sample_rate.max(1) as f64;
    (-(GAIN_COEFF_DELTA as f64 / 2.0).ln() / (1024.0 / sr)).ceil() as usize
}

#[derive(Debug)]
pub struct LoopFadeTables {
    sample_rate: u32,
    mode: LoopFadeMode,
    fade_in: Box<[Gain]>,
    fade_out: Box<[Gain]>,
    fade_in_length: usize,
    fade_out_length: usize,
}

impl LoopFadeTables {
    pub fn new(sample_rate: u32, mode: LoopFadeMode) -> Self {
        let len = loop_fade_length(sample_rate);
        let linear = mode == LoopFadeMode::Crossfade;
        let (fade_in, fade_in_length) = build_curve(len, sample_rate, true, linear);
        let (fade_out, fade_out_length) = build_curve(len, sample_rate, false, linear);
        Self {
            sample_rate,
            mode,
            fade_in,
            fade_out,
            fade_in_length,
            fade_out_length,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn mode(&self) -> LoopFadeMode {
        self.mode
    }

    pub fn fade_in(&self) -> &[Gain] {
        &self.fade_in[..self.fade_in_length]
    }

    pub fn fade_out(&self) -> &[Gain] {
        &self.fade_out[..self.fade_out_length]
    }

    /// Samples of pre-loop material needed for a crossfade
    pub fn crossfade_length(&self) -> usize {
        self.fade_out_length
    }
}

/// Returns the curve and how many of its samples are significant
fn build_curve(len: usize, sample_rate: u32, fade_in: bool, linear: bool) -> (Box<[Gain]>, usize) {
    let mut vec = vec![0.0 as Gain; len];

    if linear {
        for (n, v) in vec.iter_mut().enumerate() {
            let x = n as Gain / len as Gain;
            *v = if fade_in { x } else { 1.0 - x };
        }
        return (vec.into_boxed_slice(), len);
    }

    // pseudo-exponential (linear volume) shape, ~1/100 Hz for 40 dB
    let a = 390.0 / sample_rate.max(1) as Gain;
    let mut n = 0;
    if fade_in {
        let mut g: Gain = 0.0;
        while n < len && (1.0 - g) > GAIN_COEFF_DELTA {
            vec[n] = g;
            g += a * (1.0 - g);
            n += 1;
        }
    } else {
        let mut g: Gain = 1.0;
        while n < len && g > GAIN_COEFF_DELTA {
            vec[n] = g;
            g += a * (0.0 - g);
            n += 1;
        }
    }
    (vec.into_boxed_slice(), n)
}

static LOOP_FADES: ArcSwapOption<LoopFadeTables> = ArcSwapOption::const_empty();

/// (Re)build the process-wide loop fade tables. Called when the sample rate
/// is configured and when the fade policy changes; a no-op if nothing changed.
pub fn init_loop_fades(sample_rate: u32, mode: LoopFadeMode) -> Arc<LoopFadeTables> {
    if let Some(current) = LOOP_FADES.load_full() {
        if current.sample_rate == sample_rate && current.mode == mode {
            return current;
        }
    }
    let tables = Arc::new(LoopFadeTables::new(sample_rate, mode));
    log::debug!(
        "Loop fades: {:?} at {} Hz, {} samples",
        mode,
        sample_rate,
        tables.fade_out_length
    );
    LOOP_FADES.store(Some(tables.clone()));
    tables
}

/// Current loop fade tables, if the sample rate has been configured
pub fn loop_fades() -> Option<Arc<LoopFadeTables>> {
    LOOP_FADES.load_full()
}

// ═══════════════════════════════════════════════════════════════════════════
// LOOP DECLICKER
// ═══════════════════════════════════════════════════════════════════════════

/// Position of one loop fade on the timeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopDeclicker {
    fade_start: SamplePos,
    fade_end: SamplePos,
}

/// Overlap of the read range with the fade range as
/// (offset into buffer, offset into curve, count)
fn fade_window(
    fade_start: SamplePos,
    fade_end: SamplePos,
    read_start: SamplePos,
    read_end: SamplePos,
) -> Option<(usize, usize, usize)> {
    if coverage_exclusive_ends(fade_start, fade_end, read_start, read_end) == OverlapType::None {
        return None;
    }
    let from = fade_start.max(read_start);
    let to = fade_end.min(read_end);
    (from < to).then(|| {
        (
            (from - read_start) as usize,
            (from - fade_start) as usize,
            (to - from) as usize,
        )
    })
}

impl LoopDeclicker {
    /// Fade-in placed at the loop start
    pub fn fade_in(loop_location: &Location, tables: &LoopFadeTables) -> Self {
        if loop_location.is_empty() {
            return Self::default();
        }
        Self {
            fade_start: loop_location.start,
            fade_end: loop_location.start + tables.fade_in().len() as SamplePos,
        }
    }

    /// Fade-out ending at the loop end
    pub fn fade_out(loop_location: &Location, tables: &LoopFadeTables) -> Self {
        if loop_location.is_empty() {
            return Self::default();
        }
        Self {
            fade_start: loop_location.end - tables.fade_out().len() as SamplePos,
            fade_end: loop_location.end,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.fade_start != self.fade_end
    }

    /// Multiply the part of `buf` (covering `[read_start, read_end)`) that
    /// overlaps the fade by the matching part of `curve`
    pub fn run(&self, buf: &mut [Sample], read_start: SamplePos, read_end: SamplePos, curve: &[Gain]) {
        if !self.is_active() {
            return;
        }
        let Some((bo, vo, n)) = fade_window(self.fade_start, self.fade_end, read_start, read_end)
        else {
            return;
        };
        for (s, g) in buf[bo..bo + n].iter_mut().zip(&curve[vo..vo + n]) {
            *s *= *g;
        }
    }

    /// Crossfade the loop tail in `buf` with the material that leads into the
    /// loop start (`pre_loop`, aligned with this fade)
    pub fn crossfade(
        &self,
        buf: &mut [Sample],
        read_start: SamplePos,
        read_end: SamplePos,
        tables: &LoopFadeTables,
        pre_loop: &[Sample],
    ) {
        if !self.is_active() {
            return;
        }
        let Some((bo, vo, n)) = fade_window(self.fade_start, self.fade_end, read_start, read_end)
        else {
            return;
        };
        let out = &tables.fade_out()[vo..vo + n];
        let inc = &tables.fade_in()[vo..vo + n];
        let pre = &pre_loop[vo..vo + n];
        for (i, s) in buf[bo..bo + n].iter_mut().enumerate() {
            *s = *s * out[i] + pre[i] * inc[i];
        }
    }
}
