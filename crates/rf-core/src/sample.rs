//! Sample types and audio buffer helpers

/// Type alias for audio samples (native 32-bit float, same as the capture format)
pub type Sample = f32;

/// Linear gain coefficient
pub type Gain = f32;

/// Gains closer than this to their target are considered to have arrived
pub const GAIN_COEFF_DELTA: Gain = 1e-5;

#[inline]
pub fn apply_gain_to_buffer(buf: &mut [Sample], gain: Gain) {
    if gain == 1.0 {
        return;
    }
    for s in buf.iter_mut() {
        *s *= gain;
    }
}

/// Add `src` into `dst` sample by sample
#[inline]
pub fn mix_buffers_no_gain(dst: &mut [Sample], src: &[Sample]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += *s;
    }
}

#[inline]
pub fn mix_buffers_with_gain(dst: &mut [Sample], src: &[Sample], gain: Gain) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += *s * gain;
    }
}

#[inline]
pub fn silence(buf: &mut [Sample]) {
    buf.fill(0.0);
}
