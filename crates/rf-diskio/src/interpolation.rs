//! Cubic interpolation for varispeed playback

use rf_core::Sample;

/// Resamples disk material at a speed ratio, keeping a fractional read
/// phase per channel between cycles.
#[derive(Debug, Clone)]
pub struct CubicInterpolation {
    speed: f64,
    phase: Vec<f64>,
}

impl CubicInterpolation {
    pub fn new(channels: usize) -> Self {
        Self {
            speed: 1.0,
            phase: vec![0.0; channels],
        }
    }

    /// Speed magnitude; direction is handled by the ring buffer contents
    pub fn set_speed(&mut self, speed: f64) {
        self.speed = speed.abs();
    }

    #[inline]
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Resize the per-channel phase table. Allocates; not for the audio thread.
    pub fn set_channels(&mut self, channels: usize) {
        self.phase.resize(channels, 0.0);
    }

    pub fn reset(&mut self) {
        self.phase.fill(0.0);
    }

    /// Input samples consumed by producing `nframes` outputs at the current
    /// speed, without touching any state
    pub fn distance(&self, nframes: usize) -> usize {
        let start = self.phase.first().copied().unwrap_or(0.0);
        (start + nframes as f64 * self.speed).floor() as usize
    }

    /// Produce `output.len()` samples for `channel` from `input`, which must
    /// hold `distance(output.len()) + 3` samples. Returns the number of input
    /// samples consumed.
    pub fn interpolate(&mut self, channel: usize, input: &[Sample], output: &mut [Sample]) -> usize {
        let nframes = output.len();
        let Some(phase) = self.phase.get_mut(channel) else {
            return 0;
        };

        if nframes < 3 || input.len() < 3 {
            let n = nframes.min(input.len());
            output[..n].copy_from_slice(&input[..n]);
            return n;
        }

        let mut distance = *phase;
        let last = input.len() - 3;
        for out in output.iter_mut() {
            let f = distance.floor();
            let mut frac = (distance - f) as Sample;
            let mut i = f as usize;
            if frac >= 1.0 {
                frac -= 1.0;
                i += 1;
            }
            let i = i.min(last);

            let x0 = input[i];
            let x1 = input[i + 1];
            let x2 = input[i + 2];
            // invent a point before the first by continuing the first slope
            let xm1 = if i == 0 { x0 - (x1 - x0) } else { input[i - 1] };

            *out = x0
                + 0.5
                    * frac
                    * (x1 - xm1
                        + frac * (4.0 * x1 + 2.0 * xm1 - 5.0 * x0 - x2 + frac * (3.0 * (x0 - x1) - xm1 + x2)));

            distance += self.speed;
        }

        let consumed = distance.floor();
        *phase = distance - consumed;
        consumed as usize
    }
}
