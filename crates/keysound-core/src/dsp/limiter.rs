//! Lookahead peak limiter on the master bus
//!
//! Last stage of the output chain:
//!   effects bus + music bus → master volume → **limiter** → host buffer
//!
//! # Algorithm
//!
//! 1. Each input frame is written into a ring of `L` frames (the lookahead),
//!    and its stereo peak into a parallel ring.
//! 2. The running maximum over the ring is kept incrementally: a new peak at
//!    or above the maximum replaces it; overwriting the frame that held the
//!    maximum triggers a rescan; anything else leaves it alone.
//! 3. Target gain is `min(threshold, ceiling) / max` while the maximum is above
//!    the threshold, otherwise unity.
//! 4. A one-pole follower moves the gain toward the target: fast attack, slow
//!    release.
//! 5. The frame leaving the ring (delayed by exactly `L`) is scaled by the
//!    gain and clamped to ±ceiling.
//!
//! Gain reduction therefore starts `L` frames before a peak reaches the
//! output. All state is allocated at construction.

use crate::config::LimiterConfig;
use crate::types::StereoSample;

/// Lookahead peak limiter
#[derive(Debug, Clone)]
pub struct LookaheadLimiter {
    /// Linear amplitude where reduction starts
    threshold: f32,
    /// Linear hard output bound
    ceiling: f32,
    /// Ring length in frames
    lookahead: usize,

    // Lookahead rings
    delay: Vec<StereoSample>,
    peaks: Vec<f32>,
    write_pos: usize,
    running_max: f32,

    // Gain envelope
    gain: f32,
    attack_coeff: f32,
    release_coeff: f32,
}

impl LookaheadLimiter {
    pub fn new(config: &LimiterConfig, sample_rate: u32) -> Self {
        let fs = sample_rate.max(1) as f32;
        let lookahead = ((config.lookahead_ms.max(0.0) / 1000.0) * fs).round().max(1.0) as usize;

        let release_ms = config.release_ms.max(0.1);
        let mut attack_ms = config.attack_ms.max(0.01);
        if attack_ms >= release_ms {
            log::warn!(
                "Limiter attack ({} ms) must be faster than release ({} ms), using {} ms",
                attack_ms,
                release_ms,
                release_ms * 0.5
            );
            attack_ms = release_ms * 0.5;
        }

        // coeff = exp(-1 / (τ × fs))
        let attack_coeff = (-1.0 / (attack_ms / 1000.0 * fs)).exp();
        let release_coeff = (-1.0 / (release_ms / 1000.0 * fs)).exp();

        Self {
            threshold: config.threshold(),
            ceiling: config.ceiling(),
            lookahead,
            delay: vec![StereoSample::silence(); lookahead],
            peaks: vec![0.0; lookahead],
            write_pos: 0,
            running_max: 0.0,
            gain: 1.0,
            attack_coeff,
            release_coeff,
        }
    }

    /// Delay added to the signal, in frames
    pub fn latency_frames(&self) -> usize {
        self.lookahead
    }

    /// Smoothed gain currently applied (1.0 = no reduction)
    pub fn current_gain(&self) -> f32 {
        self.gain
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn ceiling(&self) -> f32 {
        self.ceiling
    }

    /// Clear the rings and the envelope
    pub fn reset(&mut self) {
        self.delay.fill(StereoSample::silence());
        self.peaks.fill(0.0);
        self.write_pos = 0;
        self.running_max = 0.0;
        self.gain = 1.0;
    }

    /// Limit `frames` in place (output is the input delayed by the lookahead)
    pub fn process(&mut self, frames: &mut [StereoSample]) {
        let limit = self.threshold.min(self.ceiling);

        for frame in frames.iter_mut() {
            let delayed = self.delay[self.write_pos];
            let evicted_peak = self.peaks[self.write_pos];

            let peak = frame.peak();
            self.delay[self.write_pos] = *frame;
            self.peaks[self.write_pos] = peak;

            if peak >= self.running_max {
                self.running_max = peak;
            } else if evicted_peak >= self.running_max {
                self.running_max = self.peaks.iter().copied().fold(0.0, f32::max);
            }

            let target = if self.running_max > self.threshold {
                limit / self.running_max
            } else {
                1.0
            };

            let coeff = if target < self.gain {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.gain = target + (self.gain - target) * coeff;

            let out = delayed * self.gain;
            frame.left = out.left.clamp(-self.ceiling, self.ceiling);
            frame.right = out.right.clamp(-self.ceiling, self.ceiling);

            self.write_pos += 1;
            if self.write_pos == self.lookahead {
                self.write_pos = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_limiter() -> LookaheadLimiter {
        LookaheadLimiter::new(&LimiterConfig::default(), 48000)
    }

    fn make_buffer(len: usize, left: f32, right: f32) -> Vec<StereoSample> {
        vec![StereoSample::new(left, right); len]
    }

    #[test]
    fn test_latency() {
        // 5 ms at 48 kHz
        assert_eq!(make_limiter().latency_frames(), 240);
    }

    #[test]
    fn test_below_threshold_is_transparent() {
        let mut limiter = make_limiter();
        let level = limiter.threshold() * 0.5;

        let mut buf = make_buffer(1000, level, -level);
        limiter.process(&mut buf);

        for (i, s) in buf.iter().enumerate() {
            let expected = if i < 240 { 0.0 } else { level };
            assert!(
                (s.left - expected).abs() < 1e-6 && (s.right + expected).abs() < 1e-6,
                "frame {} = {:?}, expected ±{}",
                i,
                s,
                expected
            );
        }
        assert_eq!(limiter.current_gain(), 1.0);
    }

    #[test]
    fn test_output_never_exceeds_ceiling() {
        let mut limiter = make_limiter();
        let ceiling = limiter.ceiling();

        let mut buf: Vec<StereoSample> = (0..4800)
            .map(|i| {
                let t = i as f32 / 48000.0;
                let s = (t * 2.0 * std::f32::consts::PI * 220.0).sin() * 2.5;
                StereoSample::new(s, -s * 0.8)
            })
            .collect();
        limiter.process(&mut buf);

        for (i, s) in buf.iter().enumerate().skip(limiter.latency_frames()) {
            assert!(
                s.peak() <= ceiling,
                "frame {} peak {} exceeds ceiling {}",
                i,
                s.peak(),
                ceiling
            );
        }
    }

    #[test]
    fn test_hot_signal_settles_near_threshold() {
        let mut limiter = make_limiter();
        let threshold = limiter.threshold();

        let mut buf = make_buffer(2000, threshold * 2.0, threshold * 2.0);
        limiter.process(&mut buf);

        // The peak entered the ring 240 frames before it reaches the output
        for s in &buf[480..] {
            assert!(
                (s.left - threshold).abs() < threshold * 0.02,
                "output {} should sit at threshold {}",
                s.left,
                threshold
            );
        }
    }

    #[test]
    fn test_running_max_rescans_after_peak_leaves() {
        let mut limiter = make_limiter();

        let mut spike = make_buffer(1, 1.5, 1.5);
        limiter.process(&mut spike);
        assert!(limiter.current_gain() < 1.0);

        // Once the spike has left the ring, gain releases toward unity
        let mut quiet = make_buffer(48000, 0.1, 0.1);
        limiter.process(&mut quiet);
        assert!(
            limiter.current_gain() > 0.999,
            "gain stuck at {}",
            limiter.current_gain()
        );
        assert!((quiet[47999].left - 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_attack_faster_than_release_is_enforced() {
        let config = LimiterConfig {
            attack_ms: 200.0,
            release_ms: 50.0,
            ..Default::default()
        };
        let limiter = LookaheadLimiter::new(&config, 48000);
        assert!(limiter.attack_coeff < limiter.release_coeff);
    }

    #[test]
    fn test_reset() {
        let mut limiter = make_limiter();
        let mut buf = make_buffer(100, 3.0, 3.0);
        limiter.process(&mut buf);

        limiter.reset();
        assert_eq!(limiter.current_gain(), 1.0);

        let mut silence = make_buffer(300, 0.0, 0.0);
        limiter.process(&mut silence);
        assert!(silence.iter().all(|s| s.peak() == 0.0));
    }
}
