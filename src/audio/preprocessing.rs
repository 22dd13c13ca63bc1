//! # Audio Preprocessing Module
//!
//! Cleans up microphone frames before they are streamed to speech recognition.
//! The chain runs in a fixed order on each full frame:
//!
//! 1. **High-Pass Filter** - 4th-order Butterworth (two cascaded biquads) removes rumble below ~100Hz
//! 2. **Adaptive Noise Gate** - zeroes samples under `max(static, 3 × noise floor)`
//! 3. **Peak Normalization** - scales toward a target peak, capped by a maximum gain
//!
//! The only state carried between frames is the filter history and the noise floor estimate.

use crate::config::PreprocessingConfig;
use anyhow::Result;
use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type};
use tracing::debug;

/// Q factors of the two second-order sections of a 4th-order Butterworth
const BUTTERWORTH_4_Q: [f32; 2] = [0.541_196_1, 1.306_563];

/// Adaptive noise gate.
///
/// The noise floor is an exponentially weighted mean of frame amplitudes,
/// updated only from frames that are themselves quiet (mean |x| < 2 × floor).
pub struct NoiseGate {
    static_threshold: f32,
    noise_floor: f32,
    alpha: f32,
}

impl NoiseGate {
    pub fn new(static_threshold: f32, initial_floor: f32, alpha: f32) -> Self {
        Self {
            static_threshold,
            noise_floor: initial_floor,
            alpha,
        }
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    pub fn threshold(&self) -> f32 {
        self.static_threshold.max(self.noise_floor * 3.0)
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        if samples.is_empty() {
            return;
        }
        let mean_abs = samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32;
        if mean_abs < self.noise_floor * 2.0 {
            self.noise_floor = self.alpha * self.noise_floor + (1.0 - self.alpha) * mean_abs;
        }

        let threshold = self.threshold();
        for sample in samples.iter_mut() {
            if sample.abs() <= threshold {
                *sample = 0.0;
            }
        }
    }
}

/// Scales a frame toward `target_peak` without exceeding `max_gain`.
pub struct Normalizer {
    target_peak: f32,
    max_gain: f32,
    silence_peak: f32,
}

impl Normalizer {
    pub fn new(target_peak: f32, max_gain: f32, silence_peak: f32) -> Self {
        Self {
            target_peak,
            max_gain,
            silence_peak,
        }
    }

    /// Gain that would be applied for a given peak
    pub fn gain_for(&self, peak: f32) -> f32 {
        if peak > self.silence_peak {
            (self.target_peak / peak).min(self.max_gain)
        } else {
            1.0
        }
    }

    pub fn process(&self, samples: &mut [f32]) {
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        let gain = self.gain_for(peak);
        if gain != 1.0 {
            for sample in samples.iter_mut() {
                *sample *= gain;
            }
        }
    }
}

/// Audio preprocessor: high-pass → noise gate → normalize.
pub struct AudioPreprocessor {
    highpass: [DirectForm2Transposed<f32>; 2],
    gate: NoiseGate,
    normalizer: Normalizer,
    highpass_cutoff_hz: f32,
}

impl AudioPreprocessor {
    /// # Errors
    /// Returns an error if filter coefficients cannot be calculated
    /// (cutoff at or above Nyquist).
    pub fn new(sample_rate: u32, config: &PreprocessingConfig) -> Result<Self> {
        let section = |q: f32| -> Result<DirectForm2Transposed<f32>> {
            let coeffs = Coefficients::<f32>::from_params(
                Type::HighPass,
                (sample_rate as f32).hz(),
                config.highpass_cutoff_hz.hz(),
                q,
            )
            .map_err(|e| anyhow::anyhow!("Failed to create high-pass filter coefficients: {:?}", e))?;
            Ok(DirectForm2Transposed::<f32>::new(coeffs))
        };

        let highpass = [section(BUTTERWORTH_4_Q[0])?, section(BUTTERWORTH_4_Q[1])?];

        debug!(
            "Preprocessor initialized: {}Hz sample rate, {}Hz highpass, gate {:.3}, target peak {:.2}",
            sample_rate, config.highpass_cutoff_hz, config.static_gate_threshold, config.target_peak
        );

        Ok(Self {
            highpass,
            gate: NoiseGate::new(
                config.static_gate_threshold,
                config.initial_noise_floor,
                config.noise_floor_alpha,
            ),
            normalizer: Normalizer::new(config.target_peak, config.max_gain, config.silence_peak),
            highpass_cutoff_hz: config.highpass_cutoff_hz,
        })
    }

    pub fn new_default() -> Result<Self> {
        Self::new(16000, &PreprocessingConfig::default())
    }

    pub fn highpass_cutoff_hz(&self) -> f32 {
        self.highpass_cutoff_hz
    }

    pub fn noise_floor(&self) -> f32 {
        self.gate.noise_floor()
    }

    /// Process a frame in-place. Shape is preserved.
    pub fn process(&mut self, samples: &mut [f32]) {
        if samples.is_empty() {
            return;
        }

        for sample in samples.iter_mut() {
            let mut y = *sample;
            for stage in self.highpass.iter_mut() {
                y = stage.run(y);
            }
            *sample = y;
        }

        self.gate.process(samples);
        self.normalizer.process(samples);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn calculate_rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|x| x * x).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }

    fn generate_sine(freq_hz: f32, sample_rate: u32, duration_samples: usize, amplitude: f32) -> Vec<f32> {
        (0..duration_samples)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                amplitude * (2.0 * std::f32::consts::PI * freq_hz * t).sin()
            })
            .collect()
    }

    fn filter_only(pp: &mut AudioPreprocessor, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let mut y = *sample;
            for stage in pp.highpass.iter_mut() {
                y = stage.run(y);
            }
            *sample = y;
        }
    }

    #[test]
    fn test_preprocessor_default() {
        let pp = AudioPreprocessor::new_default().unwrap();
        assert_eq!(pp.highpass_cutoff_hz(), 100.0);
        assert!((pp.noise_floor() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_silent_frame_stays_zero() {
        let mut pp = AudioPreprocessor::new_default().unwrap();
        let mut frame = vec![0.0f32; 1600];
        pp.process(&mut frame);
        assert!(frame.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_near_silent_frame_not_amplified() {
        let mut pp = AudioPreprocessor::new_default().unwrap();
        let mut frame = generate_sine(440.0, 16000, 1600, 0.0005);
        pp.process(&mut frame);
        // Below the gate threshold everything is zeroed
        assert!(frame.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_highpass_attenuates_low_frequencies() {
        let mut pp = AudioPreprocessor::new_default().unwrap();
        let mut low = generate_sine(30.0, 16000, 3200, 0.5);
        let mut high = generate_sine(1000.0, 16000, 3200, 0.5);
        let low_before = calculate_rms(&low);
        let high_before = calculate_rms(&high);

        filter_only(&mut pp, &mut low);
        let mut pp = AudioPreprocessor::new_default().unwrap();
        filter_only(&mut pp, &mut high);

        let low_ratio = calculate_rms(&low[1600..]) / low_before;
        let high_ratio = calculate_rms(&high[1600..]) / high_before;
        assert!(low_ratio < 0.1, "30Hz should be attenuated, ratio: {}", low_ratio);
        assert!(high_ratio > 0.9, "1kHz should pass through, ratio: {}", high_ratio);
    }

    #[test]
    fn test_gate_zeroes_below_threshold() {
        let mut gate = NoiseGate::new(0.01, 0.01, 0.95);
        let mut frame = vec![0.005, -0.02, 0.5, -0.029, 0.031];
        gate.process(&mut frame);
        // Loud frame: floor untouched, threshold = max(0.01, 0.03)
        assert!((gate.noise_floor() - 0.01).abs() < 1e-9);
        assert_eq!(frame, vec![0.0, 0.0, 0.5, 0.0, 0.031]);
    }

    #[test]
    fn test_gate_floor_updates_only_on_quiet_frames() {
        let mut gate = NoiseGate::new(0.01, 0.01, 0.95);
        let mut quiet = vec![0.002f32; 100];
        gate.process(&mut quiet);
        let expected = 0.95 * 0.01 + 0.05 * 0.002;
        assert!((gate.noise_floor() - expected).abs() < 1e-6);

        let floor = gate.noise_floor();
        let mut loud = vec![0.5f32; 100];
        gate.process(&mut loud);
        assert_eq!(gate.noise_floor(), floor);
    }

    #[test]
    fn test_normalizer_gain_capped() {
        let n = Normalizer::new(0.8, 3.0, 0.001);
        assert!((n.gain_for(0.4) - 2.0).abs() < 1e-6);
        assert!((n.gain_for(0.1) - 3.0).abs() < 1e-6);
        assert!((n.gain_for(1.6) - 0.5).abs() < 1e-6);
        assert_eq!(n.gain_for(0.0005), 1.0);

        let mut frame = vec![0.2, -0.4, 0.1];
        n.process(&mut frame);
        assert!((frame[1] + 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_empty_input() {
        let mut pp = AudioPreprocessor::new_default().unwrap();
        let mut empty: Vec<f32> = vec![];
        pp.process(&mut empty);
    }

    #[test]
    fn test_cutoff_above_nyquist_fails() {
        let config = PreprocessingConfig {
            highpass_cutoff_hz: 9000.0,
            ..Default::default()
        };
        assert!(AudioPreprocessor::new(16000, &config).is_err());
    }

    proptest! {
        #[test]
        fn prop_frame_shape_preserved_and_bounded(
            samples in proptest::collection::vec(-1.0f32..1.0, 1..2000)
        ) {
            let mut pp = AudioPreprocessor::new_default().unwrap();
            let mut output = samples.clone();
            pp.process(&mut output);

            prop_assert_eq!(output.len(), samples.len());
            for sample in &output {
                prop_assert!(sample.is_finite());
            }
            let peak = output.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            prop_assert!(peak <= 0.8 + 1e-4, "peak {} above target", peak);
        }

        #[test]
        fn prop_normalized_peak_never_exceeds_target(
            amplitude in 0.3f32..1.0,
            freq in 300.0f32..4000.0
        ) {
            let mut pp = AudioPreprocessor::new_default().unwrap();
            let mut frame = generate_sine(freq, 16000, 1600, amplitude);
            pp.process(&mut frame);
            let peak = frame.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            prop_assert!(peak <= 0.8 + 1e-4, "peak {} above target", peak);
        }
    }
}
