//! Seizure classification over fixed-length sample windows.
//!
//! The classifier is a linear model over the low-frequency magnitude
//! spectrum of a 178-sample window. It is stateless: the same window always
//! produces the same classification, and nothing is retrained at runtime.
//!
//! # Procedure
//! 1. Forward DFT over the 178 real samples (no normalization).
//! 2. Magnitudes `P[k] = |X_k|` for bins 1..=44 (DC is skipped).
//! 3. Decision value `d = B + Σ W[k]·P[k+1]` against the trained weights.
//! 4. `label = d > 0`, `confidence = |d|`.

use std::sync::{Arc, OnceLock};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

mod weights;

/// Samples per classification window.
pub const WINDOW: usize = 178;

/// Spectral bins fed to the linear model (bins 1..=44 of the DFT).
pub const SPECTRUM_BINS: usize = 44;

/// Sample stride between evaluations once a window is full.
pub const EVAL_STRIDE: usize = WINDOW / 4;

/// Output of one classifier evaluation.
#[derive(Debug, Clone, Copy)]
pub struct SeizureClassification {
    /// True when the window is classified as seizure activity.
    pub label: bool,
    /// Distance from the decision boundary.
    pub confidence: f32,
    /// Magnitude spectrum the decision was made on, bins 1..=44.
    pub spectral_power: [f64; SPECTRUM_BINS],
}

/// Classify one window of millivolt samples.
pub fn classify(window: &[f64; WINDOW]) -> SeizureClassification {
    let spectral_power = magnitude_spectrum(window);
    let d = spectral_power
        .iter()
        .zip(weights::WEIGHTS.iter())
        .fold(weights::BIAS, |acc, (p, w)| acc + p * w);
    SeizureClassification {
        label: d > 0.0,
        confidence: d.abs() as f32,
        spectral_power,
    }
}

/// Magnitudes of DFT bins 1..=44.
fn magnitude_spectrum(window: &[f64; WINDOW]) -> [f64; SPECTRUM_BINS] {
    static FFT: OnceLock<Arc<dyn Fft<f64>>> = OnceLock::new();
    let fft = FFT.get_or_init(|| FftPlanner::new().plan_fft_forward(WINDOW));

    let mut buffer: Vec<Complex<f64>> = window.iter().map(|&x| Complex::new(x, 0.0)).collect();
    fft.process(&mut buffer);

    let mut spectral_power = [0.0f64; SPECTRUM_BINS];
    for (k, power) in spectral_power.iter_mut().enumerate() {
        *power = buffer[k + 1].norm();
    }
    spectral_power
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    #[test]
    fn classification_is_deterministic() {
        let mut window = [0.0f64; WINDOW];
        for (i, v) in window.iter_mut().enumerate() {
            *v = (i as f64 * 0.173).sin() * 250.0;
        }
        let a = classify(&window);
        let b = classify(&window);
        assert_eq!(a.label, b.label);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.spectral_power, b.spectral_power);
    }

    #[test]
    fn zero_window_decision_equals_bias() {
        let window = [0.0f64; WINDOW];
        let c = classify(&window);
        assert!(!c.label);
        assert!((f64::from(c.confidence) - 4.107_084_483_430_048).abs() < 1e-6);
        assert!(c.spectral_power.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn impulse_has_flat_unit_spectrum() {
        // DFT of a unit impulse has magnitude 1 in every bin (no scaling).
        let mut window = [0.0f64; WINDOW];
        window[0] = 1.0;
        let c = classify(&window);
        for (k, &p) in c.spectral_power.iter().enumerate() {
            assert!((p - 1.0).abs() < 1e-9, "bin {} magnitude {}", k + 1, p);
        }
    }

    #[test]
    fn pure_tone_concentrates_in_its_bin() {
        // A sine at bin 10 puts magnitude N/2 = 89 there and ~0 elsewhere.
        let mut window = [0.0f64; WINDOW];
        for (i, v) in window.iter_mut().enumerate() {
            *v = (TAU * 10.0 * i as f64 / WINDOW as f64).sin();
        }
        let c = classify(&window);
        let bin10 = c.spectral_power[9];
        assert!((bin10 - WINDOW as f64 / 2.0).abs() < 1e-6, "bin10={bin10}");
        for (k, &p) in c.spectral_power.iter().enumerate() {
            if k != 9 {
                assert!(p < 1e-6, "bin {} leaked {}", k + 1, p);
            }
        }
    }

    #[test]
    fn large_low_frequency_power_flips_the_label() {
        // Bin 3 carries a strongly positive weight; enough power there must
        // push the decision value over the boundary.
        let mut window = [0.0f64; WINDOW];
        for (i, v) in window.iter_mut().enumerate() {
            *v = (TAU * 3.0 * i as f64 / WINDOW as f64).sin() * 2500.0;
        }
        let c = classify(&window);
        assert!(c.label, "confidence={}", c.confidence);
    }
}
