//! Magnitude spectra of the spectral window

use bci_core::{BciError, BciResult};
use num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::sync::Arc;

/// Frequency of each retained bin: `i * sample_rate / size` for `i < size / 2`
pub fn frequency_bins(sample_rate: f64, size: usize) -> Vec<f64> {
    let step = sample_rate / size as f64;
    (0..size / 2).map(|i| i as f64 * step).collect()
}

/// Reusable forward real FFT for one window size
pub struct SpectrumAnalyzer {
    size: usize,
    normalize: bool,
    fft: Arc<dyn RealToComplex<f64>>,
    input: Vec<f64>,
    output: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl SpectrumAnalyzer {
    pub fn new(size: usize, normalize: bool) -> Self {
        let mut planner = RealFftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(size);
        let input = fft.make_input_vec();
        let output = fft.make_output_vec();
        let scratch = fft.make_scratch_vec();
        SpectrumAnalyzer { size, normalize, fft, input, output, scratch }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn normalizes(&self) -> bool {
        self.normalize
    }

    /// Magnitudes of the first `size / 2` bins of `series`.
    /// When normalizing, an all-zero spectrum stays all zero.
    pub fn magnitudes(&mut self, series: &[f64]) -> BciResult<Vec<f64>> {
        if series.len() != self.size {
            return Err(BciError::InvalidConfig {
                reason: format!("expected {} samples, got {}", self.size, series.len()),
            });
        }
        self.input.copy_from_slice(series);
        self.fft
            .process_with_scratch(&mut self.input, &mut self.output, &mut self.scratch)
            .map_err(|e| BciError::InvalidConfig { reason: format!("fft failed: {}", e) })?;

        let mut magnitudes: Vec<f64> = self.output[..self.size / 2].iter().map(|c| c.norm()).collect();
        if self.normalize {
            let total: f64 = magnitudes.iter().sum();
            if total > 0.0 {
                magnitudes.iter_mut().for_each(|m| *m /= total);
            }
        }
        Ok(magnitudes)
    }
}
