//! Per-channel band-pass filtering

use crate::config::BandpassConfig;
use bci_core::{config_error, BciResult, Sample, CHANNELS};
use std::f64::consts::{PI, SQRT_2};

/// Stateful stage applied to every sample before batching
pub trait SampleProcessor: Send {
    /// Transform the channel values in place
    fn process(&mut self, sample: &mut Sample);

    fn name(&self) -> &str;

    /// Reset internal state
    fn reset(&mut self);
}

/// Single biquad section (2nd order Butterworth)
#[derive(Debug, Clone)]
pub struct Biquad {
    // y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2] - a1*y[n-1] - a2*y[n-2]
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    fn with_coefficients(b0: f64, b1: f64, b2: f64, a1: f64, a2: f64) -> Self {
        Biquad { b0, b1, b2, a1, a2, x1: 0.0, x2: 0.0, y1: 0.0, y2: 0.0 }
    }

    /// Pre-warped tangent for the bilinear transform
    fn prewarp(cutoff: f64, fs: f64) -> BciResult<f64> {
        if !(cutoff > 0.0 && cutoff < fs / 2.0) {
            return Err(config_error!(
                "cutoff {} Hz must lie between 0 and the Nyquist frequency {} Hz",
                cutoff,
                fs / 2.0
            ));
        }
        Ok((PI * cutoff / fs).tan())
    }

    pub fn lowpass(cutoff: f64, fs: f64) -> BciResult<Self> {
        let k = Self::prewarp(cutoff, fs)?;
        let k2 = k * k;
        let norm = k2 + SQRT_2 * k + 1.0;

        let b0 = k2 / norm;
        Ok(Self::with_coefficients(
            b0,
            2.0 * b0,
            b0,
            2.0 * (k2 - 1.0) / norm,
            (k2 - SQRT_2 * k + 1.0) / norm,
        ))
    }

    pub fn highpass(cutoff: f64, fs: f64) -> BciResult<Self> {
        let k = Self::prewarp(cutoff, fs)?;
        let k2 = k * k;
        let norm = k2 + SQRT_2 * k + 1.0;

        let b0 = 1.0 / norm;
        Ok(Self::with_coefficients(
            b0,
            -2.0 * b0,
            b0,
            2.0 * (k2 - 1.0) / norm,
            (k2 - SQRT_2 * k + 1.0) / norm,
        ))
    }

    pub fn process(&mut self, input: f64) -> f64 {
        let output = self.b0 * input + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;

        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;

        output
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

/// High-pass section cascaded into a low-pass section
#[derive(Debug, Clone)]
pub struct BandpassFilter {
    highpass: Biquad,
    lowpass: Biquad,
}

impl BandpassFilter {
    pub fn new(band: BandpassConfig, fs: f64) -> BciResult<Self> {
        if band.low_hz >= band.high_hz {
            return Err(config_error!(
                "band-pass low cutoff {} Hz must be below high cutoff {} Hz",
                band.low_hz,
                band.high_hz
            ));
        }
        Ok(BandpassFilter {
            highpass: Biquad::highpass(band.low_hz, fs)?,
            lowpass: Biquad::lowpass(band.high_hz, fs)?,
        })
    }

    pub fn process(&mut self, input: f64) -> f64 {
        self.lowpass.process(self.highpass.process(input))
    }

    pub fn reset(&mut self) {
        self.highpass.reset();
        self.lowpass.reset();
    }
}

/// One independent band-pass filter per channel
#[derive(Debug, Clone)]
pub struct FilterBank {
    filters: [BandpassFilter; CHANNELS],
}

impl FilterBank {
    pub fn new(band: BandpassConfig, fs: f64) -> BciResult<Self> {
        let filter = BandpassFilter::new(band, fs)?;
        Ok(FilterBank { filters: std::array::from_fn(|_| filter.clone()) })
    }
}

impl SampleProcessor for FilterBank {
    fn process(&mut self, sample: &mut Sample) {
        for (value, filter) in sample.channels.iter_mut().zip(self.filters.iter_mut()) {
            *value = filter.process(*value);
        }
    }

    fn name(&self) -> &str {
        "bandpass"
    }

    fn reset(&mut self) {
        self.filters.iter_mut().for_each(BandpassFilter::reset);
    }
}
