//! Configuration for the sample pipeline

use bci_core::{config_error, BciResult};
use serde::{Deserialize, Serialize};

/// Band-pass corner frequencies in Hz
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandpassConfig {
    pub low_hz: f64,
    pub high_hz: f64,
}

impl Default for BandpassConfig {
    fn default() -> Self {
        BandpassConfig { low_hz: 1.0, high_hz: 30.0 }
    }
}

/// Spectral window geometry. Only constructed through [`WindowSettings::new`],
/// so a value that reaches the pipeline is always valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowSettings {
    spectral_window: usize,
    fft_interval: usize,
}

impl WindowSettings {
    /// `fft_interval` is the number of samples between spectra once the
    /// window has filled.
    pub fn new(spectral_window: usize, fft_interval: usize) -> BciResult<Self> {
        if spectral_window < 2 || spectral_window % 2 != 0 {
            return Err(config_error!(
                "spectral window must be a positive even size, got {}",
                spectral_window
            ));
        }
        if fft_interval == 0 {
            return Err(config_error!("fft interval must be positive"));
        }
        Ok(WindowSettings { spectral_window, fft_interval })
    }

    pub fn spectral_window(&self) -> usize {
        self.spectral_window
    }

    pub fn fft_interval(&self) -> usize {
        self.fft_interval
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Nominal samples per second
    pub sample_rate: f64,
    /// Samples per `raw` message
    pub raw_window: usize,
    /// Samples per spectrum
    pub spectral_window: usize,
    /// Samples between spectra; defaults to the spectral window
    pub fft_interval: Option<usize>,
    pub bandpass: BandpassConfig,
    /// Scale each spectrum to unit sum
    pub normalize_spectrum: bool,
    /// Pending control requests buffered in front of the pipeline
    pub control_queue: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            sample_rate: 250.0,
            raw_window: 30,
            spectral_window: 250,
            fft_interval: None,
            bandpass: BandpassConfig::default(),
            normalize_spectrum: true,
            control_queue: 16,
        }
    }
}

impl PipelineConfig {
    /// 1-50 Hz pass band with a spectrum five times per second
    pub fn wide_band() -> Self {
        PipelineConfig {
            bandpass: BandpassConfig { low_hz: 1.0, high_hz: 50.0 },
            fft_interval: Some(50),
            ..Self::default()
        }
    }

    pub fn window_settings(&self) -> BciResult<WindowSettings> {
        WindowSettings::new(
            self.spectral_window,
            self.fft_interval.unwrap_or(self.spectral_window),
        )
    }

    pub fn validate(&self) -> BciResult<()> {
        if !(self.sample_rate > 0.0) {
            return Err(config_error!("sample rate must be positive, got {}", self.sample_rate));
        }
        if self.raw_window == 0 {
            return Err(config_error!("raw window must be positive"));
        }
        if self.control_queue == 0 {
            return Err(config_error!("control queue must be positive"));
        }
        let nyquist = self.sample_rate / 2.0;
        let band = self.bandpass;
        if !(band.low_hz > 0.0 && band.low_hz < band.high_hz && band.high_hz < nyquist) {
            return Err(config_error!(
                "band-pass {}-{} Hz must satisfy 0 < low < high < {} Hz",
                band.low_hz,
                band.high_hz,
                nyquist
            ));
        }
        self.window_settings().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        let settings = config.window_settings().unwrap();
        assert_eq!(settings.spectral_window(), 250);
        assert_eq!(settings.fft_interval(), 250);
        assert!(PipelineConfig::wide_band().validate().is_ok());
    }

    #[test]
    fn test_window_settings_rejects_bad_sizes() {
        assert!(WindowSettings::new(0, 10).is_err());
        assert!(WindowSettings::new(251, 10).is_err());
        assert!(WindowSettings::new(256, 0).is_err());
        assert!(WindowSettings::new(256, 32).is_ok());
    }

    #[test]
    fn test_band_must_fit_below_nyquist() {
        let config = PipelineConfig {
            bandpass: BandpassConfig { low_hz: 1.0, high_hz: 125.0 },
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            bandpass: BandpassConfig { low_hz: 30.0, high_hz: 1.0 },
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json() {
        let config: PipelineConfig = serde_json::from_str(r#"{ "spectral_window": 128 }"#).unwrap();
        assert_eq!(config.spectral_window, 128);
        assert_eq!(config.raw_window, 30);
        assert!(config.normalize_spectrum);
    }
}
