//! Conversion from raw ADC codes to physical units

use serde::{Deserialize, Serialize};

/// ADC reference range in volts
pub const FULL_SCALE_VOLTAGE: f64 = 4.5;
/// Largest positive 24-bit ADC code
pub const MAX_CODE: f64 = ((1 << 23) - 1) as f64;

/// Physical unit reported for channel values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleUnit {
    Volts,
    #[default]
    Microvolts,
}

impl ScaleUnit {
    /// Multiplier applied on top of the volt value
    pub fn factor(self) -> f64 {
        match self {
            ScaleUnit::Volts => 1.0,
            ScaleUnit::Microvolts => 1_000_000.0,
        }
    }
}

/// Scale a raw ADC code at the given channel gain.
///
/// At gain 24 the representable range is +/-187,500 uV.
pub fn scale(raw: i32, gain: f64, unit: ScaleUnit) -> f64 {
    FULL_SCALE_VOLTAGE / gain / MAX_CODE * f64::from(raw) * unit.factor()
}
