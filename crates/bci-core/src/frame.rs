//! Wire frames, decoded samples and per-channel gains

use crate::codec::ByteOrder;
use crate::config_error;
use crate::error::{BciError, BciResult};
use crate::scale::{scale, ScaleUnit};
use serde::{Deserialize, Serialize};

/// Number of EEG channels carried by every frame
pub const CHANNELS: usize = 8;
/// Number of accelerometer axes carried by every frame
pub const AUX_CHANNELS: usize = 3;
/// Size of one frame on the wire
pub const FRAME_LEN: usize = 33;
/// First byte of every frame
pub const HEADER: u8 = 0xA0;
/// Last byte of every frame
pub const FOOTER: u8 = 0xC0;

const CHANNEL_OFFSET: usize = 2;
const AUX_OFFSET: usize = CHANNEL_OFFSET + CHANNELS * 3;

/// Quality score of a sample decoded from a footer-validated frame
pub const FULL_QUALITY: u8 = 100;

/// One 33-byte frame exactly as received from the device:
/// `header | sequence | 8 x 3-byte channels | 3 x 2-byte aux | footer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame([u8; FRAME_LEN]);

impl RawFrame {
    /// Wrap bytes already validated by the decoder
    pub fn from_bytes(bytes: [u8; FRAME_LEN]) -> Self {
        RawFrame(bytes)
    }

    /// Build a well-formed frame from raw ADC codes
    pub fn encode(
        sequence: u8,
        channels: &[i32; CHANNELS],
        aux: &[i16; AUX_CHANNELS],
        order: ByteOrder,
    ) -> Self {
        let mut bytes = [0u8; FRAME_LEN];
        bytes[0] = HEADER;
        bytes[1] = sequence;
        for (i, &code) in channels.iter().enumerate() {
            let at = CHANNEL_OFFSET + i * 3;
            bytes[at..at + 3].copy_from_slice(&order.write_i24(code));
        }
        for (i, &axis) in aux.iter().enumerate() {
            let at = AUX_OFFSET + i * 2;
            bytes[at..at + 2].copy_from_slice(&order.write_i16(axis));
        }
        bytes[FRAME_LEN - 1] = FOOTER;
        RawFrame(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    pub fn sequence(&self) -> u8 {
        self.0[1]
    }

    /// Same payload under a different sequence number
    pub fn with_sequence(mut self, sequence: u8) -> Self {
        self.0[1] = sequence;
        self
    }

    /// Raw ADC code of one channel
    pub fn channel_code(&self, channel: usize, order: ByteOrder) -> i32 {
        let at = CHANNEL_OFFSET + channel * 3;
        order.read_i24([self.0[at], self.0[at + 1], self.0[at + 2]])
    }

    /// One accelerometer axis
    pub fn aux_value(&self, axis: usize, order: ByteOrder) -> i16 {
        let at = AUX_OFFSET + axis * 2;
        order.read_i16([self.0[at], self.0[at + 1]])
    }

    /// Decode every field into a sample
    pub fn to_sample(
        &self,
        gains: &GainVector,
        decoding: FieldDecoding,
        quality: u8,
        origin: SampleOrigin,
        frame_aligned: bool,
    ) -> Sample {
        let mut channels = [0.0; CHANNELS];
        for (i, value) in channels.iter_mut().enumerate() {
            *value = scale(self.channel_code(i, decoding.order), gains.get(i), decoding.unit);
        }
        let mut aux = [0i16; AUX_CHANNELS];
        for (i, value) in aux.iter_mut().enumerate() {
            *value = self.aux_value(i, decoding.order);
        }

        Sample {
            sequence: self.sequence(),
            channels,
            aux,
            quality,
            origin,
            frame_aligned,
        }
    }
}

/// How frame fields are turned into numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldDecoding {
    pub order: ByteOrder,
    pub unit: ScaleUnit,
}

/// Where a sample came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOrigin {
    /// Decoded from a frame whose footer validated
    Decoded,
    /// Placeholder standing in for a frame lost to a sequence gap
    GapFill,
    /// Emitted while the transport was silent
    Heartbeat,
    /// Produced by the test-signal generator
    TestSignal,
}

/// One decoded, physically scaled reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sequence: u8,
    /// Channel values in the configured unit
    pub channels: [f64; CHANNELS],
    /// Accelerometer axes, raw
    pub aux: [i16; AUX_CHANNELS],
    /// 100 for a real frame, lower for placeholders, 0 for heartbeats
    pub quality: u8,
    pub origin: SampleOrigin,
    /// True once enough consecutive good frames were seen to trust alignment
    pub frame_aligned: bool,
}

impl Sample {
    /// An all-zero placeholder
    pub fn silent(sequence: u8, origin: SampleOrigin) -> Self {
        Sample {
            sequence,
            channels: [0.0; CHANNELS],
            aux: [0; AUX_CHANNELS],
            quality: 0,
            origin,
            frame_aligned: false,
        }
    }

    /// True for samples that did not come from a received frame
    pub fn is_synthesized(&self) -> bool {
        self.origin != SampleOrigin::Decoded
    }
}

/// Gain codes accepted by the device's channel-settings command
const GAIN_TABLE: [f64; 7] = [1.0, 2.0, 4.0, 6.0, 8.0, 12.0, 24.0];

/// Per-channel amplifier gains.
///
/// Always passed by value: a new snapshot replaces all eight gains at once.
/// Every gain is finite and positive; the scaler divides by it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; CHANNELS]", into = "[f64; CHANNELS]")]
pub struct GainVector([f64; CHANNELS]);

fn check_gain(channel: usize, gain: f64) -> BciResult<f64> {
    if gain.is_finite() && gain > 0.0 {
        Ok(gain)
    } else {
        Err(config_error!("gain for channel {} must be finite and positive, got {}", channel, gain))
    }
}

impl GainVector {
    pub const DEFAULT_GAIN: f64 = 24.0;

    pub fn new(gains: [f64; CHANNELS]) -> BciResult<Self> {
        for (channel, gain) in gains.iter().enumerate() {
            check_gain(channel, *gain)?;
        }
        Ok(GainVector(gains))
    }

    pub fn uniform(gain: f64) -> BciResult<Self> {
        GainVector::new([gain; CHANNELS])
    }

    /// Gain selected by a channel-settings gain code (`0..=6`)
    pub fn gain_for_code(code: u8) -> Option<f64> {
        GAIN_TABLE.get(usize::from(code)).copied()
    }

    /// Copy with one channel changed
    pub fn with_channel(mut self, channel: usize, gain: f64) -> BciResult<Self> {
        let slot = self
            .0
            .get_mut(channel)
            .ok_or_else(|| config_error!("no channel {}, gains cover {}", channel, CHANNELS))?;
        *slot = check_gain(channel, gain)?;
        Ok(self)
    }

    pub fn get(&self, channel: usize) -> f64 {
        self.0[channel]
    }

    pub fn as_array(&self) -> &[f64; CHANNELS] {
        &self.0
    }
}

impl Default for GainVector {
    fn default() -> Self {
        GainVector([Self::DEFAULT_GAIN; CHANNELS])
    }
}

impl TryFrom<[f64; CHANNELS]> for GainVector {
    type Error = BciError;

    fn try_from(gains: [f64; CHANNELS]) -> BciResult<Self> {
        GainVector::new(gains)
    }
}

impl From<GainVector> for [f64; CHANNELS] {
    fn from(gains: GainVector) -> Self {
        gains.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let codes = [1, -1, 0, 0, 0, 0, 0, 0x7FFFFF];
        let frame = RawFrame::encode(7, &codes, &[1, -2, 3], ByteOrder::BigEndian);
        let bytes = frame.as_bytes();

        assert_eq!(bytes[0], HEADER);
        assert_eq!(bytes[1], 7);
        assert_eq!(&bytes[2..5], &[0x00, 0x00, 0x01]);
        assert_eq!(&bytes[5..8], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&bytes[23..26], &[0x7F, 0xFF, 0xFF]);
        assert_eq!(&bytes[26..28], &[0x00, 0x01]);
        assert_eq!(&bytes[28..30], &[0xFF, 0xFE]);
        assert_eq!(bytes[32], FOOTER);
    }

    #[test]
    fn test_to_sample_scales_each_channel_with_its_gain() {
        let codes = [8_388_607; CHANNELS];
        let frame = RawFrame::encode(1, &codes, &[0, 0, 0], ByteOrder::BigEndian);
        let gains = GainVector::default().with_channel(0, 1.0).unwrap();

        let sample = frame.to_sample(&gains, FieldDecoding::default(), 100, SampleOrigin::Decoded, true);

        assert!((sample.channels[0] - 4_500_000.0).abs() < 1e-3);
        assert!((sample.channels[1] - 187_500.0).abs() < 1e-6);
        assert!(!sample.is_synthesized());
    }

    #[test]
    fn test_gain_table() {
        assert_eq!(GainVector::gain_for_code(0), Some(1.0));
        assert_eq!(GainVector::gain_for_code(6), Some(24.0));
        assert_eq!(GainVector::gain_for_code(7), None);
        assert_eq!(GainVector::default().get(3), 24.0);
    }

    #[test]
    fn test_rejects_unusable_gains() {
        for bad in [0.0, -4.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                GainVector::default().with_channel(0, bad),
                Err(BciError::InvalidConfig { .. })
            ));
            assert!(GainVector::uniform(bad).is_err());
        }
        assert!(GainVector::default().with_channel(CHANNELS, 1.0).is_err());
        assert_eq!(GainVector::uniform(2.0).unwrap().get(7), 2.0);
    }

    #[test]
    fn test_deserialize_validates_gains() {
        let gains: GainVector = serde_json::from_str("[1,2,4,6,8,12,24,24]").unwrap();
        assert_eq!(gains.get(2), 4.0);
        assert!(serde_json::from_str::<GainVector>("[0,2,4,6,8,12,24,24]").is_err());
    }
}
