//! Messages produced by the sample pipeline and fanned out to subscribers
//!
//! Channel data is held positionally; string labels only appear when a
//! message is serialized:
//! `{ "name": "raw", "payload": { "Chan1": [..], ..., "Chan8": [..] } }`.

use crate::error::BciResult;
use crate::frame::CHANNELS;
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Payload key used for the frequency axis of an `fftBins` message
pub const BINS_LABEL: &str = "bins";

/// Wire label of a channel (`Chan1` .. `Chan8`)
pub fn channel_label(channel: usize) -> String {
    format!("Chan{}", channel + 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Filtered time series of the last raw window
    Raw,
    /// Magnitude spectrum of the last spectral window
    Fft,
    /// Frequency of each spectrum bin
    FftBins,
}

impl MessageKind {
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Raw => "raw",
            MessageKind::Fft => "fft",
            MessageKind::FftBins => "fftBins",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// One series per channel, indexed by channel number
    Channels(Box<[Vec<f64>; CHANNELS]>),
    /// A single shared axis
    Axis(Vec<f64>),
}

/// A named, immutable payload
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: MessageKind,
    payload: Payload,
}

impl Message {
    pub fn raw(channels: [Vec<f64>; CHANNELS]) -> Self {
        Message { kind: MessageKind::Raw, payload: Payload::Channels(Box::new(channels)) }
    }

    pub fn fft(spectra: [Vec<f64>; CHANNELS]) -> Self {
        Message { kind: MessageKind::Fft, payload: Payload::Channels(Box::new(spectra)) }
    }

    pub fn fft_bins(bins: Vec<f64>) -> Self {
        Message { kind: MessageKind::FftBins, payload: Payload::Axis(bins) }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Series of one channel, if this message carries per-channel data
    pub fn channel(&self, channel: usize) -> Option<&[f64]> {
        match &self.payload {
            Payload::Channels(series) => series.get(channel).map(Vec::as_slice),
            Payload::Axis(_) => None,
        }
    }

    /// Serialize to the JSON text sent to subscribers
    pub fn to_json(&self) -> BciResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

struct LabelledPayload<'a>(&'a Payload);

impl Serialize for LabelledPayload<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Payload::Channels(series) => {
                let mut map = serializer.serialize_map(Some(CHANNELS))?;
                for (i, values) in series.iter().enumerate() {
                    map.serialize_entry(&channel_label(i), values)?;
                }
                map.end()
            }
            Payload::Axis(values) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(BINS_LABEL, values)?;
                map.end()
            }
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("name", self.name())?;
        map.serialize_entry("payload", &LabelledPayload(&self.payload))?;
        map.end()
    }
}
