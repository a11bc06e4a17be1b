//! BCI-Core: Foundation types for the acquisition stream
//!
//! Wire-level codecs, physical scaling, decoded samples and the messages
//! fanned out to subscribers.

pub mod codec;
pub mod scale;
pub mod frame;
pub mod message;
pub mod sink;
pub mod error;

pub use codec::ByteOrder;
pub use scale::{scale, ScaleUnit, FULL_SCALE_VOLTAGE, MAX_CODE};
pub use frame::*;
pub use message::{Message, MessageKind, Payload};
pub use sink::SampleSink;
pub use error::{BciError, BciResult};
