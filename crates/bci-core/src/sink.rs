//! Persistence collaborator interface

use crate::error::BciResult;
use crate::frame::Sample;

/// Durable storage for the sample stream (delimited rows, biosignal
/// containers, ...). Receives every sample in arrival order, before filtering.
pub trait SampleSink: Send {
    fn write(&mut self, sample: &Sample) -> BciResult<()>;

    /// Flush and release the underlying storage
    fn close(&mut self) -> BciResult<()>;
}
