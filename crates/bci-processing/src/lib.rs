//! BCI-Processing: Windowed sample pipeline
//!
//! Band-pass filters every sample, batches filtered samples into a raw window
//! and a spectral window, and turns completed windows into messages.

pub mod config;
pub mod filters;
pub mod window;
pub mod spectrum;
pub mod pipeline;

pub use config::{BandpassConfig, PipelineConfig, WindowSettings};
pub use filters::{Biquad, BandpassFilter, FilterBank, SampleProcessor};
pub use window::SampleWindow;
pub use spectrum::{frequency_bins, SpectrumAnalyzer};
pub use pipeline::{run_pipeline, PipelineControl, SamplePipeline};
