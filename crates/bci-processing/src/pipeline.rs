//! Sample pipeline: filter, batch into windows, emit messages
//!
//! [`SamplePipeline`] is the synchronous core; [`run_pipeline`] drives it as
//! a task between the sample channel and the hub.

use crate::config::{PipelineConfig, WindowSettings};
use crate::filters::{FilterBank, SampleProcessor};
use crate::spectrum::{frequency_bins, SpectrumAnalyzer};
use crate::window::SampleWindow;
use bci_core::{BciError, BciResult, Message, Sample, SampleSink, CHANNELS};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runtime requests to the pipeline task
pub enum PipelineControl {
    /// Change the spectral window; restarts both windows and the sample count
    Resize(WindowSettings),
    /// Write every sample, before filtering, to a persistence sink
    AttachSink(Box<dyn SampleSink>),
    DetachSink,
}

impl fmt::Debug for PipelineControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineControl::Resize(settings) => f.debug_tuple("Resize").field(settings).finish(),
            PipelineControl::AttachSink(_) => f.write_str("AttachSink"),
            PipelineControl::DetachSink => f.write_str("DetachSink"),
        }
    }
}

/// Wall-clock time per `every` samples, logged at debug level
struct Throughput {
    every: u64,
    seen: u64,
    since: Instant,
}

impl Throughput {
    fn new(every: u64) -> Self {
        Throughput { every: every.max(1), seen: 0, since: Instant::now() }
    }

    fn tick(&mut self) {
        self.seen += 1;
        if self.seen % self.every == 0 {
            let now = Instant::now();
            debug!("{:?} elapsed over the last {} samples", now - self.since, self.every);
            self.since = now;
        }
    }
}

pub struct SamplePipeline {
    sample_rate: f64,
    filters: Box<dyn SampleProcessor>,
    raw: SampleWindow,
    spectral: SampleWindow,
    settings: WindowSettings,
    analyzer: SpectrumAnalyzer,
    bins: Vec<f64>,
    /// Samples accumulated since the last resize
    count: u64,
    sink: Option<Box<dyn SampleSink>>,
    throughput: Throughput,
}

impl SamplePipeline {
    pub fn new(config: &PipelineConfig) -> BciResult<Self> {
        config.validate()?;
        let settings = config.window_settings()?;
        let filters = FilterBank::new(config.bandpass, config.sample_rate)?;

        Ok(SamplePipeline {
            sample_rate: config.sample_rate,
            filters: Box::new(filters),
            raw: SampleWindow::new(config.raw_window),
            spectral: SampleWindow::new(settings.spectral_window()),
            settings,
            analyzer: SpectrumAnalyzer::new(settings.spectral_window(), config.normalize_spectrum),
            bins: frequency_bins(config.sample_rate, settings.spectral_window()),
            count: 0,
            sink: None,
            throughput: Throughput::new(config.sample_rate.round() as u64),
        })
    }

    pub fn settings(&self) -> WindowSettings {
        self.settings
    }

    /// Samples accumulated since the last resize
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn resize(&mut self, settings: WindowSettings) {
        let normalize = self.analyzer.normalizes();
        self.settings = settings;
        self.spectral = SampleWindow::new(settings.spectral_window());
        self.raw.reset();
        self.filters.reset();
        self.analyzer = SpectrumAnalyzer::new(settings.spectral_window(), normalize);
        self.bins = frequency_bins(self.sample_rate, settings.spectral_window());
        self.count = 0;
        info!(
            spectral_window = settings.spectral_window(),
            fft_interval = settings.fft_interval(),
            "Pipeline windows resized"
        );
    }

    pub fn attach_sink(&mut self, sink: Box<dyn SampleSink>) {
        self.detach_sink();
        self.sink = Some(sink);
        info!("Persistence sink attached");
    }

    pub fn detach_sink(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close() {
                warn!("Error closing persistence sink: {}", e);
            }
            info!("Persistence sink detached");
        }
    }

    pub fn handle_control(&mut self, control: PipelineControl) {
        match control {
            PipelineControl::Resize(settings) => self.resize(settings),
            PipelineControl::AttachSink(sink) => self.attach_sink(sink),
            PipelineControl::DetachSink => self.detach_sink(),
        }
    }

    /// Feed one sample; returns the messages completed by it, in emission
    /// order (`raw`, then `fft` and `fftBins`)
    pub fn process(&mut self, mut sample: Sample) -> Vec<Message> {
        self.throughput.tick();

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write(&sample) {
                warn!("Persistence sink failed, detaching: {}", e);
                self.detach_sink();
            }
        }

        self.filters.process(&mut sample);

        let mut messages = Vec::new();
        if self.raw.push(&sample.channels) {
            messages.push(Message::raw(self.raw.series()));
        }

        self.spectral.push(&sample.channels);
        self.count += 1;
        if self.spectrum_due() {
            match self.spectra() {
                Ok(spectra) => {
                    messages.push(Message::fft(spectra));
                    messages.push(Message::fft_bins(self.bins.clone()));
                }
                Err(e) => warn!("Skipping spectrum: {}", e),
            }
        }
        messages
    }

    fn spectrum_due(&self) -> bool {
        let window = self.settings.spectral_window() as u64;
        let interval = self.settings.fft_interval() as u64;
        self.count >= window && (self.count - window) % interval == 0
    }

    fn spectra(&mut self) -> BciResult<[Vec<f64>; CHANNELS]> {
        let series = self.spectral.series();
        let mut spectra: [Vec<f64>; CHANNELS] = Default::default();
        for (spectrum, values) in spectra.iter_mut().zip(series.iter()) {
            *spectrum = self.analyzer.magnitudes(values)?;
        }
        Ok(spectra)
    }
}

/// Drive `pipeline` until shutdown or until every sample producer is gone.
///
/// Completed messages are sent to `output` (the hub's broadcast queue).
pub async fn run_pipeline(
    mut pipeline: SamplePipeline,
    mut samples: mpsc::Receiver<Sample>,
    mut control: mpsc::Receiver<PipelineControl>,
    output: mpsc::Sender<Arc<Message>>,
    shutdown: CancellationToken,
) -> BciResult<()> {
    let result = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Ok(()),
            Some(request) = control.recv() => pipeline.handle_control(request),
            sample = samples.recv() => {
                let Some(sample) = sample else {
                    debug!("Sample producers gone, stopping pipeline");
                    break Ok(());
                };
                let mut closed = false;
                for message in pipeline.process(sample) {
                    if output.send(Arc::new(message)).await.is_err() {
                        closed = true;
                        break;
                    }
                }
                if closed {
                    break Err(BciError::ChannelClosed { channel: "hub broadcast" });
                }
            }
        }
    };

    pipeline.detach_sink();
    info!("Pipeline stopped");
    result
}
