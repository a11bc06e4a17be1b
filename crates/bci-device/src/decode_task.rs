//! Decoder task: drives [`FrameDecoder`] from the read-event stream

use crate::coordinator::{ByteStream, DeviceEvent, ResetOutcome, ResetRequest};
use crate::decoder::{DecodeEvent, DecoderStats, FrameDecoder};
use bci_core::{BciError, BciResult, GainVector, Sample};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Requests served by the decoder task
#[derive(Debug)]
pub enum DecoderControl {
    /// Reset the decoder and run the device reset handshake
    Reset { done: oneshot::Sender<BciResult<()>> },
    Stats { reply: oneshot::Sender<DecoderStats> },
}

struct PendingReset {
    outcome: oneshot::Receiver<ResetOutcome>,
    done: oneshot::Sender<BciResult<()>>,
}

pub(crate) struct DecoderTask {
    pub decoder: FrameDecoder,
    pub samples: mpsc::Sender<Sample>,
    pub gains: watch::Receiver<GainVector>,
    pub control: mpsc::Receiver<DecoderControl>,
    pub resets: mpsc::Sender<ResetRequest>,
    pub gap_fill_pacing: Duration,
    pub shutdown: CancellationToken,
}

/// Why the decoder stopped mid-chunk
enum Halt {
    /// Consumer of the decoded samples has gone away
    SamplesClosed,
    Shutdown,
}

impl DecoderTask {
    pub(crate) async fn run(mut self, input: ByteStream) -> BciResult<()> {
        let mut input = Some(input);
        let mut pending: Option<PendingReset> = None;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(control) = self.control.recv() => {
                    self.handle_control(control, &mut input, &mut pending).await;
                    Ok(())
                }
                outcome = reset_outcome(&mut pending) => {
                    let Some(PendingReset { done, .. }) = pending.take() else {
                        continue;
                    };
                    match outcome {
                        Ok(ResetOutcome { input: stream, leftover, result }) => {
                            input = Some(stream);
                            let step = self.push_bytes(&leftover).await;
                            // The caller may have given up waiting
                            let _ = done.send(result);
                            step
                        }
                        Err(_) => {
                            let _ = done.send(Err(BciError::ChannelClosed { channel: "device reset" }));
                            return Err(BciError::ChannelClosed { channel: "device read events" });
                        }
                    }
                }
                event = next_event(&mut input) => match event {
                    Some(DeviceEvent::Data(bytes)) => self.push_bytes(&bytes).await,
                    Some(DeviceEvent::Timeout) => {
                        let gains = *self.gains.borrow();
                        let sample = self.decoder.heartbeat(&gains);
                        self.emit(sample).await
                    }
                    None => {
                        debug!("Read events closed, stopping decoder");
                        break;
                    }
                },
            };

            match step {
                Ok(()) => {}
                Err(Halt::SamplesClosed) => {
                    debug!("Sample consumer gone, stopping decoder");
                    break;
                }
                Err(Halt::Shutdown) => break,
            }
        }

        let stats = self.decoder.stats();
        info!(
            frames = stats.frames,
            gap_fills = stats.gap_fills,
            desyncs = stats.desyncs,
            heartbeats = stats.heartbeats,
            "Decoder stopped"
        );
        Ok(())
    }

    async fn handle_control(
        &mut self,
        control: DecoderControl,
        input: &mut Option<ByteStream>,
        pending: &mut Option<PendingReset>,
    ) {
        match control {
            DecoderControl::Stats { reply } => {
                let _ = reply.send(self.decoder.stats());
            }
            DecoderControl::Reset { done } => {
                let Some(stream) = input.take() else {
                    let _ = done.send(Err(BciError::ResetInProgress));
                    return;
                };

                self.decoder.reset();
                let (reply, outcome) = oneshot::channel();
                match self.resets.send(ResetRequest { input: stream, reply }).await {
                    Ok(()) => *pending = Some(PendingReset { outcome, done }),
                    Err(mpsc::error::SendError(request)) => {
                        warn!("Device command loop gone, reset skipped");
                        *input = Some(request.input);
                        let _ = done.send(Err(BciError::ChannelClosed { channel: "device commands" }));
                    }
                }
            }
        }
    }

    async fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), Halt> {
        // One gain snapshot per chunk
        let gains = *self.gains.borrow();
        for &byte in bytes {
            match self.decoder.push(byte, &gains) {
                None => {}
                Some(DecodeEvent::Frame(sample)) => self.emit(sample).await?,
                Some(DecodeEvent::GapFill(fills)) => {
                    for sample in fills {
                        self.emit(sample).await?;
                        self.pace().await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn emit(&self, sample: Sample) -> Result<(), Halt> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Halt::Shutdown),
            sent = self.samples.send(sample) => sent.map_err(|_| Halt::SamplesClosed),
        }
    }

    /// Spacing between gap fills; quits early on shutdown
    async fn pace(&self) -> Result<(), Halt> {
        if self.gap_fill_pacing.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Halt::Shutdown),
            _ = tokio::time::sleep(self.gap_fill_pacing) => Ok(()),
        }
    }
}

async fn next_event(input: &mut Option<ByteStream>) -> Option<DeviceEvent> {
    match input.as_mut() {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

async fn reset_outcome(
    pending: &mut Option<PendingReset>,
) -> Result<ResetOutcome, oneshot::error::RecvError> {
    match pending.as_mut() {
        Some(reset) => (&mut reset.outcome).await,
        None => std::future::pending().await,
    }
}
