//! Simulated acquisition board
//!
//! Speaks the board's side of the serial protocol over an in-memory duplex
//! pipe: it answers the control commands, prints the version banner after a
//! soft reset and streams synthetic frames while started.

use crate::config::{Command, ControlCommands};
use bci_core::codec::{I24_MAX, I24_MIN};
use bci_core::{config_error, BciResult, ByteOrder, RawFrame, AUX_CHANNELS, CHANNELS};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DEFAULT_BANNER: &str =
    "OpenBCI V3 8-16 channel\nOn Board ADS1299 Device ID: 0x3E\nFirmware: v3.1.2\n$$$";

/// Simulated board configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Frames per second while streaming
    pub sample_rate: f64,
    /// Sine frequency of channel 1; channel n runs at n times this
    pub base_frequency: f64,
    /// Sine amplitude in ADC codes
    pub amplitude: f64,
    /// Standard deviation of the additive Gaussian noise, in ADC codes
    pub noise_std: f64,
    /// Random seed for reproducibility
    pub seed: Option<u64>,
    /// Skip every n-th frame to exercise gap recovery
    pub drop_every: Option<u32>,
    pub commands: ControlCommands,
    /// Printed after a soft reset; must end with the ready marker
    pub banner: String,
    pub byte_order: ByteOrder,
    /// Capacity of the in-memory pipe in each direction
    pub pipe_capacity: usize,
}

impl Default for BoardConfig {
    fn default() -> Self {
        BoardConfig {
            sample_rate: 250.0,
            base_frequency: 2.0,
            amplitude: 50_000.0,
            noise_std: 500.0,
            seed: None,
            drop_every: None,
            commands: ControlCommands::default(),
            banner: DEFAULT_BANNER.to_string(),
            byte_order: ByteOrder::BigEndian,
            pipe_capacity: 64 * 1024,
        }
    }
}

struct FrameSynth {
    config: BoardConfig,
    rng: StdRng,
    noise: Normal<f64>,
    tick: u64,
    sequence: u8,
}

impl FrameSynth {
    fn new(config: BoardConfig) -> BciResult<Self> {
        if !(config.sample_rate > 0.0) {
            return Err(config_error!("board sample rate must be positive, got {}", config.sample_rate));
        }
        let noise = Normal::new(0.0, config.noise_std)
            .map_err(|e| config_error!("failed to create noise distribution: {}", e))?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(FrameSynth { config, rng, noise, tick: 0, sequence: 0 })
    }

    /// Next frame, or `None` when this tick is dropped
    fn next_frame(&mut self) -> Option<RawFrame> {
        let t = self.tick as f64 / self.config.sample_rate;
        let sequence = self.sequence;
        self.tick += 1;
        self.sequence = self.sequence.wrapping_add(1);

        if let Some(n) = self.config.drop_every.filter(|&n| n > 0) {
            if self.tick % n as u64 == 0 {
                return None;
            }
        }

        let mut codes = [0i32; CHANNELS];
        for (ch, code) in codes.iter_mut().enumerate() {
            let freq = self.config.base_frequency * (ch + 1) as f64;
            let value = self.config.amplitude * (2.0 * PI * freq * t).sin()
                + self.noise.sample(&mut self.rng);
            *code = (value.round() as i32).clamp(I24_MIN, I24_MAX);
        }
        let aux = [0i16; AUX_CHANNELS];
        Some(RawFrame::encode(sequence, &codes, &aux, self.config.byte_order))
    }
}

/// Start a simulated board; the returned stream is the host end of the pipe.
pub fn spawn_simulated_board(
    config: BoardConfig,
    shutdown: CancellationToken,
) -> BciResult<(DuplexStream, JoinHandle<BciResult<()>>)> {
    let (host, board) = duplex(config.pipe_capacity);
    let synth = FrameSynth::new(config)?;
    let task = tokio::spawn(run_board(board, synth, shutdown));
    Ok((host, task))
}

async fn run_board(
    mut pipe: DuplexStream,
    mut synth: FrameSynth,
    shutdown: CancellationToken,
) -> BciResult<()> {
    let commands = synth.config.commands;
    let mut ticks = interval(Duration::from_secs_f64(1.0 / synth.config.sample_rate));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut streaming = false;
    let mut buf = [0u8; 64];

    info!("Simulated board ready at {} Hz", synth.config.sample_rate);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            read = pipe.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for &byte in &buf[..n] {
                    match commands.command(byte) {
                        Some(Command::Stop) => streaming = false,
                        Some(Command::Start) => streaming = true,
                        Some(Command::Query) => {
                            streaming = false;
                            if pipe.write_all(synth.config.banner.as_bytes()).await.is_err() {
                                return Ok(());
                            }
                        }
                        None => debug!(byte, "Simulated board ignoring byte"),
                    }
                }
            }
            _ = ticks.tick() => {
                if !streaming {
                    continue;
                }
                if let Some(frame) = synth.next_frame() {
                    if pipe.write_all(frame.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    debug!("Simulated board stopped");
    Ok(())
}
