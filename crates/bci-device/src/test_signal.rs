//! Synthetic sine-wave samples for exercising the display path without
//! hardware

use bci_core::{Sample, SampleOrigin, CHANNELS, FULL_QUALITY};
use std::f64::consts::PI;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Time between generated samples
pub const TEST_SIGNAL_PERIOD: Duration = Duration::from_millis(4);

/// Phase advance per sample, in cycles (10 Hz at one sample every 4ms)
const PHASE_STEP: f64 = 0.04;

/// Same sine value on every channel
#[derive(Debug, Clone, Default)]
pub struct TestSignal {
    phase: f64,
    sequence: u8,
}

impl TestSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_sample(&mut self) -> Sample {
        self.phase += PHASE_STEP;
        let value = (2.0 * PI * self.phase).sin();
        let sample = Sample {
            channels: [value; CHANNELS],
            quality: FULL_QUALITY,
            ..Sample::silent(self.sequence, SampleOrigin::TestSignal)
        };
        self.sequence = self.sequence.wrapping_add(1);
        sample
    }
}

/// Emit test samples into `samples` while `toggle` holds `true`.
pub fn spawn_test_signal(
    samples: mpsc::Sender<Sample>,
    mut toggle: watch::Receiver<bool>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut signal = TestSignal::new();
        let mut ticks = interval(TEST_SIGNAL_PERIOD);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let on = *toggle.borrow_and_update();
            if !on {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = toggle.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!("Test signal {}", if *toggle.borrow() { "on" } else { "off" });
                        ticks.reset();
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    if samples.send(signal.next_sample()).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Test signal generator stopped");
    })
}
