//! Acquisition session: device, pipeline and hub wired together

use crate::config::ServerConfig;
use crate::hub::{Hub, HubHandle};
use crate::subscriber::DeliverySettings;
use crate::ws::AppState;
use bci_core::{BciError, BciResult, GainVector};
use bci_device::{spawn_device, spawn_simulated_board, spawn_test_signal, DeviceHandle, DeviceTasks};
use bci_processing::{run_pipeline, PipelineControl, SamplePipeline};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A running acquisition session
pub struct Session {
    /// Raw writes, reset handshake and decoder statistics
    pub device: DeviceHandle,
    /// Publish a new gain snapshot; applies from the next decoded chunk
    pub gains: watch::Sender<GainVector>,
    /// Window resizes and persistence sink attachment
    pub pipeline: mpsc::Sender<PipelineControl>,
    pub hub: HubHandle,
    /// Switch the synthetic test signal on or off
    pub test_signal: watch::Sender<bool>,
    delivery: DeliverySettings,
    shutdown: CancellationToken,
    device_tasks: DeviceTasks,
    pipeline_task: JoinHandle<BciResult<()>>,
    hub_task: JoinHandle<()>,
    test_signal_task: JoinHandle<()>,
    board_task: Option<JoinHandle<BciResult<()>>>,
}

impl Session {
    /// Open the configured serial port, or the simulated board when no port
    /// is set, and start streaming
    pub async fn start(config: &ServerConfig) -> BciResult<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();

        match &config.device.port {
            Some(port) => {
                info!("Opening serial port {} at {} baud", port, config.device.baud_rate);
                let serial = tokio_serial::new(port, config.device.baud_rate)
                    .open_native_async()
                    .map_err(|e| BciError::transport("open", std::io::Error::from(e)))?;
                Self::launch(serial, config, shutdown, None).await
            }
            None => {
                info!("No serial port configured, using the simulated board");
                let (pipe, board) = spawn_simulated_board(config.board.clone(), shutdown.child_token())?;
                Self::launch(pipe, config, shutdown, Some(board)).await
            }
        }
    }

    /// Start a session over an already-open transport
    pub async fn start_with_transport<T>(transport: T, config: &ServerConfig) -> BciResult<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        Self::launch(transport, config, CancellationToken::new(), None).await
    }

    async fn launch<T>(
        transport: T,
        config: &ServerConfig,
        shutdown: CancellationToken,
        board_task: Option<JoinHandle<BciResult<()>>>,
    ) -> BciResult<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let pipeline = SamplePipeline::new(&config.pipeline)?;

        let (hub, hub_task) = Hub::start(&config.hub);
        let (sample_tx, samples) = mpsc::channel(config.sample_queue);
        let (pipeline_tx, pipeline_rx) = mpsc::channel(config.pipeline.control_queue);
        let pipeline_task = tokio::spawn(run_pipeline(
            pipeline,
            samples,
            pipeline_rx,
            hub.broadcaster(),
            shutdown.clone(),
        ));

        let (test_signal, toggle) = watch::channel(false);
        let test_signal_task = spawn_test_signal(sample_tx.clone(), toggle, shutdown.clone());

        let (gains, gains_rx) = watch::channel(GainVector::default());
        let (device, device_tasks) =
            spawn_device(transport, &config.device, sample_tx, gains_rx, &shutdown);

        let session = Session {
            device,
            gains,
            pipeline: pipeline_tx,
            hub,
            test_signal,
            delivery: DeliverySettings::from(&config.hub),
            shutdown,
            device_tasks,
            pipeline_task,
            hub_task,
            test_signal_task,
            board_task,
        };

        if let Err(e) = session.device.reset().await {
            warn!("Initial device reset failed: {}", e);
        }
        info!("Acquisition session started");
        Ok(session)
    }

    /// State for the subscriber endpoint
    pub fn app_state(&self) -> AppState {
        AppState {
            hub: self.hub.clone(),
            delivery: self.delivery,
            shutdown: self.shutdown.clone(),
        }
    }

    /// Cancelled when the session shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every task and release the transport.
    ///
    /// Returns the first error any task ended with; a fatal transport error
    /// takes precedence.
    pub async fn shutdown(self) -> BciResult<()> {
        info!("Shutting down acquisition session");
        self.shutdown.cancel();

        let device = self.device_tasks.join().await;
        let pipeline = joined("pipeline", self.pipeline_task.await);

        if self.hub.stop().await.is_err() {
            warn!("Hub already stopped");
        }
        if let Err(e) = self.hub_task.await {
            error!("Hub task aborted: {}", e);
        }
        if let Err(e) = self.test_signal_task.await {
            error!("Test signal task aborted: {}", e);
        }
        let board = match self.board_task {
            Some(task) => joined("simulated board", task.await),
            None => Ok(()),
        };

        info!("Acquisition session stopped");
        device.and(pipeline).and(board)
    }
}

fn joined(task: &'static str, result: Result<BciResult<()>, tokio::task::JoinError>) -> BciResult<()> {
    result.unwrap_or_else(|e| {
        error!("{} task aborted: {}", task, e);
        Err(BciError::ChannelClosed { channel: task })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bci_core::MessageKind;
    use bci_device::{BoardConfig, DeviceConfig};
    use bci_processing::WindowSettings;

    fn fast_config() -> ServerConfig {
        ServerConfig {
            device: DeviceConfig::fast(),
            board: BoardConfig { seed: Some(1), ..BoardConfig::default() },
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_simulated_session_streams_messages() {
        let session = Session::start(&fast_config()).await.unwrap();
        let mut subscription = session.hub.register().await.unwrap();

        let message = subscription.queue.recv().await.unwrap();
        assert_eq!(message.kind(), MessageKind::Raw);
        assert!(session.device.stats().await.unwrap().frames > 0);

        session.shutdown().await.unwrap();
        // Buffered messages drain, then the queue reports closed
        while subscription.queue.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_gap_filled_stream_keeps_flowing() {
        let config = ServerConfig {
            board: BoardConfig { drop_every: Some(10), seed: Some(2), ..BoardConfig::default() },
            ..fast_config()
        };
        let session = Session::start(&config).await.unwrap();
        session
            .pipeline
            .send(PipelineControl::Resize(WindowSettings::new(32, 32).unwrap()))
            .await
            .unwrap();
        let mut subscription = session.hub.register().await.unwrap();

        loop {
            let message = subscription.queue.recv().await.unwrap();
            if message.kind() == MessageKind::Fft {
                assert_eq!(message.channel(0).unwrap().len(), 16);
                break;
            }
        }
        assert!(session.device.stats().await.unwrap().gap_fills > 0);

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_test_signal_feeds_pipeline() {
        let (host, _device) = tokio::io::duplex(1024);
        let config = ServerConfig {
            device: DeviceConfig {
                banner: bci_device::BannerConfig { timeout_ms: 20, ..Default::default() },
                ..DeviceConfig::fast()
            },
            ..ServerConfig::default()
        };
        let session = Session::start_with_transport(host, &config).await.unwrap();
        let mut subscription = session.hub.register().await.unwrap();
        session.test_signal.send(true).unwrap();

        let message = subscription.queue.recv().await.unwrap();
        assert_eq!(message.kind(), MessageKind::Raw);

        session.shutdown().await.unwrap();
    }
}
