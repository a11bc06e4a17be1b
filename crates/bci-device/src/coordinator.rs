//! Device coordinator
//!
//! Owns the transport. Three activities share it:
//! - the read loop turns bounded reads into [`DeviceEvent`]s for the decoder,
//! - the command loop serializes every write,
//! - the reset protocol, spawned per reset request, takes custody of the
//!   read-event stream while it talks to the board and hands it back once the
//!   board has started streaming again.
//!
//! The read-event receiver is moved, never shared: at any instant exactly one
//! of the decoder or the reset protocol owns it, so no byte is read twice and
//! no byte produced during the handshake reaches the decoder.

use crate::config::{Command, ControlCommands, DeviceConfig};
use crate::decode_task::{DecoderControl, DecoderTask};
use crate::decoder::{DecoderStats, FrameDecoder};
use bci_core::{BciError, BciResult, GainVector, Sample};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the read loop observed on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Bytes in arrival order
    Data(Vec<u8>),
    /// No bytes within the read timeout, or end of stream
    Timeout,
}

/// The delivery path from the read loop to its current consumer
pub type ByteStream = mpsc::Receiver<DeviceEvent>;

/// Reset request from the decoder: the decoder gives up its input for the
/// duration of the handshake
pub(crate) struct ResetRequest {
    pub input: ByteStream,
    pub reply: oneshot::Sender<ResetOutcome>,
}

/// The input handed back after a reset, with any bytes that followed the
/// ready banner in the last chunk the protocol read
pub(crate) struct ResetOutcome {
    pub input: ByteStream,
    pub leftover: Vec<u8>,
    pub result: BciResult<()>,
}

/// Cloneable front door to a running device
#[derive(Clone)]
pub struct DeviceHandle {
    writes: mpsc::Sender<Vec<u8>>,
    decoder: mpsc::Sender<DecoderControl>,
    commands: ControlCommands,
    stopped: CancellationToken,
}

impl DeviceHandle {
    /// Queue bytes for the device. Delivery is best effort: a failed write is
    /// logged by the command loop and not retried.
    pub async fn write(&self, bytes: impl Into<Vec<u8>>) -> BciResult<()> {
        self.writes
            .send(bytes.into())
            .await
            .map_err(|_| BciError::ChannelClosed { channel: "device writes" })
    }

    /// Queue a control command
    pub async fn send(&self, command: Command) -> BciResult<()> {
        self.write(vec![self.commands.byte(command)]).await
    }

    /// Run the reset handshake; resolves once the board streams again and the
    /// decoder has its input back
    pub async fn reset(&self) -> BciResult<()> {
        let (done, result) = oneshot::channel();
        self.decoder
            .send(DecoderControl::Reset { done })
            .await
            .map_err(|_| BciError::ChannelClosed { channel: "decoder control" })?;
        result
            .await
            .map_err(|_| BciError::ChannelClosed { channel: "decoder control" })?
    }

    /// Resolves once the device tasks are stopping, either on shutdown or
    /// after a fatal transport error
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    pub async fn stats(&self) -> BciResult<DecoderStats> {
        let (reply, stats) = oneshot::channel();
        self.decoder
            .send(DecoderControl::Stats { reply })
            .await
            .map_err(|_| BciError::ChannelClosed { channel: "decoder control" })?;
        stats
            .await
            .map_err(|_| BciError::ChannelClosed { channel: "decoder control" })
    }
}

/// Join handles of the device tasks
pub struct DeviceTasks {
    read: JoinHandle<BciResult<()>>,
    command: JoinHandle<BciResult<()>>,
    decoder: JoinHandle<BciResult<()>>,
}

impl DeviceTasks {
    /// Wait for all device tasks, returning the first error.
    /// A fatal read error takes precedence.
    pub async fn join(self) -> BciResult<()> {
        let read = flatten(self.read.await);
        let command = flatten(self.command.await);
        let decoder = flatten(self.decoder.await);
        read.and(command).and(decoder)
    }
}

fn flatten(joined: Result<BciResult<()>, tokio::task::JoinError>) -> BciResult<()> {
    joined.unwrap_or_else(|e| {
        error!("Device task aborted: {}", e);
        Err(BciError::ChannelClosed { channel: "device task" })
    })
}

/// Start the read loop, command loop and decoder over `transport`.
///
/// Decoded samples go to `samples`; gain snapshots are read from `gains`.
/// Cancelling `shutdown` stops everything; a fatal read error stops the
/// device tasks on its own and is reported by [`DeviceTasks::join`].
pub fn spawn_device<T>(
    transport: T,
    config: &DeviceConfig,
    samples: mpsc::Sender<Sample>,
    gains: watch::Receiver<GainVector>,
    shutdown: &CancellationToken,
) -> (DeviceHandle, DeviceTasks)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let token = shutdown.child_token();
    let (reader, writer) = tokio::io::split(transport);

    let (event_tx, event_rx) = mpsc::channel(config.event_queue);
    let (write_tx, write_rx) = mpsc::channel(config.write_queue);
    let (reset_tx, reset_rx) = mpsc::channel(1);
    let (control_tx, control_rx) = mpsc::channel(8);

    let read = {
        let token = token.clone();
        let settings = ReadSettings {
            timeout: config.read_timeout(),
            buffer_size: config.read_buffer_size,
        };
        tokio::spawn(async move {
            let result = read_loop(reader, event_tx, settings, token.clone()).await;
            if result.is_err() {
                token.cancel();
            }
            result
        })
    };

    let protocol = ResetProtocol {
        writes: write_tx.clone(),
        commands: config.commands,
        stop_settle: config.stop_settle(),
        banner_marker: config.banner.marker,
        banner_count: config.banner.count,
        banner_timeout: config.banner_timeout(),
    };
    let command = tokio::spawn(command_loop(
        writer,
        write_rx,
        reset_rx,
        protocol,
        token.clone(),
    ));

    let decoder = DecoderTask {
        decoder: FrameDecoder::new(config.sync_threshold, config.decoding),
        samples,
        gains,
        control: control_rx,
        resets: reset_tx,
        gap_fill_pacing: config.gap_fill_pacing(),
        shutdown: token.clone(),
    };
    let decoder = tokio::spawn(decoder.run(event_rx));

    let handle = DeviceHandle {
        writes: write_tx,
        decoder: control_tx,
        commands: config.commands,
        stopped: token,
    };
    (handle, DeviceTasks { read, command, decoder })
}

#[derive(Debug, Clone, Copy)]
struct ReadSettings {
    timeout: Duration,
    buffer_size: usize,
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

async fn read_loop<R>(
    mut reader: R,
    events: mpsc::Sender<DeviceEvent>,
    settings: ReadSettings,
    shutdown: CancellationToken,
) -> BciResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; settings.buffer_size];
    loop {
        let started = Instant::now();
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            read = timeout(settings.timeout, reader.read(&mut buf)) => read,
        };

        let event = match read {
            Err(_) => DeviceEvent::Timeout,
            Ok(Ok(0)) => {
                // End of stream: wait out the rest of the read window so a
                // closed transport yields heartbeats at the timeout rate
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = sleep(settings.timeout.saturating_sub(started.elapsed())) => {}
                }
                DeviceEvent::Timeout
            }
            Ok(Ok(n)) => DeviceEvent::Data(buf[..n].to_vec()),
            Ok(Err(e)) if is_transient(e.kind()) => DeviceEvent::Timeout,
            Ok(Err(e)) => {
                error!("Error reading from device: {}", e);
                return Err(BciError::transport("read", e));
            }
        };

        if events.send(event).await.is_err() {
            debug!("Read events consumer gone, stopping read loop");
            return Ok(());
        }
    }
}

async fn command_loop<W>(
    mut writer: W,
    mut writes: mpsc::Receiver<Vec<u8>>,
    mut resets: mpsc::Receiver<ResetRequest>,
    protocol: ResetProtocol,
    shutdown: CancellationToken,
) -> BciResult<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(bytes) = writes.recv() => write_logged(&mut writer, &bytes).await,
            Some(request) = resets.recv() => {
                tokio::spawn(protocol.clone().run(request));
            }
            else => break,
        }
    }

    // Leave the board idle, then release the transport
    write_logged(&mut writer, &[protocol.commands.stop]).await;
    if let Err(e) = writer.shutdown().await {
        warn!("Error closing device transport: {}", e);
    }
    info!("Safely closed the device");
    Ok(())
}

async fn write_logged<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) {
    let result = async {
        writer.write_all(bytes).await?;
        writer.flush().await
    }
    .await;
    match result {
        Ok(()) => debug!(?bytes, "Wrote {} byte(s) to the device", bytes.len()),
        Err(e) => warn!(?bytes, "Error writing {} byte(s) to the device: {}", bytes.len(), e),
    }
}

/// Stop, query, wait for the ready banner, start
#[derive(Clone)]
struct ResetProtocol {
    writes: mpsc::Sender<Vec<u8>>,
    commands: ControlCommands,
    stop_settle: Duration,
    banner_marker: u8,
    banner_count: usize,
    banner_timeout: Duration,
}

impl ResetProtocol {
    async fn run(self, request: ResetRequest) {
        let ResetRequest { input, reply } = request;
        let mut drain = BannerScan::new(input, self.banner_marker, self.banner_count);

        let result = self.handshake(&mut drain).await;
        match &result {
            Ok(()) => info!("Device reset complete"),
            Err(e) => warn!("Device reset failed: {}", e),
        }

        let (input, leftover) = drain.into_parts();
        if reply.send(ResetOutcome { input, leftover, result }).is_err() {
            debug!("Decoder gone before reset finished");
        }
    }

    async fn handshake(&self, drain: &mut BannerScan) -> BciResult<()> {
        self.send(Command::Stop).await?;
        drain.discard_for(self.stop_settle).await?;
        self.send(Command::Query).await?;

        match timeout(self.banner_timeout, drain.find_banner()).await {
            Ok(found) => found?,
            Err(_) => {
                return Err(BciError::ResetTimeout {
                    waited_ms: self.banner_timeout.as_millis() as u64,
                })
            }
        }

        self.send(Command::Start).await
    }

    async fn send(&self, command: Command) -> BciResult<()> {
        self.writes
            .send(vec![self.commands.byte(command)])
            .await
            .map_err(|_| BciError::ChannelClosed { channel: "device writes" })
    }
}

/// Consumes the read-event stream during a reset
struct BannerScan {
    input: ByteStream,
    marker: u8,
    count: usize,
    run: usize,
    leftover: Vec<u8>,
}

impl BannerScan {
    fn new(input: ByteStream, marker: u8, count: usize) -> Self {
        BannerScan { input, marker, count, run: 0, leftover: Vec::new() }
    }

    async fn next(&mut self) -> BciResult<DeviceEvent> {
        self.input
            .recv()
            .await
            .ok_or(BciError::ChannelClosed { channel: "device read events" })
    }

    /// Drop whatever the board still sends while it stops
    async fn discard_for(&mut self, settle: Duration) -> BciResult<()> {
        let deadline = Instant::now() + settle;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                event = self.next() => {
                    if let DeviceEvent::Data(bytes) = event? {
                        debug!("Discarded {} byte(s) while the device stopped", bytes.len());
                    }
                }
            }
        }
    }

    /// Read until `count` consecutive markers; bytes after the last marker
    /// are kept for the decoder
    async fn find_banner(&mut self) -> BciResult<()> {
        loop {
            let bytes = match self.next().await? {
                DeviceEvent::Data(bytes) => bytes,
                DeviceEvent::Timeout => continue,
            };
            for (i, &b) in bytes.iter().enumerate() {
                if b == self.marker {
                    self.run += 1;
                    if self.run == self.count {
                        self.leftover = bytes[i + 1..].to_vec();
                        return Ok(());
                    }
                } else {
                    self.run = 0;
                }
            }
        }
    }

    fn into_parts(self) -> (ByteStream, Vec<u8>) {
        (self.input, self.leftover)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::tests::stream;
    use bci_core::SampleOrigin;
    use tokio::io::{duplex, DuplexStream};

    struct Rig {
        device: DuplexStream,
        handle: DeviceHandle,
        tasks: DeviceTasks,
        samples: mpsc::Receiver<Sample>,
        shutdown: CancellationToken,
        _gains: watch::Sender<GainVector>,
    }

    fn rig(config: DeviceConfig) -> Rig {
        let (host, device) = duplex(4096);
        let (sample_tx, samples) = mpsc::channel(1024);
        let (gains_tx, gains_rx) = watch::channel(GainVector::default());
        let shutdown = CancellationToken::new();
        let (handle, tasks) = spawn_device(host, &config, sample_tx, gains_rx, &shutdown);
        Rig { device, handle, tasks, samples, shutdown, _gains: gains_tx }
    }

    async fn next_decoded(samples: &mut mpsc::Receiver<Sample>) -> Sample {
        loop {
            let sample = samples.recv().await.unwrap();
            if sample.origin == SampleOrigin::Decoded {
                return sample;
            }
        }
    }

    async fn read_byte(device: &mut DuplexStream) -> u8 {
        let mut b = [0u8; 1];
        device.read_exact(&mut b).await.unwrap();
        b[0]
    }

    #[tokio::test]
    async fn test_frames_flow_to_samples() {
        let mut rig = rig(DeviceConfig::fast());
        rig.device.write_all(&stream(&[1, 2, 3])).await.unwrap();

        for expected in 1..=3u8 {
            let sample = next_decoded(&mut rig.samples).await;
            assert_eq!(sample.sequence, expected);
        }

        assert_eq!(rig.handle.stats().await.unwrap().frames, 3);
        rig.shutdown.cancel();
        rig.tasks.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_silence_produces_heartbeats() {
        let mut rig = rig(DeviceConfig::fast());
        let sample = rig.samples.recv().await.unwrap();
        assert_eq!(sample.origin, SampleOrigin::Heartbeat);
        assert_eq!(sample.quality, 0);
        rig.shutdown.cancel();
        rig.tasks.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_are_forwarded_and_stop_sent_on_close() {
        let mut rig = rig(DeviceConfig::fast());
        rig.handle.write(b"x1060110X".to_vec()).await.unwrap();
        rig.handle.send(Command::Start).await.unwrap();

        let mut written = vec![0u8; 10];
        rig.device.read_exact(&mut written).await.unwrap();
        assert_eq!(&written, b"x1060110Xb");

        rig.shutdown.cancel();
        rig.tasks.join().await.unwrap();
        assert_eq!(read_byte(&mut rig.device).await, b's');
    }

    #[tokio::test]
    async fn test_reset_diverts_handshake_bytes() {
        let config = DeviceConfig::fast();
        let mut rig = rig(config.clone());
        let handle = rig.handle.clone();
        let reset = tokio::spawn(async move { handle.reset().await });

        // Board side of the handshake
        assert_eq!(read_byte(&mut rig.device).await, config.commands.stop);
        // Stale frame still in flight while the board stops
        rig.device.write_all(&stream(&[9])).await.unwrap();
        assert_eq!(read_byte(&mut rig.device).await, config.commands.query);
        // Banner text, which also contains frame-like bytes
        let mut banner = b"OpenBCI V3 8-16 channel\nOn Board ADS1299 Device ID: 0x3E\n".to_vec();
        banner.extend(stream(&[50]));
        banner.extend(b"$$$");
        rig.device.write_all(&banner).await.unwrap();
        assert_eq!(read_byte(&mut rig.device).await, config.commands.start);

        reset.await.unwrap().unwrap();

        rig.device.write_all(&stream(&[0, 1])).await.unwrap();
        let decoded = vec![
            next_decoded(&mut rig.samples).await.sequence,
            next_decoded(&mut rig.samples).await.sequence,
        ];
        // Nothing from between stop and the banner was decoded
        assert_eq!(decoded, vec![0, 1]);
        assert_eq!(rig.handle.stats().await.unwrap().frames, 2);

        rig.shutdown.cancel();
        rig.tasks.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_bytes_after_banner_reach_decoder() {
        let config = DeviceConfig::fast();
        let mut rig = rig(config.clone());
        let handle = rig.handle.clone();
        let reset = tokio::spawn(async move { handle.reset().await });

        assert_eq!(read_byte(&mut rig.device).await, config.commands.stop);
        assert_eq!(read_byte(&mut rig.device).await, config.commands.query);
        let mut reply = b"$$$".to_vec();
        reply.extend(stream(&[3]));
        rig.device.write_all(&reply).await.unwrap();
        assert_eq!(read_byte(&mut rig.device).await, config.commands.start);
        reset.await.unwrap().unwrap();

        let sample = next_decoded(&mut rig.samples).await;
        assert_eq!(sample.sequence, 3);

        rig.shutdown.cancel();
        rig.tasks.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_times_out_without_banner() {
        let config = DeviceConfig {
            banner: crate::config::BannerConfig { timeout_ms: 100, ..Default::default() },
            ..DeviceConfig::fast()
        };
        let mut rig = rig(config);
        let result = rig.handle.reset().await;
        assert!(matches!(result, Err(BciError::ResetTimeout { .. })));

        // The decoder has its input back
        rig.device.write_all(&stream(&[4])).await.unwrap();
        let sample = next_decoded(&mut rig.samples).await;
        assert_eq!(sample.sequence, 4);

        rig.shutdown.cancel();
        rig.tasks.join().await.unwrap();
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::new(ErrorKind::BrokenPipe, "unplugged")))
        }
    }

    #[tokio::test]
    async fn test_fatal_read_error_propagates() {
        let (tx, mut rx) = mpsc::channel(4);
        let settings = ReadSettings { timeout: Duration::from_millis(50), buffer_size: 8 };
        let result = read_loop(FailingReader, tx, settings, CancellationToken::new()).await;

        assert!(matches!(result, Err(BciError::Transport { operation: "read", .. })));
        assert!(rx.recv().await.is_none());
    }

    struct BrokenTransport;

    impl AsyncRead for BrokenTransport {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut FailingReader).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrokenTransport {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_fatal_error_stops_device_tasks() {
        let (sample_tx, _samples) = mpsc::channel(16);
        let (_gains, gains_rx) = watch::channel(GainVector::default());
        let shutdown = CancellationToken::new();
        let (handle, tasks) =
            spawn_device(BrokenTransport, &DeviceConfig::fast(), sample_tx, gains_rx, &shutdown);

        handle.stopped().await;
        let result = tasks.join().await;
        assert!(matches!(result, Err(ref e) if e.is_fatal()));
        assert!(!shutdown.is_cancelled());
    }
}
