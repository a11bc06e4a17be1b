//! Per-subscriber delivery loop

use crate::config::HubConfig;
use crate::hub::{HubHandle, Subscription};
use async_trait::async_trait;
use bci_core::{BciError, BciResult, Message};
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outbound transport of one subscriber
#[async_trait]
pub trait SubscriberSink: Send {
    async fn send_message(&mut self, message: &Message) -> BciResult<()>;

    /// Keep-alive frame with no payload
    async fn send_ping(&mut self) -> BciResult<()>;

    /// Release the transport
    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy)]
pub struct DeliverySettings {
    pub ping_period: Duration,
    pub write_timeout: Duration,
}

impl From<&HubConfig> for DeliverySettings {
    fn from(config: &HubConfig) -> Self {
        DeliverySettings {
            ping_period: config.ping_period(),
            write_timeout: config.write_timeout(),
        }
    }
}

async fn bounded<F>(limit: Duration, write: F) -> BciResult<()>
where
    F: std::future::Future<Output = BciResult<()>>,
{
    timeout(limit, write).await.unwrap_or_else(|_| {
        Err(BciError::transport(
            "subscriber write",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out"),
        ))
    })
}

/// Drain `subscription` into `sink` and ping on a timer.
///
/// Ends when the hub closes the queue, when `closed` is cancelled, or on the
/// first failed write; then unregisters and closes the sink.
pub async fn run_subscriber<S: SubscriberSink>(
    mut sink: S,
    subscription: Subscription,
    hub: HubHandle,
    settings: DeliverySettings,
    closed: CancellationToken,
) {
    let Subscription { id, mut queue } = subscription;
    let mut pings = interval_at(Instant::now() + settings.ping_period, settings.ping_period);
    pings.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        let written = tokio::select! {
            _ = closed.cancelled() => break "connection closed".to_string(),
            message = queue.recv() => match message {
                Some(message) => bounded(settings.write_timeout, sink.send_message(&message)).await,
                None => break "dropped by hub".to_string(),
            },
            _ = pings.tick() => bounded(settings.write_timeout, sink.send_ping()).await,
        };
        if let Err(e) = written {
            break e.to_string();
        }
    };

    info!(%id, %reason, "Subscriber delivery ended");
    if let Err(e) = hub.unregister(id).await {
        debug!(%id, "Hub already stopped: {}", e);
    }
    sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Message(String),
        Ping,
        Closed,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<Sent>>>,
        fail_after: Option<usize>,
    }

    impl Recorder {
        fn log(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        fn push(&self, sent: Sent) -> BciResult<()> {
            let mut log = self.sent.lock().unwrap();
            if self.fail_after.is_some_and(|n| log.len() >= n) {
                return Err(BciError::transport(
                    "subscriber write",
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"),
                ));
            }
            log.push(sent);
            Ok(())
        }
    }

    #[async_trait]
    impl SubscriberSink for Recorder {
        async fn send_message(&mut self, message: &Message) -> BciResult<()> {
            self.push(Sent::Message(message.name().to_string()))
        }

        async fn send_ping(&mut self) -> BciResult<()> {
            self.push(Sent::Ping)
        }

        async fn close(&mut self) {
            self.sent.lock().unwrap().push(Sent::Closed);
        }
    }

    fn settings(ping_ms: u64) -> DeliverySettings {
        DeliverySettings {
            ping_period: Duration::from_millis(ping_ms),
            write_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_delivers_in_order_and_closes_when_dropped() {
        let (hub, hub_task) = Hub::start(&HubConfig::default());
        let subscription = hub.register().await.unwrap();
        let id = subscription.id;
        let recorder = Recorder::default();
        let task = tokio::spawn(run_subscriber(
            recorder.clone(),
            subscription,
            hub.clone(),
            settings(60_000),
            CancellationToken::new(),
        ));

        hub.broadcast(Message::raw(Default::default())).await.unwrap();
        hub.broadcast(Message::fft_bins(vec![])).await.unwrap();
        while recorder.log().len() < 2 {
            tokio::task::yield_now().await;
        }
        hub.unregister(id).await.unwrap();
        task.await.unwrap();

        assert_eq!(
            recorder.log(),
            vec![Sent::Message("raw".into()), Sent::Message("fftBins".into()), Sent::Closed]
        );
        hub.stop().await.unwrap();
        hub_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pings_and_failed_write_unregisters() {
        let (hub, hub_task) = Hub::start(&HubConfig::default());
        let subscription = hub.register().await.unwrap();
        let recorder = Recorder { fail_after: Some(2), ..Recorder::default() };
        let task = tokio::spawn(run_subscriber(
            recorder.clone(),
            subscription,
            hub.clone(),
            settings(10),
            CancellationToken::new(),
        ));

        task.await.unwrap();
        assert_eq!(recorder.log(), vec![Sent::Ping, Sent::Ping, Sent::Closed]);
        assert_eq!(hub.subscriber_count().await.unwrap(), 0);

        hub.stop().await.unwrap();
        hub_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_closes_sink() {
        let (hub, hub_task) = Hub::start(&HubConfig::default());
        let subscription = hub.register().await.unwrap();
        let recorder = Recorder::default();
        let closed = CancellationToken::new();
        let task = tokio::spawn(run_subscriber(
            recorder.clone(),
            subscription,
            hub.clone(),
            settings(60_000),
            closed.clone(),
        ));

        closed.cancel();
        task.await.unwrap();
        assert_eq!(recorder.log(), vec![Sent::Closed]);
        assert_eq!(hub.subscriber_count().await.unwrap(), 0);

        hub.stop().await.unwrap();
        hub_task.await.unwrap();
    }
}
