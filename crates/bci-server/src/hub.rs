//! Broadcast hub
//!
//! Registry of subscriber queues. Broadcasting never waits on a subscriber:
//! each message is offered to every queue without blocking, and a subscriber
//! whose queue is full is dropped on the spot. Dropping the hub's sender
//! closes the subscriber's queue, which ends its delivery loop.

use crate::config::HubConfig;
use bci_core::{BciError, BciResult, Message};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// A registered subscriber's end of its queue
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub queue: mpsc::Receiver<Arc<Message>>,
}

enum HubCommand {
    Register { reply: oneshot::Sender<Subscription> },
    Unregister { id: SubscriberId },
    Count { reply: oneshot::Sender<usize> },
    Stop,
}

/// Cloneable handle to a running hub
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    broadcasts: mpsc::Sender<Arc<Message>>,
}

impl HubHandle {
    /// Register a new subscriber with a queue of the configured capacity
    pub async fn register(&self) -> BciResult<Subscription> {
        let (reply, subscription) = oneshot::channel();
        self.command(HubCommand::Register { reply }).await?;
        subscription.await.map_err(|_| BciError::ChannelClosed { channel: "hub" })
    }

    /// Remove a subscriber; a no-op if it is already gone
    pub async fn unregister(&self, id: SubscriberId) -> BciResult<()> {
        self.command(HubCommand::Unregister { id }).await
    }

    pub async fn subscriber_count(&self) -> BciResult<usize> {
        let (reply, count) = oneshot::channel();
        self.command(HubCommand::Count { reply }).await?;
        count.await.map_err(|_| BciError::ChannelClosed { channel: "hub" })
    }

    /// Queue a message for every subscriber
    pub async fn broadcast(&self, message: Message) -> BciResult<()> {
        self.broadcasts
            .send(Arc::new(message))
            .await
            .map_err(|_| BciError::ChannelClosed { channel: "hub broadcast" })
    }

    /// Producer end of the broadcast queue, for the pipeline
    pub fn broadcaster(&self) -> mpsc::Sender<Arc<Message>> {
        self.broadcasts.clone()
    }

    /// Ask the hub to drop every subscriber and exit
    pub async fn stop(&self) -> BciResult<()> {
        self.command(HubCommand::Stop).await
    }

    async fn command(&self, command: HubCommand) -> BciResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BciError::ChannelClosed { channel: "hub" })
    }
}

pub struct Hub {
    subscribers: HashMap<SubscriberId, mpsc::Sender<Arc<Message>>>,
    next_id: u64,
    queue_capacity: usize,
}

impl Hub {
    /// Spawn the hub dispatch loop
    pub fn start(config: &HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::channel(config.command_queue.max(1));
        let (broadcasts_tx, broadcasts) = mpsc::channel(config.broadcast_queue.max(1));
        let hub = Hub {
            subscribers: HashMap::new(),
            next_id: 0,
            queue_capacity: config.subscriber_queue.max(1),
        };
        let task = tokio::spawn(hub.run(commands, broadcasts));
        (HubHandle { commands: commands_tx, broadcasts: broadcasts_tx }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<HubCommand>,
        mut broadcasts: mpsc::Receiver<Arc<Message>>,
    ) {
        info!("Hub started");
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(HubCommand::Stop) | None => break,
                    Some(command) => self.handle(command),
                },
                Some(message) = broadcasts.recv() => self.broadcast(message),
            }
        }
        let dropped = self.subscribers.len();
        self.subscribers.clear();
        info!(dropped, "Hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { reply } => {
                let id = SubscriberId(self.next_id);
                self.next_id += 1;
                let (queue_tx, queue) = mpsc::channel(self.queue_capacity);
                if reply.send(Subscription { id, queue }).is_ok() {
                    self.subscribers.insert(id, queue_tx);
                    info!(%id, total = self.subscribers.len(), "Subscriber registered");
                }
            }
            HubCommand::Unregister { id } => {
                if self.subscribers.remove(&id).is_some() {
                    info!(%id, total = self.subscribers.len(), "Subscriber unregistered");
                }
            }
            HubCommand::Count { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
            HubCommand::Stop => {}
        }
    }

    fn broadcast(&mut self, message: Arc<Message>) {
        self.subscribers.retain(|id, queue| match queue.try_send(Arc::clone(&message)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%id, "Subscriber queue full, dropping subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%id, "Subscriber queue closed, removing");
                false
            }
        });
    }
}
