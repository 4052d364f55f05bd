//! Single-owner coordination loop for live subscribers
//!
//! The registry of subscribers lives inside one task. Register, unregister and
//! publish arrive as commands over a bounded channel and are applied one at a time,
//! so the registry needs no locking. When the command queue is full, publishers wait.

use crate::config::HubConfig;
use crate::error::HubError;
use crate::events::LogRecord;
use crate::hub::subscriber::{ChannelSubscriber, Subscriber};
use crate::monitoring::SelfMonitoringCollector;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Identifier assigned to a subscriber at registration
pub type SubscriberId = u64;

enum Command {
    Register {
        stream_id: String,
        subscriber: Box<dyn Subscriber>,
        reply: oneshot::Sender<SubscriberId>,
    },
    Unregister {
        stream_id: String,
        id: SubscriberId,
    },
    Publish {
        record: LogRecord,
    },
    SubscriberCount {
        stream_id: String,
        reply: oneshot::Sender<usize>,
    },
}

/// The coordination loop and the registry it owns
pub struct Hub {
    commands: mpsc::Receiver<Command>,
    subscribers: HashMap<String, Vec<(SubscriberId, Box<dyn Subscriber>)>>,
    next_id: SubscriberId,
    monitoring: Option<Arc<SelfMonitoringCollector>>,
}

/// Cloneable handle used to talk to the hub
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    subscriber_buffer: usize,
}

/// A registered channel subscriber
pub struct Subscription {
    pub id: SubscriberId,
    pub stream_id: String,
    pub receiver: mpsc::Receiver<LogRecord>,
}

impl Subscription {
    /// Next live record, `None` once the hub dropped this subscriber
    pub async fn recv(&mut self) -> Option<LogRecord> {
        self.receiver.recv().await
    }
}

impl Hub {
    /// Create a hub and its handle
    pub fn new(config: &HubConfig) -> (Self, HubHandle) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let hub = Self {
            commands: receiver,
            subscribers: HashMap::new(),
            next_id: 1,
            monitoring: None,
        };
        let handle = HubHandle {
            commands: sender,
            subscriber_buffer: config.subscriber_buffer.max(1),
        };
        (hub, handle)
    }

    pub fn set_monitoring(&mut self, monitoring: Arc<SelfMonitoringCollector>) {
        self.monitoring = Some(monitoring);
    }

    /// Process commands until every handle is dropped
    pub async fn run(mut self) {
        info!("Hub started");
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        info!(
            "Hub stopped, dropping {} subscribers",
            self.subscribers.values().map(Vec::len).sum::<usize>()
        );
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                stream_id,
                subscriber,
                reply,
            } => {
                let id = self.next_id;
                self.next_id += 1;
                debug!("Subscriber {} registered on {}", id, stream_id);
                self.subscribers
                    .entry(stream_id)
                    .or_default()
                    .push((id, subscriber));
                // The caller may have given up waiting, the registration stands
                let _ = reply.send(id);
            }
            Command::Unregister { stream_id, id } => self.unregister(&stream_id, id),
            Command::Publish { record } => self.publish(&record),
            Command::SubscriberCount { stream_id, reply } => {
                let count = self.subscribers.get(&stream_id).map_or(0, Vec::len);
                let _ = reply.send(count);
            }
        }
    }

    fn unregister(&mut self, stream_id: &str, id: SubscriberId) {
        if let Some(list) = self.subscribers.get_mut(stream_id) {
            list.retain(|(subscriber_id, _)| *subscriber_id != id);
            if list.is_empty() {
                self.subscribers.remove(stream_id);
            }
            debug!("Subscriber {} unregistered from {}", id, stream_id);
        }
    }

    /// Deliver to every subscriber of the record's stream, dropping the ones that fail
    fn publish(&mut self, record: &LogRecord) {
        let Some(list) = self.subscribers.get_mut(&record.stream_id) else {
            return;
        };

        let monitoring = self.monitoring.as_deref();
        list.retain_mut(|(id, subscriber)| match subscriber.deliver(record) {
            Ok(()) => {
                if let Some(m) = monitoring {
                    m.record_delivery(true);
                }
                true
            }
            Err(e) => {
                warn!(
                    "Dropping subscriber {} on {}: {}",
                    id, record.stream_id, e
                );
                if let Some(m) = monitoring {
                    m.record_delivery(false);
                }
                false
            }
        });

        if list.is_empty() {
            self.subscribers.remove(&record.stream_id);
        }
    }
}

/// Start a hub on the current runtime
pub fn spawn(
    config: &HubConfig,
    monitoring: Option<Arc<SelfMonitoringCollector>>,
) -> (HubHandle, JoinHandle<()>) {
    let (mut hub, handle) = Hub::new(config);
    if let Some(monitoring) = monitoring {
        hub.set_monitoring(monitoring);
    }
    (handle, tokio::spawn(hub.run()))
}

impl HubHandle {
    /// Register a subscriber for a stream
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` if the coordination loop has stopped.
    pub async fn register(
        &self,
        stream_id: &str,
        subscriber: Box<dyn Subscriber>,
    ) -> Result<SubscriberId, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Register {
                stream_id: stream_id.to_string(),
                subscriber,
                reply,
            })
            .await
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Register a buffered channel subscriber for a stream
    pub async fn subscribe(&self, stream_id: &str) -> Result<Subscription, HubError> {
        let (subscriber, receiver) = ChannelSubscriber::new(self.subscriber_buffer);
        let id = self.register(stream_id, Box::new(subscriber)).await?;
        Ok(Subscription {
            id,
            stream_id: stream_id.to_string(),
            receiver,
        })
    }

    /// Remove a subscriber, unknown ids are ignored
    pub async fn unregister(&self, stream_id: &str, id: SubscriberId) -> Result<(), HubError> {
        self.commands
            .send(Command::Unregister {
                stream_id: stream_id.to_string(),
                id,
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Queue a record for delivery to its stream's subscribers
    ///
    /// Waits while the command queue is full.
    pub async fn publish(&self, record: LogRecord) -> Result<(), HubError> {
        self.commands
            .send(Command::Publish { record })
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn subscriber_count(&self, stream_id: &str) -> Result<usize, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::SubscriberCount {
                stream_id: stream_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)
    }
}
