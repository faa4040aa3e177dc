//! SubscriberHub - fans monitoring results out to live subscribers
//!
//! ## Message Flow
//!
//! ```text
//! Orchestrator ──broadcast (try_send, 100 slots)──→ SubscriberHub ──try_send──→ [ws client, ws client, ...]
//!                                                       ↑
//!                                     Commands (Subscribe, Unsubscribe, Count, Shutdown)
//! ```
//!
//! The actor owns the subscriber set, nobody else touches it. Each result is
//! serialized to JSON once and the same text is delivered to every subscriber.
//! A subscriber whose queue is full misses that result; a subscriber whose
//! receiver is gone is removed.

use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, trace, warn};

use crate::MonitoringResult;
use crate::monitoring::ResultBroadcaster;

/// Capacity of the inbound result queue
pub const BROADCAST_BUFFER: usize = 100;

/// Capacity of every subscriber queue
pub const SUBSCRIBER_BUFFER: usize = 256;

pub type SubscriberId = u64;

/// A live subscription; dropping the receiver unsubscribes lazily
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<String>,
}

#[derive(Debug)]
enum HubCommand {
    Subscribe {
        respond_to: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: SubscriberId,
    },
    SubscriberCount {
        respond_to: oneshot::Sender<usize>,
    },
    Shutdown,
}

struct SubscriberHub {
    result_rx: mpsc::Receiver<MonitoringResult>,
    command_rx: mpsc::Receiver<HubCommand>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<String>>,
    next_id: SubscriberId,
}

impl SubscriberHub {
    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting subscriber hub");

        loop {
            tokio::select! {
                Some(result) = self.result_rx.recv() => {
                    self.fan_out(&result);
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        HubCommand::Subscribe { respond_to } => {
                            let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                            let id = self.next_id;
                            self.next_id += 1;
                            self.subscribers.insert(id, tx);
                            debug!("subscriber {id} registered ({} total)", self.subscribers.len());

                            if respond_to.send(Subscription { id, receiver: rx }).is_err() {
                                self.subscribers.remove(&id);
                            }
                        }

                        HubCommand::Unsubscribe { id } => {
                            if self.subscribers.remove(&id).is_some() {
                                debug!("subscriber {id} unregistered ({} total)", self.subscribers.len());
                            }
                        }

                        HubCommand::SubscriberCount { respond_to } => {
                            let _ = respond_to.send(self.subscribers.len());
                        }

                        HubCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("hub channels closed, shutting down");
                    break;
                }
            }
        }

        // dropping the senders ends every subscriber stream
        self.subscribers.clear();
        debug!("subscriber hub stopped");
    }

    fn fan_out(&mut self, result: &MonitoringResult) {
        let payload = match serde_json::to_string(result) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to serialize result for endpoint {}: {e}", result.endpoint_id);
                return;
            }
        };

        let mut closed = Vec::new();

        for (id, tx) in &self.subscribers {
            match tx.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!("subscriber {id} is lagging, skipping result");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
            debug!("reaped closed subscriber {id}");
        }
    }
}

/// Handle for the SubscriberHub actor
#[derive(Debug, Clone)]
pub struct HubHandle {
    result_tx: mpsc::Sender<MonitoringResult>,
    command_tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Spawn the hub actor
    pub fn spawn() -> Self {
        let (result_tx, result_rx) = mpsc::channel(BROADCAST_BUFFER);
        let (command_tx, command_rx) = mpsc::channel(32);

        let hub = SubscriberHub {
            result_rx,
            command_rx,
            subscribers: HashMap::new(),
            next_id: 1,
        };

        tokio::spawn(hub.run());

        Self {
            result_tx,
            command_tx,
        }
    }

    pub async fn subscribe(&self) -> Result<Subscription> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(HubCommand::Subscribe { respond_to: tx })
            .await?;
        Ok(rx.await?)
    }

    pub async fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.command_tx.send(HubCommand::Unsubscribe { id }).await;
    }

    pub async fn subscriber_count(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(HubCommand::SubscriberCount { respond_to: tx })
            .await?;
        Ok(rx.await?)
    }

    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(HubCommand::Shutdown).await;
    }
}

impl ResultBroadcaster for HubHandle {
    fn broadcast(&self, result: MonitoringResult) {
        match self.result_tx.try_send(result) {
            Ok(()) => {}
            Err(TrySendError::Full(result)) => {
                warn!(
                    "hub queue full, dropping result for endpoint {}",
                    result.endpoint_id
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!("hub stopped, result not broadcast");
            }
        }
    }
}
