//! Control-plane hub
//!
//! Broadcasts informational messages to every connected message channel.
//! A single event loop owns the membership map and drains three queues
//! (register, unregister, broadcast), so membership changes and broadcasts
//! are totally ordered with respect to each other.

use crate::error::HubClosed;
use rtpcast_protocol::{Info, SignalMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const QUEUE_CAPACITY: usize = 64;

struct Registration {
    client_id: Uuid,
    sender: mpsc::UnboundedSender<String>,
    done: oneshot::Sender<()>,
}

pub struct Hub {
    clients: HashMap<Uuid, mpsc::UnboundedSender<String>>,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<Uuid>,
    broadcast_rx: mpsc::Receiver<String>,
    /// Feeds count updates back into the broadcast queue without keeping it open
    broadcast_tx: mpsc::WeakSender<String>,
    client_count: Arc<AtomicUsize>,
}

/// Cloneable handle used by producers and connection handlers
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<Uuid>,
    broadcast_tx: mpsc::Sender<String>,
    client_count: Arc<AtomicUsize>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(QUEUE_CAPACITY);
        let client_count = Arc::new(AtomicUsize::new(0));

        let hub = Self {
            clients: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            broadcast_tx: broadcast_tx.downgrade(),
            client_count: client_count.clone(),
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            client_count,
        };
        (hub, handle)
    }

    /// Event loop; returns once every handle has been dropped
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(registration) = self.register_rx.recv() => {
                    self.clients.insert(registration.client_id, registration.sender);
                    self.publish_count();
                    let _ = registration.done.send(());
                }
                Some(client_id) = self.unregister_rx.recv() => {
                    if self.clients.remove(&client_id).is_some() {
                        self.publish_count();
                        self.spawn_info_update();
                    }
                }
                Some(frame) = self.broadcast_rx.recv() => {
                    self.deliver(frame);
                }
                else => break,
            }
        }
        tracing::debug!("Control-plane hub stopped");
    }

    fn deliver(&mut self, frame: String) {
        let before = self.clients.len();
        self.clients.retain(|client_id, sender| match sender.send(frame.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("Dropping hub client {} with closed channel", client_id);
                false
            }
        });
        if self.clients.len() != before {
            self.publish_count();
        }
    }

    fn publish_count(&self) {
        self.client_count.store(self.clients.len(), Ordering::Release);
    }

    /// Broadcast the membership count as it is right now; the count is taken
    /// before the task runs so later changes cannot leak into it
    fn spawn_info_update(&self) {
        let info = Info::new(self.clients.len());
        let frame = match SignalMessage::info(&info) {
            Ok(message) => message.encode(),
            Err(e) => {
                tracing::error!("Failed to encode hub info: {}", e);
                return;
            }
        };
        let broadcast_tx = self.broadcast_tx.clone();
        tokio::spawn(async move {
            if let Some(tx) = broadcast_tx.upgrade() {
                let _ = tx.send(frame).await;
            }
        });
    }
}

impl HubHandle {
    /// Add a channel; returns once the hub has processed the registration
    pub async fn register(
        &self,
        client_id: Uuid,
        sender: mpsc::UnboundedSender<String>,
    ) -> Result<(), HubClosed> {
        let (done, registered) = oneshot::channel();
        self.register_tx
            .send(Registration {
                client_id,
                sender,
                done,
            })
            .await
            .map_err(|_| HubClosed)?;
        registered.await.map_err(|_| HubClosed)
    }

    /// Remove a channel; unknown ids are ignored
    pub async fn unregister(&self, client_id: Uuid) -> Result<(), HubClosed> {
        self.unregister_tx
            .send(client_id)
            .await
            .map_err(|_| HubClosed)
    }

    pub async fn broadcast(&self, message: &SignalMessage) -> Result<(), HubClosed> {
        self.broadcast_tx
            .send(message.encode())
            .await
            .map_err(|_| HubClosed)
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }

    pub fn info(&self) -> Info {
        Info::new(self.client_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtpcast_protocol::Event;
    use std::time::Duration;
    use tokio::time::timeout;

    fn start() -> HubHandle {
        let (hub, handle) = Hub::new();
        tokio::spawn(hub.run());
        handle
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> SignalMessage {
        let frame = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for hub frame")
            .expect("hub channel closed");
        SignalMessage::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_clients() {
        let hub = start();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        hub.register(Uuid::new_v4(), tx_a).await.unwrap();
        hub.register(Uuid::new_v4(), tx_b).await.unwrap();
        assert_eq!(hub.client_count(), 2);

        hub.broadcast(&SignalMessage::connections(2)).await.unwrap();

        assert_eq!(next(&mut rx_a).await, SignalMessage::connections(2));
        assert_eq!(next(&mut rx_b).await, SignalMessage::connections(2));
    }

    #[tokio::test]
    async fn test_unregister_sends_info_to_remaining_clients() {
        let hub = start();
        let leaving = Uuid::new_v4();
        let (tx_leaving, mut rx_leaving) = mpsc::unbounded_channel();
        let (tx_staying, mut rx_staying) = mpsc::unbounded_channel();
        hub.register(leaving, tx_leaving).await.unwrap();
        hub.register(Uuid::new_v4(), tx_staying).await.unwrap();

        hub.unregister(leaving).await.unwrap();

        let message = next(&mut rx_staying).await;
        assert_eq!(message.event, Event::Info);
        assert_eq!(message.payload::<Info>().unwrap(), Info::new(1));

        // The hub dropped its sender, nothing more is delivered
        assert!(rx_leaving.recv().await.is_none());
        assert_eq!(hub.client_count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_unknown_client_is_ignored() {
        let hub = start();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(Uuid::new_v4(), tx).await.unwrap();

        hub.unregister(Uuid::new_v4()).await.unwrap();
        hub.broadcast(&SignalMessage::connections(1)).await.unwrap();

        // No info update precedes the broadcast
        assert_eq!(next(&mut rx).await, SignalMessage::connections(1));
        assert_eq!(hub.client_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_clients_are_pruned_on_broadcast() {
        let hub = start();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register(Uuid::new_v4(), tx).await.unwrap();
        drop(rx);

        hub.broadcast(&SignalMessage::connections(0)).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while hub.client_count() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("closed client was not pruned");
    }
}
