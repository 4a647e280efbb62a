//! The shared intermediary all contexts can reach.
//!
//! A [`Hub`] stands in for the one piece of infrastructure assumed always
//! reachable: it carries (1) the broadcast pub/sub channel every context of
//! an origin listens on, and (2) a relay that can hand a live port end to a
//! specific client — broadcast messages cannot carry channel ends, so port
//! delivery must go through here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::messages::{BrokerMessage, RpcRequest, RpcResponse};

/// Capacity of the shared broadcast channel.
const BROADCAST_CAPACITY: usize = 64;

/// Capacity of each relay inbox and dedicated port.
const PORT_CAPACITY: usize = 64;

/// The client end of a dedicated provider↔client channel pair.
#[derive(Debug)]
pub struct ClientPort {
    /// Sends method calls to the provider.
    pub requests: mpsc::Sender<RpcRequest>,
    /// Receives responses from the provider.
    pub responses: mpsc::Receiver<RpcResponse>,
}

/// A port en route to a client, tagged with the attach nonce.
#[derive(Debug)]
pub struct PortDelivery {
    /// Nonce from the client's `Request` broadcast.
    pub nonce: String,
    /// The port end being delivered.
    pub port: ClientPort,
}

/// Create a dedicated channel pair; the provider keeps the server ends.
#[must_use]
pub fn port_pair() -> (ClientPort, mpsc::Receiver<RpcRequest>, mpsc::Sender<RpcResponse>) {
    let (req_tx, req_rx) = mpsc::channel(PORT_CAPACITY);
    let (resp_tx, resp_rx) = mpsc::channel(PORT_CAPACITY);
    (
        ClientPort {
            requests: req_tx,
            responses: resp_rx,
        },
        req_rx,
        resp_tx,
    )
}

struct HubInner {
    relays: Mutex<HashMap<String, mpsc::Sender<PortDelivery>>>,
}

/// Shared pub/sub channel plus port relay for one origin.
#[derive(Clone)]
pub struct Hub {
    broadcast: broadcast::Sender<BrokerMessage>,
    inner: Arc<HubInner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    /// Create a hub for a new origin.
    #[must_use]
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            broadcast,
            inner: Arc::new(HubInner {
                relays: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the shared broadcast channel. Only messages published
    /// after subscription are seen.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerMessage> {
        self.broadcast.subscribe()
    }

    /// Publish to every subscribed context. A hub with no listeners drops
    /// the message, matching pub/sub semantics.
    pub fn publish(&self, msg: BrokerMessage) {
        debug!(?msg, "broadcast");
        drop(self.broadcast.send(msg));
    }

    /// Register a client's relay inbox, returning the receiving end.
    ///
    /// Re-registering the same client id replaces the previous inbox.
    #[must_use]
    pub fn register_relay(&self, client_id: &str) -> mpsc::Receiver<PortDelivery> {
        let (tx, rx) = mpsc::channel(PORT_CAPACITY);
        self.inner
            .relays
            .lock()
            .expect("relay table poisoned")
            .insert(client_id.to_owned(), tx);
        rx
    }

    /// Remove a client's relay inbox.
    pub fn unregister_relay(&self, client_id: &str) {
        self.inner
            .relays
            .lock()
            .expect("relay table poisoned")
            .remove(client_id);
    }

    /// Deliver a port end to `client_id`.
    ///
    /// Fails (returning the undelivered port) when the client's context has
    /// been torn down — its inbox is gone or closed. The provider treats
    /// that as transient during tab-close races and retries once.
    pub async fn deliver_port(
        &self,
        client_id: &str,
        delivery: PortDelivery,
    ) -> Result<(), PortDelivery> {
        let sender = {
            let relays = self.inner.relays.lock().expect("relay table poisoned");
            relays.get(client_id).cloned()
        };
        match sender {
            Some(tx) => tx.send(delivery).await.map_err(|err| err.0),
            None => Err(delivery),
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let relays = self.inner.relays.lock().expect("relay table poisoned");
        f.debug_struct("Hub")
            .field("relays", &relays.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let hub = Hub::new();
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        hub.publish(BrokerMessage::Client {
            service: "db".to_owned(),
        });

        let expected = BrokerMessage::Client {
            service: "db".to_owned(),
        };
        assert_eq!(rx1.recv().await.unwrap(), expected);
        assert_eq!(rx2.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let hub = Hub::new();
        hub.publish(BrokerMessage::Client {
            service: "db".to_owned(),
        });
    }

    #[tokio::test]
    async fn port_delivery_roundtrip() {
        let hub = Hub::new();
        let mut inbox = hub.register_relay("client-1");

        let (port, _req_rx, _resp_tx) = port_pair();
        hub.deliver_port(
            "client-1",
            PortDelivery {
                nonce: "n1".to_owned(),
                port,
            },
        )
        .await
        .unwrap();

        let delivery = inbox.recv().await.unwrap();
        assert_eq!(delivery.nonce, "n1");
    }

    #[tokio::test]
    async fn delivery_to_missing_client_returns_port() {
        let hub = Hub::new();
        let (port, _req_rx, _resp_tx) = port_pair();
        let err = hub
            .deliver_port(
                "ghost",
                PortDelivery {
                    nonce: "n".to_owned(),
                    port,
                },
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn delivery_to_dropped_inbox_returns_port() {
        let hub = Hub::new();
        let inbox = hub.register_relay("client-1");
        drop(inbox);

        let (port, _req_rx, _resp_tx) = port_pair();
        let err = hub
            .deliver_port(
                "client-1",
                PortDelivery {
                    nonce: "n".to_owned(),
                    port,
                },
            )
            .await;
        assert!(err.is_err());
    }
}
