//! Result fan-out hub.
//!
//! Every `/ws/results` client gets a bounded outbox channel. Broadcast
//! snapshots the sender set under the read lock and writes outside it;
//! a closed outbox removes that client without affecting the rest. Slow
//! clients lose messages rather than stalling the hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Server ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Idle read deadline, refreshed by any inbound frame (pongs included).
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Per-client outbox depth.
const OUTBOX_DEPTH: usize = 64;

pub struct ResultsHub {
    clients: RwLock<HashMap<u64, mpsc::Sender<String>>>,
    next_id: AtomicU64,
}

impl ResultsHub {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOX_DEPTH);
        self.clients.write().insert(id, tx);
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.clients.write().remove(&id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Deliver one result message to every connected client.
    pub fn broadcast(&self, body: &str) {
        // Snapshot under the read lock, send outside it.
        let snapshot: Vec<(u64, mpsc::Sender<String>)> = self
            .clients
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(body.to_string()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("client {id} outbox full, dropping result");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            let mut clients = self.clients.write();
            for id in dead {
                clients.remove(&id);
            }
        }
    }
}

impl Default for ResultsHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive one `/ws/results` connection until it closes or goes idle.
pub async fn serve_results_socket(socket: WebSocket, hub: &ResultsHub) {
    let (id, mut outbox) = hub.register();
    info!("results client {id} connected ({} total)", hub.client_count());

    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // immediate first tick

    loop {
        tokio::select! {
            // Outbound: results and keepalive pings.
            body = outbox.recv() => {
                let Some(body) = body else { break };
                if sink.send(Message::Text(body)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            // Inbound: client messages are discarded, but any frame
            // refreshes the read deadline.
            inbound = tokio::time::timeout(READ_DEADLINE, stream.next()) => {
                match inbound {
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {} // pong or ignored client chatter
                    Ok(Some(Err(e))) => {
                        debug!("results client {id} read error: {e}");
                        break;
                    }
                    Err(_) => {
                        warn!("results client {id} idle past deadline, dropping");
                        break;
                    }
                }
            }
        }
    }

    hub.unregister(id);
    info!("results client {id} disconnected ({} left)", hub.client_count());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_clients() {
        let hub = ResultsHub::new();
        let (_a, mut rx_a) = hub.register();
        let (_b, mut rx_b) = hub.register();

        hub.broadcast("{\"frame_id\":1}");
        assert_eq!(rx_a.recv().await.unwrap(), "{\"frame_id\":1}");
        assert_eq!(rx_b.recv().await.unwrap(), "{\"frame_id\":1}");
    }

    #[tokio::test]
    async fn closed_client_is_pruned_without_affecting_others() {
        let hub = ResultsHub::new();
        let (_a, rx_a) = hub.register();
        let (_b, mut rx_b) = hub.register();
        drop(rx_a);

        hub.broadcast("x");
        assert_eq!(hub.client_count(), 1);
        assert_eq!(rx_b.recv().await.unwrap(), "x");
    }

    #[tokio::test]
    async fn unregister_removes_client() {
        let hub = ResultsHub::new();
        let (id, _rx) = hub.register();
        assert_eq!(hub.client_count(), 1);
        hub.unregister(id);
        assert_eq!(hub.client_count(), 0);
    }
}
