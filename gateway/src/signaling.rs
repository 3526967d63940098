//! WebRTC signaling relay.
//!
//! Per-device rooms: at most one device connection per device_id, any
//! number of viewers. Device frames broadcast to viewers; viewer frames
//! route to the device. Join/leave control frames are synthesized here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wire::{SignalEnvelope, SignalKind, SignalRole};

const OUTBOX_DEPTH: usize = 32;
const READ_DEADLINE: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);

struct Peer {
    id: u64,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct Room {
    device: Option<Peer>,
    viewers: HashMap<u64, Peer>,
}

pub struct SignalingRooms {
    rooms: RwLock<HashMap<String, Room>>,
    next_id: AtomicU64,
}

pub enum JoinOutcome {
    Joined { peer_id: u64, rx: mpsc::Receiver<String> },
    /// A device connection already exists for this device_id.
    DeviceTaken,
}

impl SignalingRooms {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn join(&self, device_id: &str, role: SignalRole) -> JoinOutcome {
        let peer_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOX_DEPTH);
        let peer = Peer { id: peer_id, tx };

        let mut rooms = self.rooms.write();
        let room = rooms.entry(device_id.to_string()).or_default();
        match role {
            SignalRole::Device => {
                if room.device.is_some() {
                    return JoinOutcome::DeviceTaken;
                }
                room.device = Some(peer);
            }
            SignalRole::Viewer => {
                room.viewers.insert(peer_id, peer);
            }
        }
        drop(rooms);

        self.notify_join_leave(device_id, role, peer_id, SignalKind::Join);
        JoinOutcome::Joined { peer_id, rx }
    }

    pub fn leave(&self, device_id: &str, role: SignalRole, peer_id: u64) {
        {
            let mut rooms = self.rooms.write();
            let Some(room) = rooms.get_mut(device_id) else {
                return;
            };
            match role {
                SignalRole::Device => {
                    if room.device.as_ref().is_some_and(|p| p.id == peer_id) {
                        room.device = None;
                    }
                }
                SignalRole::Viewer => {
                    room.viewers.remove(&peer_id);
                }
            }
            if room.device.is_none() && room.viewers.is_empty() {
                rooms.remove(device_id);
            }
        }
        self.notify_join_leave(device_id, role, peer_id, SignalKind::Leave);
    }

    /// Route a relayed frame: device -> all viewers, viewer -> device.
    pub fn route(&self, role: SignalRole, envelope: &SignalEnvelope) {
        let Ok(body) = serde_json::to_string(envelope) else {
            return;
        };
        let targets = self.counterparts(&envelope.device_id, role);
        for tx in targets {
            let _ = tx.try_send(body.clone());
        }
    }

    fn counterparts(&self, device_id: &str, from_role: SignalRole) -> Vec<mpsc::Sender<String>> {
        let rooms = self.rooms.read();
        let Some(room) = rooms.get(device_id) else {
            return Vec::new();
        };
        match from_role {
            SignalRole::Device => room.viewers.values().map(|p| p.tx.clone()).collect(),
            SignalRole::Viewer => room.device.iter().map(|p| p.tx.clone()).collect(),
        }
    }

    fn notify_join_leave(&self, device_id: &str, role: SignalRole, peer_id: u64, kind: SignalKind) {
        let from = match role {
            SignalRole::Device => "device".to_string(),
            SignalRole::Viewer => format!("viewer-{peer_id}"),
        };
        let envelope = SignalEnvelope::control(kind, device_id, &from);
        self.route(role, &envelope);
    }

    /// Invariant check for tests and diagnostics.
    pub fn device_connections(&self, device_id: &str) -> usize {
        self.rooms
            .read()
            .get(device_id)
            .map(|r| usize::from(r.device.is_some()))
            .unwrap_or(0)
    }

    pub fn viewer_count(&self, device_id: &str) -> usize {
        self.rooms
            .read()
            .get(device_id)
            .map(|r| r.viewers.len())
            .unwrap_or(0)
    }
}

impl Default for SignalingRooms {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive one signaling connection.
pub async fn serve_signaling_socket(
    socket: WebSocket,
    rooms: &SignalingRooms,
    device_id: String,
    role: SignalRole,
) {
    let (mut sink, mut stream) = socket.split();

    let (peer_id, mut outbox) = match rooms.join(&device_id, role) {
        JoinOutcome::Joined { peer_id, rx } => (peer_id, rx),
        JoinOutcome::DeviceTaken => {
            warn!("second device connection for {device_id} refused");
            let refusal = SignalEnvelope::control(SignalKind::Leave, &device_id, "gateway");
            if let Ok(body) = serde_json::to_string(&refusal) {
                let _ = sink.send(Message::Text(body)).await;
            }
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    info!("signaling peer {peer_id} joined {device_id} as {role:?}");

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
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
            inbound = tokio::time::timeout(READ_DEADLINE, stream.next()) => {
                match inbound {
                    Ok(Some(Ok(Message::Text(raw)))) => {
                        match serde_json::from_str::<SignalEnvelope>(&raw) {
                            Ok(envelope) => rooms.route(role, &envelope),
                            Err(e) => debug!("bad signaling frame from {peer_id}: {e}"),
                        }
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        debug!("signaling read error from {peer_id}: {e}");
                        break;
                    }
                    Err(_) => {
                        warn!("signaling peer {peer_id} idle past deadline");
                        break;
                    }
                }
            }
        }
    }

    rooms.leave(&device_id, role, peer_id);
    info!("signaling peer {peer_id} left {device_id}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_device_per_room() {
        let rooms = SignalingRooms::new();
        let first = rooms.join("cam-1", SignalRole::Device);
        assert!(matches!(first, JoinOutcome::Joined { .. }));
        assert!(matches!(
            rooms.join("cam-1", SignalRole::Device),
            JoinOutcome::DeviceTaken
        ));
        assert_eq!(rooms.device_connections("cam-1"), 1);

        // A different device id is its own room.
        assert!(matches!(
            rooms.join("cam-2", SignalRole::Device),
            JoinOutcome::Joined { .. }
        ));
    }

    #[tokio::test]
    async fn device_frames_reach_all_viewers() {
        let rooms = SignalingRooms::new();
        let JoinOutcome::Joined { .. } = rooms.join("cam-1", SignalRole::Device) else {
            panic!("device join refused");
        };
        let JoinOutcome::Joined { rx: mut v1, .. } = rooms.join("cam-1", SignalRole::Viewer) else {
            panic!()
        };
        let JoinOutcome::Joined { rx: mut v2, .. } = rooms.join("cam-1", SignalRole::Viewer) else {
            panic!()
        };

        let offer = SignalEnvelope {
            kind: SignalKind::Offer,
            device_id: "cam-1".to_string(),
            from: "device".to_string(),
            payload: serde_json::json!({"sdp": "v=0"}),
        };
        rooms.route(SignalRole::Device, &offer);

        for rx in [&mut v1, &mut v2] {
            let raw = rx.recv().await.unwrap();
            let env: SignalEnvelope = serde_json::from_str(&raw).unwrap();
            assert_eq!(env.kind, SignalKind::Offer);
        }
    }

    #[tokio::test]
    async fn viewer_join_notifies_device() {
        let rooms = SignalingRooms::new();
        let JoinOutcome::Joined { rx: mut device_rx, .. } =
            rooms.join("cam-1", SignalRole::Device)
        else {
            panic!()
        };
        let JoinOutcome::Joined { peer_id, .. } = rooms.join("cam-1", SignalRole::Viewer) else {
            panic!()
        };

        let raw = device_rx.recv().await.unwrap();
        let env: SignalEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(env.kind, SignalKind::Join);
        assert_eq!(env.from, format!("viewer-{peer_id}"));
    }

    #[test]
    fn device_slot_frees_on_leave() {
        let rooms = SignalingRooms::new();
        let JoinOutcome::Joined { peer_id, .. } = rooms.join("cam-1", SignalRole::Device) else {
            panic!()
        };
        rooms.leave("cam-1", SignalRole::Device, peer_id);
        assert_eq!(rooms.device_connections("cam-1"), 0);
        assert!(matches!(
            rooms.join("cam-1", SignalRole::Device),
            JoinOutcome::Joined { .. }
        ));
    }
}
