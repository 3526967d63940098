//! WebRTC signaling envelopes.
//!
//! The relay never inspects `payload`; only the discriminator and routing
//! fields are typed. Join/leave frames are synthesized by the gateway.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Join,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalRole {
    Device,
    Viewer,
}

impl SignalRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "device" => Some(SignalRole::Device),
            "viewer" => Some(SignalRole::Viewer),
            _ => None,
        }
    }
}

/// The one message shape on `/ws/signaling`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub device_id: String,
    pub from: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SignalEnvelope {
    /// Control frame announcing a peer joining or leaving a room.
    pub fn control(kind: SignalKind, device_id: &str, from: &str) -> Self {
        Self {
            kind,
            device_id: device_id.to_string(),
            from: from.to_string(),
            payload: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_uses_kebab_case() {
        assert_eq!(
            serde_json::to_string(&SignalKind::IceCandidate).unwrap(),
            "\"ice-candidate\""
        );
    }

    #[test]
    fn envelope_round_trips() {
        let raw = r#"{"type":"offer","device_id":"cam-1","from":"viewer-3","payload":{"sdp":"v=0"}}"#;
        let env: SignalEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.kind, SignalKind::Offer);
        assert_eq!(env.device_id, "cam-1");
        let back = serde_json::to_value(&env).unwrap();
        assert_eq!(back["type"], "offer");
        assert_eq!(back["payload"]["sdp"], "v=0");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"renegotiate","device_id":"cam-1","from":"x"}"#;
        assert!(serde_json::from_str::<SignalEnvelope>(raw).is_err());
    }
}
