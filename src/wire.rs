//! Relay wire events, shared between the relay server and the peer side.
//!
//! JSON-shaped payloads over a persistent WebSocket per participant:
//! - client to relay: `join-room`, `offer`, `answer`, `ice-candidate`
//! - relay to client: `welcome`, `user-connected`, `user-disconnected`,
//!   plus the three forwarded signal kinds
//!
//! Negotiation bodies (`sdp`, `candidate`) are opaque JSON values; the relay
//! never inspects them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of a relayed negotiation message. `sender_id` is stamped by the
/// relay when the sender omits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
}

impl SignalPayload {
    pub fn sdp(target_id: &str, sender_id: &str, sdp: Value) -> Self {
        Self {
            target_id: target_id.to_string(),
            sender_id: Some(sender_id.to_string()),
            sdp: Some(sdp),
            candidate: None,
        }
    }

    pub fn candidate(target_id: &str, sender_id: &str, candidate: Value) -> Self {
        Self {
            target_id: target_id.to_string(),
            sender_id: Some(sender_id.to_string()),
            sdp: None,
            candidate: Some(candidate),
        }
    }
}

/// Events sent from a participant to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom {
        #[serde(rename = "roomKey")]
        room_key: String,
    },
    Offer(SignalPayload),
    Answer(SignalPayload),
    IceCandidate(SignalPayload),
}

/// Events sent from the relay to a participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// First event on every connection; tells the participant its own id.
    Welcome {
        #[serde(rename = "participantId")]
        participant_id: String,
    },
    UserConnected {
        #[serde(rename = "participantId")]
        participant_id: String,
    },
    UserDisconnected {
        #[serde(rename = "participantId")]
        participant_id: String,
    },
    Offer(SignalPayload),
    Answer(SignalPayload),
    IceCandidate(SignalPayload),
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::Welcome { .. } => "welcome",
            ServerEvent::UserConnected { .. } => "user-connected",
            ServerEvent::UserDisconnected { .. } => "user-disconnected",
            ServerEvent::Offer(_) => "offer",
            ServerEvent::Answer(_) => "answer",
            ServerEvent::IceCandidate(_) => "ice-candidate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_room_format() {
        let ev = ClientEvent::JoinRoom {
            room_key: "PORTAL1".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"join-room\""));
        assert!(json.contains("\"roomKey\":\"PORTAL1\""));
    }

    #[test]
    fn test_user_connected_format() {
        let ev = ServerEvent::UserConnected {
            participant_id: "p1".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"user-connected\""));
        assert!(json.contains("\"participantId\":\"p1\""));

        let parsed: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "user-connected");
    }

    #[test]
    fn test_offer_format() {
        let sdp = serde_json::json!({"type": "offer", "sdp": "v=0\r\n"});
        let ev = ClientEvent::Offer(SignalPayload::sdp("p2", "p1", sdp));
        let json = serde_json::to_string(&ev).unwrap();

        assert!(json.contains("\"type\":\"offer\""));
        assert!(json.contains("\"targetId\":\"p2\""));
        assert!(json.contains("\"senderId\":\"p1\""));
        assert!(json.contains("\"sdp\""));
        assert!(!json.contains("\"candidate\""));
    }

    #[test]
    fn test_candidate_format() {
        let candidate = serde_json::json!({
            "candidate": "candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });
        let ev = ClientEvent::IceCandidate(SignalPayload::candidate("p1", "p2", candidate));
        let json = serde_json::to_string(&ev).unwrap();

        assert!(json.contains("\"type\":\"ice-candidate\""));
        assert!(json.contains("\"candidate\""));
        assert!(json.contains("sdpMid"));
    }

    #[test]
    fn test_sender_id_optional_on_parse() {
        // Clients may omit senderId; the relay stamps it before forwarding.
        let raw = r#"{"type":"offer","targetId":"p1","sdp":{"type":"offer","sdp":"x"}}"#;
        let parsed: ClientEvent = serde_json::from_str(raw).unwrap();
        match parsed {
            ClientEvent::Offer(p) => {
                assert_eq!(p.target_id, "p1");
                assert!(p.sender_id.is_none());
            }
            _ => panic!("expected offer"),
        }
    }

    #[test]
    fn test_welcome_roundtrip() {
        let ev = ServerEvent::Welcome {
            participant_id: "abc123".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"welcome\""));

        let parsed: ServerEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            ServerEvent::Welcome { participant_id } => assert_eq!(participant_id, "abc123"),
            _ => panic!("expected welcome"),
        }
    }
}
