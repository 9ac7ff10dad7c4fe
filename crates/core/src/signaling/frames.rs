//! Signaling wire frames (JSON over MQTT-over-WSS).
//!
//! Envelope: `{protocol, pv:"2.2", t:<unix ms>, data:{header, msg}}`.
//! The header correlates frames to a bridge session via `sessionid`;
//! `msg` is the per-type payload.

use serde::{Deserialize, Serialize};

use crate::cloud::IceServer;

/// Protocol number for offer/answer/candidate/disconnect frames.
pub const PROTOCOL_SIGNALING: i32 = 302;
/// Protocol number for resolution/speaker command frames.
pub const PROTOCOL_COMMAND: i32 = 312;
/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "2.2";

/// Outer MQTT message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttMessage {
    pub protocol: i32,
    pub pv: String,
    /// Send time in unix milliseconds.
    pub t: i64,
    pub data: MqttFrame,
}

/// Frame: header plus an opaque per-type payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttFrame {
    pub header: FrameHeader,
    #[serde(rename = "msg")]
    pub message: serde_json::Value,
}

/// Frame header; all fields are always present on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameHeader {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "sub_dev_id", default)]
    pub sub_dev_id: String,
    #[serde(rename = "sessionid")]
    pub session_id: String,
    #[serde(rename = "moto_id")]
    pub moto_id: String,
    #[serde(rename = "tid", default)]
    pub transaction_id: String,
    #[serde(default)]
    pub seq: i32,
    #[serde(default)]
    pub rtx: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replay {
    pub is_replay: i32,
}

/// `offer` payload (protocol 302).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferFrame {
    pub mode: String,
    pub sdp: String,
    pub stream_type: i32,
    pub auth: String,
    pub token: Vec<IceServer>,
    pub replay: Replay,
    pub datachannel_enable: bool,
}

/// `answer` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerFrame {
    pub mode: String,
    pub sdp: String,
}

/// `candidate` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFrame {
    pub mode: String,
    pub candidate: String,
}

/// `resolution` / `speaker` payload (protocol 312).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    pub mode: String,
    #[serde(rename = "cmdValue")]
    pub value: i32,
}

/// `disconnect` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectFrame {
    pub mode: String,
}

impl OfferFrame {
    pub fn new(
        sdp: String,
        stream_type: i32,
        auth: String,
        token: Vec<IceServer>,
        datachannel_enable: bool,
    ) -> Self {
        Self {
            mode: "webrtc".into(),
            sdp,
            stream_type,
            auth,
            token,
            replay: Replay { is_replay: 0 },
            datachannel_enable,
        }
    }
}

impl CandidateFrame {
    pub fn new(candidate: String) -> Self {
        Self {
            mode: "webrtc".into(),
            candidate,
        }
    }
}

impl CommandFrame {
    pub fn new(value: i32) -> Self {
        Self {
            mode: "webrtc".into(),
            value,
        }
    }
}

impl DisconnectFrame {
    pub fn new() -> Self {
        Self {
            mode: "webrtc".into(),
        }
    }
}

impl Default for DisconnectFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscribe topic for a user's mobile session id.
pub fn subscribe_topic(msid: &str) -> String {
    format!("/av/u/{msid}")
}

/// Publish topic for a device, scoped by its signaling peer (moto id).
pub fn publish_topic(moto_id: &str, device_id: &str) -> String {
    format!("/av/moto/{moto_id}/u/{device_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_frame_wire_shape() {
        let frame = OfferFrame::new(
            "v=0\r\n".into(),
            4,
            "authtoken".into(),
            vec![IceServer {
                urls: "stun:stun.example.com".into(),
                username: None,
                credential: None,
                ttl: None,
            }],
            false,
        );
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["mode"], "webrtc");
        assert_eq!(value["stream_type"], 4);
        assert_eq!(value["replay"]["is_replay"], 0);
        assert_eq!(value["datachannel_enable"], false);
        assert_eq!(value["token"][0]["urls"], "stun:stun.example.com");
        // Optional ICE fields are omitted, not null.
        assert!(value["token"][0].get("username").is_none());
    }

    #[test]
    fn command_frame_uses_cmd_value_key() {
        let value = serde_json::to_value(CommandFrame::new(1)).unwrap();
        assert_eq!(value["cmdValue"], 1);
    }

    #[test]
    fn envelope_roundtrip() {
        let raw = r#"{
            "protocol": 302,
            "pv": "2.2",
            "t": 1700000000000,
            "data": {
                "header": {
                    "type": "answer",
                    "from": "device",
                    "to": "msid",
                    "sub_dev_id": "",
                    "sessionid": "abc123",
                    "moto_id": "moto1",
                    "tid": "",
                    "seq": 0,
                    "rtx": 0
                },
                "msg": {"mode": "webrtc", "sdp": "v=0\r\n"}
            }
        }"#;
        let msg: MqttMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.protocol, PROTOCOL_SIGNALING);
        assert_eq!(msg.data.header.frame_type, "answer");
        assert_eq!(msg.data.header.session_id, "abc123");
        let answer: AnswerFrame = serde_json::from_value(msg.data.message).unwrap();
        assert_eq!(answer.sdp, "v=0\r\n");
    }

    #[test]
    fn topics() {
        assert_eq!(subscribe_topic("ms1"), "/av/u/ms1");
        assert_eq!(publish_topic("m1", "d1"), "/av/moto/m1/u/d1");
    }
}
