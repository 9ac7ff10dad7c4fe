//! MQTT signaling session multiplexing.
//!
//! One [`SignalingClient`] per camera stream: a websocket-MQTT session that
//! publishes on the device-scoped topic and subscribes on the user-scoped
//! topic. Inbound frames are routed to the bridge registered under their
//! `sessionid` as [`SignalingEvent`]s — routing rather than callbacks, so
//! the bridge consumes them from a channel inside its own task.
//!
//! Reconnects are not attempted within a bridge's lifetime: an event-loop
//! error is terminal and every registered session receives a final
//! [`SignalingEvent::Disconnect`].

pub mod frames;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet as MqttPacket, QoS, Transport};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::camera::Resolution;
use crate::cloud::{IceServer, MqttSignalConfig, WebRtcCloudConfig};
use crate::error::{EngineError, Result};
use crate::sync::Waiter;
use frames::{
    CandidateFrame, CommandFrame, DisconnectFrame, FrameHeader, MqttFrame, MqttMessage,
    OfferFrame, PROTOCOL_COMMAND, PROTOCOL_SIGNALING, PROTOCOL_VERSION,
};

/// Bounded wait for broker connect + subscribe.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Inbound signaling events, dispatched by session id.
#[derive(Debug)]
pub enum SignalingEvent {
    Answer(frames::AnswerFrame),
    Candidate(frames::CandidateFrame),
    Disconnect,
}

type SessionMap = Arc<Mutex<HashMap<String, UnboundedSender<SignalingEvent>>>>;

/// Websocket-MQTT signaling session.
pub struct SignalingClient {
    client: AsyncClient,
    msid: String,
    sessions: SessionMap,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SignalingClient {
    /// Connect to the broker, subscribe to the user-scoped topic, and wait
    /// for the subscription to be acknowledged (bounded by
    /// [`CONNECT_TIMEOUT`]).
    pub async fn connect(broker_host: &str, config: &MqttSignalConfig) -> Result<Arc<Self>> {
        let url = format!("wss://{broker_host}/mqtt");
        let username = format!("web_{}", config.msid);

        let mut options = MqttOptions::new(username.clone(), url, 443);
        options.set_transport(Transport::wss_with_default_config());
        options.set_credentials(username, config.password.clone());
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, 64);

        let topic = frames::subscribe_topic(&config.msid);
        client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| EngineError::Signaling(format!("subscribe failed: {e}")))?;

        let signaling = Arc::new(Self {
            client,
            msid: config.msid.clone(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        });

        let connected = Arc::new(Waiter::new());
        tokio::spawn(event_loop(
            eventloop,
            connected.clone(),
            signaling.sessions.clone(),
            signaling.closed.clone(),
            signaling.cancel.clone(),
        ));

        connected.wait_timeout(CONNECT_TIMEOUT).await?;
        tracing::debug!(%topic, "signaling connected and subscribed");

        Ok(signaling)
    }

    /// Register a bridge session for inbound frame routing.
    pub fn register(&self, session_id: &str, tx: UnboundedSender<SignalingEvent>) {
        self.sessions.lock().insert(session_id.to_string(), tx);
    }

    pub fn unregister(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    /// Publish one signaling frame. Fails with
    /// [`EngineError::SignalingClosed`] once the session is down.
    pub async fn publish(
        &self,
        topic: &str,
        protocol: i32,
        frame_type: &str,
        to: &str,
        session_id: &str,
        moto_id: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::SignalingClosed);
        }

        let message = MqttMessage {
            protocol,
            pv: PROTOCOL_VERSION.to_string(),
            t: chrono::Utc::now().timestamp_millis(),
            data: MqttFrame {
                header: FrameHeader {
                    frame_type: frame_type.to_string(),
                    from: self.msid.clone(),
                    to: to.to_string(),
                    sub_dev_id: String::new(),
                    session_id: session_id.to_string(),
                    moto_id: moto_id.to_string(),
                    transaction_id: String::new(),
                    seq: 0,
                    rtx: 0,
                },
                message: payload,
            },
        };

        let body = serde_json::to_vec(&message)
            .map_err(|e| EngineError::Signaling(format!("frame serialization failed: {e}")))?;

        self.client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .await
            .map_err(|e| EngineError::Signaling(format!("publish failed: {e}")))
    }

    /// Tear the session down. Idempotent.
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let _ = self.client.disconnect().await;
        self.sessions.lock().clear();
        tracing::debug!("signaling client stopped");
    }
}

async fn event_loop(
    mut eventloop: rumqttc::EventLoop,
    connected: Arc<Waiter>,
    sessions: SessionMap,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(MqttPacket::SubAck(_))) => {
                    connected.done(Ok(()));
                }
                Ok(Event::Incoming(MqttPacket::Publish(publish))) => {
                    route_inbound(&sessions, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    // No reconnect inside a bridge lifetime; surface the
                    // loss to every registered session and exit.
                    closed.store(true, Ordering::SeqCst);
                    connected.done(Err(EngineError::Signaling(e.to_string())));
                    let handlers: Vec<_> = sessions.lock().drain().collect();
                    if !handlers.is_empty() {
                        tracing::warn!(error = %e, "signaling connection lost");
                    }
                    for (_, tx) in handlers {
                        let _ = tx.send(SignalingEvent::Disconnect);
                    }
                    break;
                }
            }
        }
    }
}

fn route_inbound(sessions: &SessionMap, payload: &[u8]) {
    let message: MqttMessage = match serde_json::from_slice(payload) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable signaling frame");
            return;
        }
    };

    let header = &message.data.header;
    let tx = match sessions.lock().get(&header.session_id) {
        Some(tx) => tx.clone(),
        None => {
            tracing::warn!(
                session_id = %header.session_id,
                frame_type = %header.frame_type,
                "signaling frame for unknown session"
            );
            return;
        }
    };

    let event = match header.frame_type.as_str() {
        "answer" => match serde_json::from_value(message.data.message) {
            Ok(frame) => SignalingEvent::Answer(frame),
            Err(e) => {
                tracing::warn!(error = %e, "malformed answer frame");
                return;
            }
        },
        "candidate" => match serde_json::from_value::<CandidateFrame>(message.data.message) {
            Ok(mut frame) => {
                frame.candidate = trim_candidate(&frame.candidate).to_string();
                SignalingEvent::Candidate(frame)
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed candidate frame");
                return;
            }
        },
        "disconnect" => SignalingEvent::Disconnect,
        other => {
            tracing::trace!(frame_type = other, "ignoring signaling frame");
            return;
        }
    };

    let _ = tx.send(event);
}

/// Device candidates arrive as SDP attribute lines (`a=…\r\n`); the peer
/// connection wants the bare candidate string.
fn trim_candidate(candidate: &str) -> &str {
    let bare = candidate.strip_prefix("a=").unwrap_or(candidate);
    bare.strip_suffix("\r\n").unwrap_or(bare)
}

/// Per-camera signaling endpoint: correlates frames with a stable 32-char
/// session id and knows the device-scoped publish topic.
pub struct CameraSignaling {
    client: Arc<SignalingClient>,
    device_id: String,
    moto_id: String,
    auth: String,
    ices: Vec<IceServer>,
    session_id: String,
    topic: String,
}

impl CameraSignaling {
    pub fn new(
        client: Arc<SignalingClient>,
        device_id: &str,
        config: &WebRtcCloudConfig,
    ) -> Self {
        Self {
            client,
            device_id: device_id.to_string(),
            moto_id: config.moto_id.clone(),
            auth: config.auth.clone(),
            ices: config.ices.clone(),
            session_id: random_session_id(),
            topic: frames::publish_topic(&config.moto_id, device_id),
        }
    }

    /// Correlation id carried in every frame header.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn send_offer(
        &self,
        sdp: String,
        resolution: Resolution,
        stream_type: i32,
        is_hevc: bool,
    ) -> Result<()> {
        // HEVC devices address streams as 0 (main) / 1 (sub) instead of the
        // skill-reported stream type.
        let stream_type = if is_hevc {
            match resolution {
                Resolution::Hd => 0,
                Resolution::Sd => 1,
            }
        } else {
            stream_type
        };

        let frame = OfferFrame::new(sdp, stream_type, self.auth.clone(), self.ices.clone(), is_hevc);
        self.publish("offer", PROTOCOL_SIGNALING, &frame).await
    }

    pub async fn send_candidate(&self, candidate: &str) -> Result<()> {
        let frame = CandidateFrame::new(candidate.to_string());
        self.publish("candidate", PROTOCOL_SIGNALING, &frame).await
    }

    /// Clarity command: 0 selects the main (hd) stream, 1 the sub stream.
    pub async fn send_resolution(&self, value: i32) -> Result<()> {
        self.publish("resolution", PROTOCOL_COMMAND, &CommandFrame::new(value))
            .await
    }

    /// Device speaker toggle for the talk-back path: 0 off, 1 on.
    pub async fn send_speaker(&self, value: i32) -> Result<()> {
        self.publish("speaker", PROTOCOL_COMMAND, &CommandFrame::new(value))
            .await
    }

    pub async fn send_disconnect(&self) -> Result<()> {
        self.publish("disconnect", PROTOCOL_SIGNALING, &DisconnectFrame::new())
            .await
    }

    async fn publish<T: serde::Serialize>(
        &self,
        frame_type: &str,
        protocol: i32,
        frame: &T,
    ) -> Result<()> {
        let payload = serde_json::to_value(frame)
            .map_err(|e| EngineError::Signaling(format!("frame serialization failed: {e}")))?;
        self.client
            .publish(
                &self.topic,
                protocol,
                frame_type,
                &self.device_id,
                &self.session_id,
                &self.moto_id,
                payload,
            )
            .await
    }
}

/// 32 hex chars (16 random bytes), stable for the bridge's lifetime.
fn random_session_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_trimming() {
        assert_eq!(
            trim_candidate("a=candidate:1 1 UDP 2122 10.0.0.5 5000 typ host\r\n"),
            "candidate:1 1 UDP 2122 10.0.0.5 5000 typ host"
        );
        assert_eq!(trim_candidate("candidate:raw"), "candidate:raw");
        assert_eq!(trim_candidate(""), "");
    }

    #[test]
    fn session_id_is_32_hex_chars() {
        let id = random_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_session_id());
    }

    #[test]
    fn route_dispatches_by_session_id() {
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        sessions.lock().insert("sess1".into(), tx);

        let payload = serde_json::json!({
            "protocol": 302,
            "pv": "2.2",
            "t": 0,
            "data": {
                "header": {
                    "type": "candidate",
                    "from": "dev", "to": "user",
                    "sessionid": "sess1", "moto_id": "m",
                    "tid": "", "seq": 0, "rtx": 0
                },
                "msg": {"mode": "webrtc", "candidate": "a=candidate:foo\r\n"}
            }
        });
        route_inbound(&sessions, serde_json::to_vec(&payload).unwrap().as_slice());

        match rx.try_recv().unwrap() {
            SignalingEvent::Candidate(frame) => assert_eq!(frame.candidate, "candidate:foo"),
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn route_drops_unknown_session() {
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        let payload = serde_json::json!({
            "protocol": 302, "pv": "2.2", "t": 0,
            "data": {
                "header": {
                    "type": "disconnect",
                    "from": "dev", "to": "user",
                    "sessionid": "nobody", "moto_id": "m",
                    "tid": "", "seq": 0, "rtx": 0
                },
                "msg": {"mode": "webrtc"}
            }
        });
        // Must not panic or error.
        route_inbound(&sessions, serde_json::to_vec(&payload).unwrap().as_slice());
    }
}
