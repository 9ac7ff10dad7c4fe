//! Collaborator interfaces the engine consumes.
//!
//! Authentication, persistent storage, and cloud REST discovery live
//! outside the engine. The engine sees them through two seams:
//!
//! - [`CameraInventory`] — resolves an RTSP path to a camera descriptor and
//!   the user session that owns it.
//! - [`CloudApi`] — the three cloud calls a bridge needs to negotiate:
//!   app identity, MQTT signaling credentials, and per-device WebRTC
//!   parameters (auth token, moto id, ICE servers, skill blob).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::camera::CameraInfo;
use crate::error::Result;

/// Authenticated user session data the engine needs: where the cloud API
/// lives and which broker carries signaling traffic. Cookie handling stays
/// inside the [`CloudApi`] implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    /// Cloud API host (e.g. `protect-eu.ismartlife.me`).
    pub server_host: String,
    /// MQTT-over-WSS broker host for signaling.
    pub mqtts_url: String,
}

/// App identity returned by the cloud (`GetAppInfo`).
#[derive(Debug, Clone, Deserialize)]
pub struct AppInfo {
    pub client_id: String,
}

/// MQTT signaling credentials (`GetMQTTConfig`).
#[derive(Debug, Clone, Deserialize)]
pub struct MqttSignalConfig {
    /// Mobile session id; scopes the subscribe topic and the MQTT username.
    pub msid: String,
    pub password: String,
}

/// ICE server entry as carried by the cloud and echoed in offer frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

/// Per-device WebRTC parameters (`GetWebRTCConfig`).
#[derive(Debug, Clone, Deserialize)]
pub struct WebRtcCloudConfig {
    /// Auth token included in offer frames.
    pub auth: String,
    /// Signaling peer identifier; part of the publish topic.
    pub moto_id: String,
    pub ices: Vec<IceServer>,
    /// Raw skill blob JSON for this device.
    pub skill: String,
    /// Whether the device can carry a WebRTC session at all; the bridge
    /// refuses to negotiate when false. Payloads that omit the flag are
    /// treated as capable.
    #[serde(default = "default_supports_webrtc")]
    pub supports_webrtc: bool,
}

fn default_supports_webrtc() -> bool {
    true
}

/// Resolved binding of a camera to its owning session.
#[derive(Debug, Clone)]
pub struct CameraBinding {
    pub camera: CameraInfo,
    pub session: UserSession,
}

/// Camera inventory collaborator.
///
/// An inventory with zero cameras is valid; unknown paths resolve to `None`
/// and surface as RTSP 404.
pub trait CameraInventory: Send + Sync {
    /// Resolve an RTSP path (e.g. `/Front`) to a camera and its session.
    fn resolve(&self, path: &str) -> Option<CameraBinding>;

    /// All known cameras, for endpoint listing.
    fn all(&self) -> Vec<CameraInfo>;
}

/// Cloud API collaborator consumed by the WebRTC bridge.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn app_info(&self, session: &UserSession) -> Result<AppInfo>;

    async fn mqtt_config(&self, session: &UserSession) -> Result<MqttSignalConfig>;

    async fn webrtc_config(
        &self,
        session: &UserSession,
        device_id: &str,
    ) -> Result<WebRtcCloudConfig>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webrtc_config_defaults_to_capable() {
        let config: WebRtcCloudConfig = serde_json::from_str(
            r#"{"auth": "tok", "moto_id": "m1", "ices": [], "skill": "{}"}"#,
        )
        .unwrap();
        assert!(config.supports_webrtc);
    }

    #[test]
    fn webrtc_config_honors_explicit_flag() {
        let config: WebRtcCloudConfig = serde_json::from_str(
            r#"{"auth": "tok", "moto_id": "m1", "ices": [], "skill": "{}",
                "supports_webrtc": false}"#,
        )
        .unwrap();
        assert!(!config.supports_webrtc);
    }
}
