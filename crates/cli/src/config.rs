//! Static JSON configuration feeding the engine's collaborator seams.
//!
//! The engine consumes cameras and cloud signaling parameters through the
//! [`CameraInventory`] and [`CloudApi`] traits; this runner loads both
//! from one JSON file captured ahead of time (session host, MQTT
//! credentials, and per-camera WebRTC parameters):
//!
//! ```json
//! {
//!   "session": {"server_host": "…", "mqtts_url": "…"},
//!   "signaling": {"client_id": "…", "msid": "…", "password": "…"},
//!   "cameras": [{
//!     "device_id": "…", "device_name": "Front", "rtsp_path": "/Front",
//!     "auth": "…", "moto_id": "…", "ices": [{"urls": "stun:…"}],
//!     "skill": {"webrtc": 32, "videos": […], "audios": […]}
//!   }]
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use tuya_rtsp::cloud::{
    AppInfo, CameraBinding, CameraInventory, CloudApi, IceServer, MqttSignalConfig, UserSession,
    WebRtcCloudConfig,
};
use tuya_rtsp::error::{EngineError, Result};
use tuya_rtsp::CameraInfo;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub session: UserSession,
    pub signaling: SignalingConfig,
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalingConfig {
    pub client_id: String,
    pub msid: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub device_id: String,
    pub device_name: String,
    pub rtsp_path: String,
    #[serde(default)]
    pub category: String,
    pub auth: String,
    pub moto_id: String,
    #[serde(default)]
    pub ices: Vec<IceServer>,
    /// Skill blob as captured from the cloud (object form).
    pub skill: serde_json::Value,
    /// Capability flag as captured from the cloud; defaults to capable.
    #[serde(default = "default_supports_webrtc")]
    pub supports_webrtc: bool,
}

fn default_supports_webrtc() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> std::result::Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        serde_json::from_str(&raw).map_err(|e| format!("invalid config: {e}"))
    }

    /// Split into the two collaborator implementations the server needs.
    pub fn into_collaborators(self) -> (Arc<dyn CameraInventory>, Arc<dyn CloudApi>) {
        let shared = Arc::new(StaticBackend {
            session: self.session,
            signaling: self.signaling,
            cameras: self.cameras,
        });
        (shared.clone(), shared)
    }
}

/// File-backed implementation of both collaborator traits.
struct StaticBackend {
    session: UserSession,
    signaling: SignalingConfig,
    cameras: Vec<CameraConfig>,
}

impl StaticBackend {
    fn camera_config(&self, device_id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.device_id == device_id)
    }
}

impl CameraInventory for StaticBackend {
    fn resolve(&self, path: &str) -> Option<CameraBinding> {
        let config = self.cameras.iter().find(|c| c.rtsp_path == path)?;
        Some(CameraBinding {
            camera: camera_info(config),
            session: self.session.clone(),
        })
    }

    fn all(&self) -> Vec<CameraInfo> {
        self.cameras.iter().map(camera_info).collect()
    }
}

#[async_trait]
impl CloudApi for StaticBackend {
    async fn app_info(&self, _session: &UserSession) -> Result<AppInfo> {
        Ok(AppInfo {
            client_id: self.signaling.client_id.clone(),
        })
    }

    async fn mqtt_config(&self, _session: &UserSession) -> Result<MqttSignalConfig> {
        Ok(MqttSignalConfig {
            msid: self.signaling.msid.clone(),
            password: self.signaling.password.clone(),
        })
    }

    async fn webrtc_config(
        &self,
        _session: &UserSession,
        device_id: &str,
    ) -> Result<WebRtcCloudConfig> {
        let config = self
            .camera_config(device_id)
            .ok_or_else(|| EngineError::Cloud(format!("unknown device: {device_id}")))?;
        Ok(WebRtcCloudConfig {
            auth: config.auth.clone(),
            moto_id: config.moto_id.clone(),
            ices: config.ices.clone(),
            skill: config.skill.to_string(),
            supports_webrtc: config.supports_webrtc,
        })
    }
}

fn camera_info(config: &CameraConfig) -> CameraInfo {
    CameraInfo {
        device_id: config.device_id.clone(),
        device_name: config.device_name.clone(),
        category: config.category.clone(),
        product_id: String::new(),
        uuid: String::new(),
        rtsp_path: config.rtsp_path.clone(),
        user_key: String::new(),
        skill: config.skill.to_string(),
    }
}
