//! Per-(camera, resolution) stream lifecycle.
//!
//! A [`CameraStream`] is created lazily when the first RTSP client resolves
//! its path, owns one WebRTC bridge and one RTP forwarder, and counts
//! attached clients. When the last client leaves, a grace timer is armed;
//! if no client arrives before it fires, the upstream session is torn
//! down. A new client arrival cancels the pending timer atomically.
//!
//! ```text
//!           add_client (0→1)
//! Idle ───────────────────────▶ Connecting ──bridge ready──▶ Active
//!   add_client: cancel timer, stay Active
//!   remove_client (1→0): arm grace timer
//!   timer fires with no clients, or bridge error: ──▶ Stopping ──▶ Idle
//! ```
//!
//! All transitions happen under one per-stream lock; the timer callback
//! re-validates `no clients ∧ Active` under the lock before acting, which
//! closes the race between timer expiry and a late client arrival.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::bridge::WebRtcBridge;
use crate::camera::{CameraInfo, Resolution, StreamKey};
use crate::cloud::{CloudApi, UserSession};
use crate::forward::RtpForwarder;

/// Default grace delay between the last client leaving and upstream teardown.
pub const DEFAULT_SHUTDOWN_DELAY: Duration = Duration::from_secs(5);

/// Default bound on the bridge's negotiation (start → ready).
pub const DEFAULT_START_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Active,
    Stopping,
}

struct StreamInner {
    state: StreamState,
    clients: HashSet<String>,
    last_activity: Instant,
    shutdown_timer: Option<AbortHandle>,
}

/// One live camera stream: bridge + forwarder + attached clients.
pub struct CameraStream {
    key: StreamKey,
    camera: CameraInfo,
    forwarder: Arc<RtpForwarder>,
    bridge: Arc<WebRtcBridge>,
    shutdown_delay: Duration,
    start_deadline: Duration,
    registry: Weak<StreamRegistry>,
    inner: Mutex<StreamInner>,
}

impl CameraStream {
    pub fn new(
        camera: CameraInfo,
        resolution: Resolution,
        user: UserSession,
        cloud: Arc<dyn CloudApi>,
        registry: Weak<StreamRegistry>,
        shutdown_delay: Duration,
        start_deadline: Duration,
    ) -> Arc<Self> {
        let forwarder = Arc::new(RtpForwarder::new());
        let bridge = WebRtcBridge::new(
            camera.clone(),
            resolution,
            user,
            cloud,
            forwarder.clone(),
        );

        let stream = Arc::new(Self {
            key: StreamKey::new(&camera.device_id, resolution),
            camera,
            forwarder,
            bridge,
            shutdown_delay,
            start_deadline,
            registry,
            inner: Mutex::new(StreamInner {
                state: StreamState::Idle,
                clients: HashSet::new(),
                last_activity: Instant::now(),
                shutdown_timer: None,
            }),
        });
        stream.install_error_sink();
        stream
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn camera(&self) -> &CameraInfo {
        &self.camera
    }

    pub fn forwarder(&self) -> &Arc<RtpForwarder> {
        &self.forwarder
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Time since the last client attach/detach.
    pub fn idle_for(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }

    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    /// Whether a registry hit may be reused for a new client.
    pub(crate) fn is_reusable(&self) -> bool {
        matches!(
            self.state(),
            StreamState::Active | StreamState::Connecting
        )
    }

    /// Attach a client. Cancels any pending shutdown timer before
    /// returning; the first client kicks off the upstream start.
    pub fn add_client(self: &Arc<Self>, session_id: &str) {
        let mut inner = self.inner.lock();

        if let Some(timer) = inner.shutdown_timer.take() {
            timer.abort();
            tracing::trace!(stream = %self.key, "cancelled pending shutdown, client arrived");
        }

        inner.clients.insert(session_id.to_string());
        inner.last_activity = Instant::now();

        if inner.state == StreamState::Idle {
            inner.state = StreamState::Connecting;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_start().await;
            });
        }
    }

    /// Detach a client. Arms the grace timer when the stream is Active and
    /// this was the last client.
    pub async fn remove_client(self: &Arc<Self>, session_id: &str) {
        self.forwarder.remove_client(session_id).await;

        let mut inner = self.inner.lock();
        inner.clients.remove(session_id);
        inner.last_activity = Instant::now();

        if inner.clients.is_empty() && inner.state == StreamState::Active {
            self.arm_shutdown_timer(&mut inner);
        }
    }

    /// Force teardown regardless of attached clients.
    pub async fn stop(self: &Arc<Self>) {
        let clients: Vec<String> = self.inner.lock().clients.iter().cloned().collect();
        for session_id in &clients {
            self.forwarder.remove_client(session_id).await;
        }
        self.inner.lock().clients.clear();
        self.stop_internal().await;
    }

    async fn run_start(self: Arc<Self>) {
        tracing::info!(stream = %self.key, camera = %self.camera.device_name, "starting stream");

        match self.bridge.start(self.start_deadline).await {
            Ok(()) => {
                let stopped_meanwhile = {
                    let mut inner = self.inner.lock();
                    if inner.state == StreamState::Connecting {
                        inner.state = StreamState::Active;
                        if inner.clients.is_empty() {
                            // Everyone left during negotiation.
                            self.arm_shutdown_timer(&mut inner);
                        }
                        false
                    } else {
                        true
                    }
                };
                if stopped_meanwhile {
                    self.bridge.stop().await;
                }
            }
            Err(e) => {
                tracing::error!(stream = %self.key, error = %e, "failed to start stream");
                self.stop_internal().await;
            }
        }
    }

    fn arm_shutdown_timer(self: &Arc<Self>, inner: &mut StreamInner) {
        if let Some(existing) = inner.shutdown_timer.take() {
            existing.abort();
        }

        tracing::trace!(
            stream = %self.key,
            delay_secs = self.shutdown_delay.as_secs(),
            "no clients left, arming shutdown timer"
        );

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.shutdown_delay).await;

            // A client may have arrived between expiry and dispatch.
            let expired = {
                let mut inner = this.inner.lock();
                inner.shutdown_timer = None;
                inner.clients.is_empty() && inner.state == StreamState::Active
            };
            if expired {
                tracing::info!(stream = %this.key, "grace period expired, stopping stream");
                this.stop_internal().await;
            }
        });
        inner.shutdown_timer = Some(handle.abort_handle());
    }

    async fn stop_internal(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                StreamState::Idle | StreamState::Stopping => return,
                StreamState::Connecting | StreamState::Active => {}
            }
            inner.state = StreamState::Stopping;
            if let Some(timer) = inner.shutdown_timer.take() {
                timer.abort();
            }
        }

        self.bridge.stop().await;
        self.inner.lock().state = StreamState::Idle;

        // Registry removal takes the server-side lock; never while holding
        // this stream's lock, and from its own task (lock order is
        // registry before stream).
        let registry = self.registry.clone();
        let key = self.key.to_string();
        tokio::spawn(async move {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&key);
            }
        });
    }

    fn install_error_sink(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.bridge.set_on_error(move |err| {
            let Some(stream) = weak.upgrade() else { return };
            tracing::error!(stream = %stream.key, error = %err, "WebRTC bridge error");

            // With clients still attached the stream lingers (they hold
            // dead sockets); the idle reaper collects it after they drain.
            if stream.client_count() == 0 {
                tokio::spawn(async move {
                    stream.stop_internal().await;
                });
            }
        });
    }
}

/// Registry of live streams, keyed by `<device_id>-<resolution>`.
pub struct StreamRegistry {
    map: Mutex<HashMap<String, Arc<CameraStream>>>,
}

impl StreamRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, key: &str) -> Option<Arc<CameraStream>> {
        self.map.lock().get(key).cloned()
    }

    pub fn insert(&self, stream: Arc<CameraStream>) {
        self.map
            .lock()
            .insert(stream.key().to_string(), stream.clone());
    }

    pub fn remove(&self, key: &str) {
        if self.map.lock().remove(key).is_some() {
            tracing::trace!(key, "removed stream from registry");
        }
    }

    pub fn all(&self) -> Vec<Arc<CameraStream>> {
        self.map.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{AppInfo, MqttSignalConfig, WebRtcCloudConfig};
    use crate::error::{EngineError, Result};
    use async_trait::async_trait;

    struct OfflineCloud;

    #[async_trait]
    impl CloudApi for OfflineCloud {
        async fn app_info(&self, _session: &UserSession) -> Result<AppInfo> {
            Err(EngineError::Cloud("offline".into()))
        }
        async fn mqtt_config(&self, _session: &UserSession) -> Result<MqttSignalConfig> {
            Err(EngineError::Cloud("offline".into()))
        }
        async fn webrtc_config(
            &self,
            _session: &UserSession,
            _device_id: &str,
        ) -> Result<WebRtcCloudConfig> {
            Err(EngineError::Cloud("offline".into()))
        }
    }

    fn test_stream(registry: &Arc<StreamRegistry>) -> Arc<CameraStream> {
        let camera = CameraInfo {
            device_id: "dev1".into(),
            device_name: "Front".into(),
            category: String::new(),
            product_id: String::new(),
            uuid: String::new(),
            rtsp_path: "/Front".into(),
            user_key: String::new(),
            skill: "{}".into(),
        };
        let user = UserSession {
            server_host: "example.invalid".into(),
            mqtts_url: "example.invalid".into(),
        };
        CameraStream::new(
            camera,
            Resolution::Hd,
            user,
            Arc::new(OfflineCloud),
            Arc::downgrade(registry),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
    }

    fn force_active(stream: &Arc<CameraStream>) {
        stream.inner.lock().state = StreamState::Active;
    }

    #[tokio::test(start_paused = true)]
    async fn grace_timer_stops_stream_and_removes_registry_key() {
        let registry = StreamRegistry::new();
        let stream = test_stream(&registry);
        registry.insert(stream.clone());
        force_active(&stream);
        stream.inner.lock().clients.insert("c1".into());

        stream.remove_client("c1").await;
        assert!(
            stream.inner.lock().shutdown_timer.is_some(),
            "timer must be armed when the last client leaves an Active stream"
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert_eq!(stream.state(), StreamState::Idle);
        assert!(registry.get(&stream.key().to_string()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn client_arrival_cancels_pending_shutdown() {
        let registry = StreamRegistry::new();
        let stream = test_stream(&registry);
        force_active(&stream);
        stream.inner.lock().clients.insert("c1".into());

        stream.remove_client("c1").await;
        assert!(stream.inner.lock().shutdown_timer.is_some());

        tokio::time::sleep(Duration::from_secs(3)).await;
        stream.add_client("c2");
        assert!(
            stream.inner.lock().shutdown_timer.is_none(),
            "add_client must cancel the pending timer"
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(stream.state(), StreamState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_callback_revalidates_under_lock() {
        let registry = StreamRegistry::new();
        let stream = test_stream(&registry);
        force_active(&stream);
        stream.inner.lock().clients.insert("c1".into());
        stream.remove_client("c1").await;

        // Simulate the race: a client appears without going through
        // add_client, so the timer is still armed at expiry.
        stream.inner.lock().clients.insert("late".into());

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert_eq!(
            stream.state(),
            StreamState::Active,
            "timer must re-check the client set before stopping"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_returns_stream_to_idle() {
        let registry = StreamRegistry::new();
        let stream = test_stream(&registry);
        registry.insert(stream.clone());

        stream.add_client("c1");
        assert_eq!(stream.state(), StreamState::Connecting);

        // OfflineCloud fails the bridge start immediately.
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        assert_eq!(stream.state(), StreamState::Idle);
        assert!(registry.get(&stream.key().to_string()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_on_non_active_stream_does_not_arm_timer() {
        let registry = StreamRegistry::new();
        let stream = test_stream(&registry);
        stream.inner.lock().clients.insert("c1".into());

        stream.remove_client("c1").await;
        assert!(stream.inner.lock().shutdown_timer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_forces_teardown_with_clients_attached() {
        let registry = StreamRegistry::new();
        let stream = test_stream(&registry);
        registry.insert(stream.clone());
        force_active(&stream);
        stream.inner.lock().clients.insert("c1".into());
        stream.inner.lock().clients.insert("c2".into());

        stream.stop().await;
        tokio::task::yield_now().await;

        assert_eq!(stream.state(), StreamState::Idle);
        assert_eq!(stream.client_count(), 0);
        assert!(registry.get(&stream.key().to_string()).is_none());
    }
}
