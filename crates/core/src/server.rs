//! Server core: TCP accept loop, client and stream registries, idle reaper.
//!
//! The server owns both registries exclusively. Lock order is always the
//! server-side registry first, then a stream's own lock; stream teardown
//! that needs the registry schedules the removal on a separate task (see
//! [`crate::stream`]).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::camera::Resolution;
use crate::cloud::{CameraBinding, CameraInventory, CloudApi};
use crate::conn;
use crate::error::{EngineError, Result};
use crate::session::ClientSession;
use crate::stream::{CameraStream, StreamRegistry, DEFAULT_SHUTDOWN_DELAY, DEFAULT_START_DEADLINE};

/// Reaper scan interval.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);
/// Streams idle longer than this with zero clients are removed.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on.
    pub port: u16,
    /// Grace delay between the last client leaving a stream and upstream
    /// teardown.
    pub shutdown_delay: Duration,
    /// Bound on a bridge's negotiation.
    pub start_deadline: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8554,
            shutdown_delay: DEFAULT_SHUTDOWN_DELAY,
            start_deadline: DEFAULT_START_DEADLINE,
        }
    }
}

/// Point-in-time server counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerStats {
    pub port: u16,
    pub running: bool,
    pub client_count: usize,
    pub active_stream_count: usize,
    pub total_streams: usize,
}

pub(crate) struct ClientEntry {
    #[allow(dead_code)]
    pub camera_path: String,
}

/// State shared between the server handle, the accept loop, and every
/// connection task.
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) inventory: Arc<dyn CameraInventory>,
    pub(crate) cloud: Arc<dyn CloudApi>,
    pub(crate) clients: Mutex<HashMap<String, ClientEntry>>,
    pub(crate) streams: Arc<StreamRegistry>,
    pub(crate) cancel: CancellationToken,
    pub(crate) running: AtomicBool,
}

impl ServerShared {
    /// Reuse a live stream for this (device, resolution) or create one.
    pub(crate) fn get_or_create_stream(
        self: &Arc<Self>,
        binding: &CameraBinding,
        resolution: Resolution,
    ) -> Arc<CameraStream> {
        let key = format!("{}-{}", binding.camera.device_id, resolution);

        if let Some(stream) = self.streams.get(&key) {
            if stream.is_reusable() {
                tracing::trace!(%key, "reusing existing stream");
                stream.touch();
                return stream;
            }
        }

        let stream = CameraStream::new(
            binding.camera.clone(),
            resolution,
            binding.session.clone(),
            self.cloud.clone(),
            Arc::downgrade(&self.streams),
            self.config.shutdown_delay,
            self.config.start_deadline,
        );
        self.streams.insert(stream.clone());
        tracing::info!(camera = %binding.camera.device_name, %key, "created stream");
        stream
    }

    pub(crate) fn register_client(&self, client: &ClientSession) {
        self.clients.lock().insert(
            client.id.clone(),
            ClientEntry {
                camera_path: client.camera_path.clone(),
            },
        );
    }

    pub(crate) fn remove_client(&self, session_id: &str) {
        self.clients.lock().remove(session_id);
    }
}

/// RTSP server bridging Tuya WebRTC cameras to RTSP clients.
///
/// `start` binds the listener and spawns the accept loop and idle reaper;
/// `stop` cancels everything and tears down every stream. After `stop`
/// returns no new connection is accepted.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        inventory: Arc<dyn CameraInventory>,
        cloud: Arc<dyn CloudApi>,
    ) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                inventory,
                cloud,
                clients: Mutex::new(HashMap::new()),
                streams: StreamRegistry::new(),
                cancel: CancellationToken::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.shared.config.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        tracing::info!(port = self.shared.config.port, "RTSP server listening");
        self.log_endpoints();

        tokio::spawn(accept_loop(self.shared.clone(), listener));
        tokio::spawn(reaper_loop(self.shared.clone()));

        Ok(())
    }

    /// Stop accepting, close every client connection, tear down every
    /// stream. Idempotent.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        tracing::info!("stopping RTSP server");
        self.shared.cancel.cancel();

        for stream in self.shared.streams.all() {
            stream.stop().await;
        }
        self.shared.clients.lock().clear();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.shared.config.port
    }

    pub fn stats(&self) -> ServerStats {
        let streams = self.shared.streams.all();
        let active = streams
            .iter()
            .filter(|s| s.state() == crate::stream::StreamState::Active)
            .count();
        ServerStats {
            port: self.shared.config.port,
            running: self.is_running(),
            client_count: self.shared.clients.lock().len(),
            active_stream_count: active,
            total_streams: streams.len(),
        }
    }

    fn log_endpoints(&self) {
        let cameras = self.shared.inventory.all();
        if cameras.is_empty() {
            tracing::warn!("no cameras in inventory");
            return;
        }

        let port = self.shared.config.port;
        for camera in cameras {
            let base = format!("rtsp://localhost:{port}{}", camera.rtsp_path);
            if camera.parsed_skill().supports_clarity() {
                tracing::info!("  {base}/hd ({})", camera.device_name);
                tracing::info!("  {base}/sd ({})", camera.device_name);
            } else {
                tracing::info!("  {base} ({})", camera.device_name);
            }
        }
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        conn::handle_connection(shared, socket, peer).await;
                    });
                }
                Err(e) => {
                    if shared.running.load(Ordering::SeqCst) {
                        tracing::warn!(error = %e, "accept error");
                    }
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// Remove streams that have sat idle (no clients, no activity) past the
/// timeout. Catches streams abandoned by bridge errors as well.
async fn reaper_loop(shared: Arc<ServerShared>) {
    let mut ticker = tokio::time::interval(REAPER_INTERVAL);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {
                for stream in shared.streams.all() {
                    if stream.client_count() == 0 && stream.idle_for() > STREAM_IDLE_TIMEOUT {
                        tracing::info!(key = %stream.key(), "reaping idle stream");
                        stream.stop().await;
                        shared.streams.remove(&stream.key().to_string());
                    }
                }
            }
        }
    }
    tracing::debug!("reaper exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraInfo;
    use crate::cloud::{AppInfo, MqttSignalConfig, UserSession, WebRtcCloudConfig};
    use async_trait::async_trait;

    struct EmptyInventory;

    impl CameraInventory for EmptyInventory {
        fn resolve(&self, _path: &str) -> Option<CameraBinding> {
            None
        }
        fn all(&self) -> Vec<CameraInfo> {
            Vec::new()
        }
    }

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

    fn test_server(port: u16) -> Server {
        Server::new(
            ServerConfig {
                port,
                ..Default::default()
            },
            Arc::new(EmptyInventory),
            Arc::new(OfflineCloud),
        )
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let server = test_server(18699);
        server.start().await.expect("first start");
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning));
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let server = test_server(18698);
        server.start().await.unwrap();
        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn no_accepts_after_stop() {
        let server = test_server(18697);
        server.start().await.unwrap();
        server.stop().await;
        // Give the accept loop a moment to observe cancellation.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = tokio::net::TcpStream::connect("127.0.0.1:18697").await;
        match result {
            // Listener dropped: connection refused.
            Err(_) => {}
            Ok(socket) => {
                // The socket may connect before the listener closes, but
                // no task serves it; the connection must die unanswered.
                use tokio::io::AsyncReadExt;
                let mut socket = socket;
                let mut buf = [0u8; 1];
                let read = tokio::time::timeout(
                    Duration::from_millis(200),
                    socket.read(&mut buf),
                )
                .await;
                match read {
                    Ok(Ok(0)) | Ok(Err(_)) | Err(_) => {}
                    Ok(Ok(_)) => panic!("server answered after stop"),
                }
            }
        }
    }

    #[tokio::test]
    async fn stats_reflect_empty_server() {
        let server = test_server(18696);
        let stats = server.stats();
        assert!(!stats.running);
        assert_eq!(stats.client_count, 0);
        assert_eq!(stats.total_streams, 0);
    }
}
