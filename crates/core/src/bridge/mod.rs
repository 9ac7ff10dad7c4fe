//! WebRTC bridge: the upstream half of a camera stream.
//!
//! One bridge per camera stream. It resolves signaling parameters through
//! the cloud API collaborator, negotiates a peer connection with the device
//! over MQTT (offer/answer + trickle ICE), and routes received RTP into the
//! stream's forwarder. HEVC streams arrive over a data channel instead of
//! media tracks and are demuxed by SSRC after a small probe handshake.
//!
//! Failure anywhere (signaling timeout, peer connection failed/closed, data
//! channel error, remote disconnect) funnels through [`WebRtcBridge::fail`]:
//! the readiness waiter is released with the error, then the stream's error
//! sink is invoked.

pub mod munge;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Unmarshal;

use crate::camera::{CameraInfo, Resolution, Skill};
use crate::cloud::{CloudApi, IceServer, UserSession};
use crate::error::{EngineError, Result};
use crate::forward::RtpForwarder;
use crate::signaling::{CameraSignaling, SignalingClient, SignalingEvent};
use crate::sync::Waiter;

/// Label of the HEVC media data channel.
const DATA_CHANNEL_LABEL: &str = "fmp4Stream";

/// String message on the HEVC data channel.
#[derive(Debug, Serialize, Deserialize)]
struct ProbeMessage {
    #[serde(rename = "type")]
    kind: String,
    msg: String,
}

impl ProbeMessage {
    fn new(kind: &str, msg: &str) -> Self {
        Self {
            kind: kind.to_string(),
            msg: msg.to_string(),
        }
    }
}

/// Payload of the probe's `recv` message: the SSRCs the device will use
/// for RTP carried over the data channel.
#[derive(Debug, Deserialize)]
struct RecvSsrcs {
    video: SsrcEntry,
    audio: SsrcEntry,
}

#[derive(Debug, Deserialize)]
struct SsrcEntry {
    ssrc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Video,
    Audio,
}

fn probe_text(kind: &str, msg: &str) -> Result<String> {
    serde_json::to_string(&ProbeMessage::new(kind, msg))
        .map_err(|e| EngineError::Upstream(format!("probe serialization failed: {e}")))
}

/// Classify a data-channel RTP packet by the SSRCs recorded during the
/// probe. Unknown SSRCs are dropped.
fn match_ssrc(video_ssrc: u32, audio_ssrc: u32, ssrc: u32) -> Option<MediaKind> {
    if ssrc == video_ssrc {
        Some(MediaKind::Video)
    } else if ssrc == audio_ssrc {
        Some(MediaKind::Audio)
    } else {
        None
    }
}

type ErrorSink = Box<dyn Fn(&EngineError) + Send + Sync>;

#[derive(Default)]
struct BridgeInner {
    pc: Option<Arc<RTCPeerConnection>>,
    signaling: Option<Arc<SignalingClient>>,
    camera_sig: Option<Arc<CameraSignaling>>,
    backchannel: Option<Arc<TrackLocalStaticRTP>>,
}

/// Owns the peer connection for one camera stream.
pub struct WebRtcBridge {
    camera: CameraInfo,
    resolution: Resolution,
    user: UserSession,
    cloud: Arc<dyn CloudApi>,
    forwarder: Arc<RtpForwarder>,
    ready: Waiter,
    cancel: CancellationToken,
    connected: AtomicBool,
    hevc_video_ssrc: AtomicU32,
    hevc_audio_ssrc: AtomicU32,
    inner: Mutex<BridgeInner>,
    on_error: Mutex<Option<ErrorSink>>,
}

impl WebRtcBridge {
    pub fn new(
        camera: CameraInfo,
        resolution: Resolution,
        user: UserSession,
        cloud: Arc<dyn CloudApi>,
        forwarder: Arc<RtpForwarder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            camera,
            resolution,
            user,
            cloud,
            forwarder,
            ready: Waiter::new(),
            cancel: CancellationToken::new(),
            connected: AtomicBool::new(false),
            hevc_video_ssrc: AtomicU32::new(0),
            hevc_audio_ssrc: AtomicU32::new(0),
            inner: Mutex::new(BridgeInner::default()),
            on_error: Mutex::new(None),
        })
    }

    /// Install the stream's error sink. Invoked for every terminal bridge
    /// error, after the readiness waiter has been released.
    pub fn set_on_error(&self, sink: impl Fn(&EngineError) + Send + Sync + 'static) {
        *self.on_error.lock() = Some(Box::new(sink));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drive the full start sequence: cloud resolution, signaling connect,
    /// peer connection negotiation, and the readiness wait (bounded by
    /// `deadline`).
    pub async fn start(self: &Arc<Self>, deadline: Duration) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::Internal("bridge already connected".into()));
        }

        tracing::info!(
            camera = %self.camera.device_name,
            resolution = %self.resolution,
            "starting WebRTC bridge"
        );

        let app = self.cloud.app_info(&self.user).await?;
        tracing::debug!(client_id = %app.client_id, "cloud app identity");

        // Device capability is checked before any signaling session is
        // opened, so incapable devices fail fast and cheap.
        let webrtc_config = self
            .cloud
            .webrtc_config(&self.user, &self.camera.device_id)
            .await?;
        if !webrtc_config.supports_webrtc {
            return Err(EngineError::Upstream(format!(
                "device {} does not support WebRTC",
                self.camera.device_id
            )));
        }

        let skill = Skill::parse(&webrtc_config.skill)?;
        let stream_type = skill.stream_type_for(self.resolution);
        let is_hevc = skill.is_hevc(stream_type);
        tracing::info!(stream_type, is_hevc, "resolved stream settings");

        let mqtt_config = self.cloud.mqtt_config(&self.user).await?;
        let signaling = SignalingClient::connect(&self.user.mqtts_url, &mqtt_config).await?;
        // Stored immediately so stop() reaches it even when a later start
        // step fails.
        self.inner.lock().signaling = Some(signaling.clone());

        let pc = build_peer_connection(&webrtc_config.ices).await?;
        let camera_sig = Arc::new(CameraSignaling::new(
            signaling.clone(),
            &self.camera.device_id,
            &webrtc_config,
        ));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        signaling.register(camera_sig.session_id(), event_tx);
        tokio::spawn(signaling_event_loop(
            Arc::downgrade(self),
            event_rx,
            self.cancel.clone(),
        ));

        {
            let mut inner = self.inner.lock();
            inner.pc = Some(pc.clone());
            inner.camera_sig = Some(camera_sig.clone());
        }

        if is_hevc {
            self.setup_data_channel(&pc).await?;
        }
        self.install_state_handler(&pc, is_hevc);
        self.install_track_handler(&pc, is_hevc);
        self.install_candidate_handler(&pc);

        pc.add_transceiver_from_kind(
            RTPCodecType::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendrecv,
                send_encodings: vec![],
            }),
        )
        .await?;
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        // Devices choke on header-extension maps; strip them before the
        // offer leaves the process.
        let offer = pc.create_offer(None).await?;
        let munged = munge::strip_extmap(&offer.sdp);
        pc.set_local_description(RTCSessionDescription::offer(munged.clone())?)
            .await?;
        camera_sig
            .send_offer(munged, self.resolution, stream_type, is_hevc)
            .await?;

        self.ready.wait_timeout(deadline).await?;
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(camera = %self.camera.device_name, "WebRTC bridge ready");
        Ok(())
    }

    /// Tear everything down: signaling disconnect, peer connection close,
    /// signaling stop, forwarder stop, task cancellation. Idempotent.
    pub async fn stop(&self) {
        let (pc, signaling, camera_sig) = {
            let mut inner = self.inner.lock();
            inner.backchannel = None;
            (
                inner.pc.take(),
                inner.signaling.take(),
                inner.camera_sig.take(),
            )
        };

        if let Some(camera_sig) = &camera_sig {
            let _ = camera_sig.send_disconnect().await;
        }
        if let (Some(signaling), Some(camera_sig)) = (&signaling, &camera_sig) {
            signaling.unregister(camera_sig.session_id());
        }
        if let Some(pc) = pc {
            let _ = pc.close().await;
        }
        if let Some(signaling) = signaling {
            signaling.stop().await;
        }
        self.forwarder.stop().await;
        self.cancel.cancel();

        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::info!(camera = %self.camera.device_name, "WebRTC bridge stopped");
        }
    }

    /// Terminal error path: release the readiness waiter, then notify the
    /// stream's error sink.
    fn fail(&self, err: EngineError) {
        self.ready.done(Err(EngineError::Upstream(err.to_string())));
        if let Some(sink) = self.on_error.lock().as_ref() {
            sink(&err);
        }
    }

    fn peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.inner.lock().pc.clone()
    }

    fn camera_signaling(&self) -> Option<Arc<CameraSignaling>> {
        self.inner.lock().camera_sig.clone()
    }

    /// Set the device's answer: first as a provisional answer verbatim,
    /// then as the final answer with the audio m-line rebuilt from the
    /// offer (single-format device answers).
    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        tracing::trace!("received WebRTC answer");
        let pc = self
            .peer_connection()
            .ok_or_else(|| EngineError::Internal("answer before peer connection".into()))?;

        pc.set_remote_description(RTCSessionDescription::pranswer(sdp.to_string())?)
            .await?;

        let offer_sdp = pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or_default();
        let fixed = munge::fix_answer_audio(&offer_sdp, sdp);
        pc.set_remote_description(RTCSessionDescription::answer(fixed)?)
            .await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: String) -> Result<()> {
        let pc = self
            .peer_connection()
            .ok_or_else(|| EngineError::Internal("candidate before peer connection".into()))?;
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate,
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    async fn setup_data_channel(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>) -> Result<()> {
        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    max_retransmits: Some(5),
                    ..Default::default()
                }),
            )
            .await?;

        let weak = Arc::downgrade(self);
        let dc_open = dc.clone();
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            let dc = dc_open.clone();
            Box::pin(async move {
                let result = match probe_text("codec", "") {
                    Ok(request) => dc
                        .send_text(request)
                        .await
                        .map(|_| ())
                        .map_err(|e| EngineError::Upstream(format!("codec request failed: {e}"))),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    if let Some(bridge) = weak.upgrade() {
                        bridge.fail(e);
                    }
                }
            })
        }));

        let weak = Arc::downgrade(self);
        let dc_msg = dc.clone();
        dc.on_message(Box::new(move |msg| {
            let weak = weak.clone();
            let dc = dc_msg.clone();
            Box::pin(async move {
                let Some(bridge) = weak.upgrade() else { return };
                if msg.is_string {
                    if let Err(e) = bridge.handle_probe_message(&dc, &msg.data).await {
                        bridge.fail(e);
                    }
                } else {
                    bridge.dispatch_data_channel_rtp(&msg.data).await;
                }
            })
        }));

        let weak = Arc::downgrade(self);
        dc.on_error(Box::new(move |e| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(bridge) = weak.upgrade() {
                    bridge.fail(EngineError::Upstream(format!("data channel error: {e}")));
                }
            })
        }));

        let weak = Arc::downgrade(self);
        dc.on_close(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(bridge) = weak.upgrade() {
                    bridge.fail(EngineError::Upstream("data channel closed".into()));
                }
            })
        }));

        Ok(())
    }

    /// Probe handshake: `codec` → `start frame` → `recv` (SSRCs) →
    /// `complete`, then the bridge is ready.
    async fn handle_probe_message(&self, dc: &Arc<RTCDataChannel>, data: &[u8]) -> Result<()> {
        let message: ProbeMessage = serde_json::from_slice(data)
            .map_err(|e| EngineError::Upstream(format!("malformed data channel message: {e}")))?;

        match message.kind.as_str() {
            "codec" => {
                dc.send_text(probe_text("start", "frame")?)
                    .await
                    .map_err(|e| EngineError::Upstream(format!("frame request failed: {e}")))?;
            }
            "recv" => {
                let ssrcs: RecvSsrcs = serde_json::from_str(&message.msg)
                    .map_err(|e| EngineError::Upstream(format!("malformed recv message: {e}")))?;
                self.hevc_video_ssrc
                    .store(ssrcs.video.ssrc, Ordering::SeqCst);
                self.hevc_audio_ssrc
                    .store(ssrcs.audio.ssrc, Ordering::SeqCst);

                dc.send_text(probe_text("complete", "")?)
                    .await
                    .map_err(|e| EngineError::Upstream(format!("complete message failed: {e}")))?;

                tracing::debug!(
                    video_ssrc = ssrcs.video.ssrc,
                    audio_ssrc = ssrcs.audio.ssrc,
                    "data channel probe complete"
                );
                self.ready.done(Ok(()));
            }
            other => {
                tracing::trace!(kind = other, "ignoring data channel message");
            }
        }
        Ok(())
    }

    async fn dispatch_data_channel_rtp(&self, data: &[u8]) {
        let mut buf = data;
        let packet = match Packet::unmarshal(&mut buf) {
            Ok(p) => p,
            Err(_) => return,
        };

        let video = self.hevc_video_ssrc.load(Ordering::SeqCst);
        let audio = self.hevc_audio_ssrc.load(Ordering::SeqCst);
        match match_ssrc(video, audio, packet.header.ssrc) {
            Some(MediaKind::Video) => self.forwarder.forward_video(&packet).await,
            Some(MediaKind::Audio) => self.forwarder.forward_audio(&packet).await,
            None => {}
        }
    }

    fn install_state_handler(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>, is_hevc: bool) {
        let weak = Arc::downgrade(self);
        let resolution = self.resolution;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(bridge) = weak.upgrade() else { return };
                match state {
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        bridge.fail(EngineError::Upstream(format!("peer connection {state}")));
                    }
                    RTCPeerConnectionState::Connected => {
                        tracing::info!("WebRTC connection established");
                        if !is_hevc {
                            if resolution == Resolution::Hd {
                                if let Some(sig) = bridge.camera_signaling() {
                                    if let Err(e) = sig.send_resolution(0).await {
                                        tracing::warn!(error = %e, "resolution command failed");
                                    }
                                }
                            }
                            bridge.ready.done(Ok(()));
                        }
                    }
                    _ => {}
                }
            })
        }));
    }

    fn install_track_handler(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>, is_hevc: bool) {
        let weak = Arc::downgrade(self);
        pc.on_track(Box::new(move |track, _receiver, transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(bridge) = weak.upgrade() else { return };
                let codec = track.codec();
                tracing::trace!(
                    mime = %codec.capability.mime_type,
                    payload_type = codec.payload_type,
                    "received remote track"
                );

                match track.kind() {
                    RTPCodecType::Video => {
                        if !is_hevc {
                            bridge.spawn_track_reader(track, MediaKind::Video);
                        }
                    }
                    RTPCodecType::Audio => {
                        bridge.install_backchannel(&track, &transceiver).await;
                        if !is_hevc {
                            bridge.spawn_track_reader(track, MediaKind::Audio);
                        }
                    }
                    _ => {}
                }
            })
        }));
    }

    fn install_candidate_handler(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>) {
        let weak = Arc::downgrade(self);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Some(bridge) = weak.upgrade() else { return };

                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        tracing::warn!(error = %e, "unserializable ICE candidate");
                        return;
                    }
                };
                tracing::trace!(candidate = %init.candidate, "generated ICE candidate");

                if let Some(sig) = bridge.camera_signaling() {
                    // Device side expects SDP attribute framing.
                    if let Err(e) = sig.send_candidate(&format!("a={}", init.candidate)).await {
                        tracing::warn!(error = %e, "failed to send ICE candidate");
                    }
                }
            })
        }));
    }

    /// Talk-back path: mirror the remote audio track with a local static
    /// RTP track on the same transceiver, then drain the forwarder's
    /// back-channel into it.
    async fn install_backchannel(
        self: &Arc<Self>,
        track: &Arc<TrackRemote>,
        transceiver: &Arc<RTCRtpTransceiver>,
    ) {
        let direction = transceiver.direction();
        if direction != RTCRtpTransceiverDirection::Sendrecv
            && direction != RTCRtpTransceiverDirection::Sendonly
        {
            return;
        }

        let capability = RTCRtpCodecCapability {
            mime_type: track.codec().capability.mime_type.clone(),
            ..Default::default()
        };
        let local = Arc::new(TrackLocalStaticRTP::new(
            capability,
            "audio-backchannel".to_string(),
            "tuya-rtsp".to_string(),
        ));

        let sender = transceiver.sender().await;
        if let Err(e) = sender
            .replace_track(Some(local.clone() as Arc<dyn TrackLocal + Send + Sync>))
            .await
        {
            tracing::warn!(error = %e, "failed to install backchannel track");
            return;
        }

        self.inner.lock().backchannel = Some(local.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        self.forwarder.set_backchannel_sink(tx);
        tokio::spawn(backchannel_drain(local, rx, self.cancel.clone()));

        if let Some(sig) = self.camera_signaling() {
            if let Err(e) = sig.send_speaker(1).await {
                tracing::debug!(error = %e, "speaker command failed");
            }
        }
        tracing::trace!("backchannel track installed");
    }

    fn spawn_track_reader(self: &Arc<Self>, track: Arc<TrackRemote>, kind: MediaKind) {
        let forwarder = self.forwarder.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = track.read_rtp() => match result {
                        Ok((packet, _)) => match kind {
                            MediaKind::Video => forwarder.forward_video(&packet).await,
                            MediaKind::Audio => forwarder.forward_audio(&packet).await,
                        },
                        Err(e) => {
                            // Track closure is routine; only unexpected
                            // errors are worth noise.
                            let text = e.to_string();
                            if text.contains("EOF") || text.contains("closed") {
                                return;
                            }
                            tracing::warn!(error = %e, "unexpected RTP read error");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        });
    }
}

async fn signaling_event_loop(
    bridge: Weak<WebRtcBridge>,
    mut events: mpsc::UnboundedReceiver<SignalingEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(SignalingEvent::Answer(frame)) => {
                    let Some(bridge) = bridge.upgrade() else { break };
                    if let Err(e) = bridge.apply_answer(&frame.sdp).await {
                        bridge.fail(e);
                    }
                }
                Some(SignalingEvent::Candidate(frame)) => {
                    if frame.candidate.is_empty() {
                        continue;
                    }
                    let Some(bridge) = bridge.upgrade() else { break };
                    if let Err(e) = bridge.add_remote_candidate(frame.candidate).await {
                        bridge.fail(e);
                    }
                }
                Some(SignalingEvent::Disconnect) => {
                    if let Some(bridge) = bridge.upgrade() {
                        bridge.fail(EngineError::Upstream("remote disconnect".into()));
                    }
                    break;
                }
                None => break,
            }
        }
    }
}

async fn backchannel_drain(
    track: Arc<TrackLocalStaticRTP>,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            packet = rx.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = track.write_rtp(&packet).await {
                        tracing::debug!(error = %e, "backchannel write failed");
                    }
                }
                None => break,
            }
        }
    }
}

async fn build_peer_connection(ices: &[IceServer]) -> Result<Arc<RTCPeerConnection>> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: ices
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![server.urls.clone()],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ice_transport_policy: RTCIceTransportPolicy::All,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}
