//! RTP fan-out: one upstream WebRTC session to many RTSP client sinks.
//!
//! Each camera stream owns one [`RtpForwarder`]. RTSP SETUP registers a
//! sink (UDP socket pair or TCP interleaved channels), PLAY unblocks
//! delivery, TEARDOWN/disconnect deregisters. Packets are forwarded
//! verbatim after deserialization — SSRC and sequence numbers are preserved
//! from the upstream session, which is authoritative.
//!
//! Writes are best-effort: a single sink's write error is logged and the
//! sink stays registered; the idle reaper removes sinks whose last
//! successful write is too old.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use webrtc::rtp::packet::Packet;
use webrtc::util::{Marshal, Unmarshal};

use crate::error::{EngineError, Result};
use crate::ports;

/// Write half of the RTSP TCP connection, shared between the protocol
/// layer (responses) and the forwarder (interleaved RTP). The mutex keeps
/// framing and responses from interleaving mid-write on the wire.
pub type SharedTcpWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Interleaved frame magic byte (RFC 2326 §10.12).
pub const INTERLEAVED_MAGIC: u8 = b'$';

/// Which media track a packet belongs to.
#[derive(Debug, Clone, Copy)]
enum TrackKind {
    Video,
    Audio,
}

/// Frame an RTP packet for interleaved transport:
/// `'$' | channel | length_be16 | rtp_bytes`, as a single buffer so one
/// write puts the whole frame on the wire.
pub fn frame_interleaved(channel: u8, rtp: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(4 + rtp.len());
    framed.push(INTERLEAVED_MAGIC);
    framed.push(channel);
    framed.extend_from_slice(&(rtp.len() as u16).to_be_bytes());
    framed.extend_from_slice(rtp);
    framed
}

struct UdpSink {
    video: Option<UdpSocket>,
    video_port: u16,
    audio: Option<UdpSocket>,
    audio_port: u16,
    backchannel: Option<BackchannelListener>,
}

struct BackchannelListener {
    server_rtp_port: u16,
    tasks: Vec<AbortHandle>,
}

struct TcpSink {
    conn: SharedTcpWriter,
    video_channel: u8,
    audio_channel: u8,
    back_channel: u8,
}

enum SinkKind {
    Udp(UdpSink),
    Tcp(TcpSink),
}

struct SinkEntry {
    /// PLAY received; fan-out is gated on this.
    playing: AtomicBool,
    /// Last successful write, for idle cleanup.
    last_activity: parking_lot::Mutex<Instant>,
    kind: SinkKind,
}

impl SinkEntry {
    fn new(kind: SinkKind) -> Self {
        Self {
            playing: AtomicBool::new(false),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            kind,
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn abort_backchannel_tasks(&self) {
        if let SinkKind::Udp(udp) = &self.kind {
            if let Some(back) = &udp.backchannel {
                for task in &back.tasks {
                    task.abort();
                }
            }
        }
    }
}

/// Fan-out of RTP packets to registered client sinks.
pub struct RtpForwarder {
    clients: RwLock<HashMap<String, SinkEntry>>,
    backchannel_tx: Arc<parking_lot::Mutex<Option<mpsc::UnboundedSender<Packet>>>>,
    cancel: CancellationToken,
}

impl RtpForwarder {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            backchannel_tx: Arc::new(parking_lot::Mutex::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    /// Register or update a UDP sink. A port of 0 means "no such track";
    /// updating an existing session rebinds only the changed ports.
    pub async fn add_udp_client(
        &self,
        session: &str,
        peer_ip: IpAddr,
        video_port: u16,
        audio_port: u16,
    ) -> Result<()> {
        let mut clients = self.clients.write().await;

        let entry = clients.entry(session.to_string()).or_insert_with(|| {
            SinkEntry::new(SinkKind::Udp(UdpSink {
                video: None,
                video_port: 0,
                audio: None,
                audio_port: 0,
                backchannel: None,
            }))
        });

        let udp = match &mut entry.kind {
            SinkKind::Udp(udp) => udp,
            SinkKind::Tcp(_) => {
                return Err(EngineError::Internal(format!(
                    "client {session} is registered for TCP transport"
                )))
            }
        };

        if video_port > 0 && (udp.video.is_none() || udp.video_port != video_port) {
            udp.video = Some(connect_udp(peer_ip, video_port).await?);
            udp.video_port = video_port;
        }
        if audio_port > 0 && (udp.audio.is_none() || udp.audio_port != audio_port) {
            udp.audio = Some(connect_udp(peer_ip, audio_port).await?);
            udp.audio_port = audio_port;
        }
        entry.touch();

        tracing::trace!(
            session,
            video_port,
            audio_port,
            "registered UDP RTP client"
        );
        Ok(())
    }

    /// Register or update a TCP interleaved sink. The forwarder does not
    /// own the connection; closing it is the RTSP layer's duty.
    pub async fn add_tcp_client(
        &self,
        session: &str,
        conn: SharedTcpWriter,
        video_channel: u8,
        audio_channel: u8,
        back_channel: u8,
    ) {
        let mut clients = self.clients.write().await;

        if let Some(entry) = clients.get_mut(session) {
            if let SinkKind::Tcp(tcp) = &mut entry.kind {
                tcp.video_channel = video_channel;
                tcp.audio_channel = audio_channel;
                tcp.back_channel = back_channel;
                entry.touch();
                return;
            }
            // Same session re-registered with a different transport is
            // rejected at the protocol layer; replace here regardless.
            entry.abort_backchannel_tasks();
            clients.remove(session);
        }

        clients.insert(
            session.to_string(),
            SinkEntry::new(SinkKind::Tcp(TcpSink {
                conn,
                video_channel,
                audio_channel,
                back_channel,
            })),
        );

        tracing::trace!(
            session,
            video_channel,
            audio_channel,
            back_channel,
            "registered TCP RTP client"
        );
    }

    /// Allocate a server-side UDP pair for the client's back-channel and
    /// start the reader that demuxes inbound RTP toward the bridge. RTCP is
    /// silently drained. Returns the server RTP port (even). Idempotent per
    /// session: repeat calls return the existing port.
    pub async fn setup_udp_backchannel(&self, session: &str, client_port: u16) -> Result<u16> {
        let mut clients = self.clients.write().await;

        let entry = clients.get_mut(session).ok_or_else(|| {
            EngineError::Internal(format!("backchannel setup for unknown client {session}"))
        })?;
        let udp = match &mut entry.kind {
            SinkKind::Udp(udp) => udp,
            SinkKind::Tcp(_) => {
                return Err(EngineError::Internal(format!(
                    "client {session} is not using UDP transport"
                )))
            }
        };

        if let Some(back) = &udp.backchannel {
            return Ok(back.server_rtp_port);
        }

        let pair = ports::global().allocate_rtp_rtcp_pair()?;
        pair.rtp.set_nonblocking(true)?;
        pair.rtcp.set_nonblocking(true)?;
        let rtp_listener = UdpSocket::from_std(pair.rtp)?;
        let rtcp_listener = UdpSocket::from_std(pair.rtcp)?;

        let rtp_task = tokio::spawn(backchannel_rtp_loop(
            session.to_string(),
            rtp_listener,
            self.backchannel_tx.clone(),
            self.cancel.clone(),
        ))
        .abort_handle();
        let rtcp_task =
            tokio::spawn(backchannel_rtcp_drain(rtcp_listener, self.cancel.clone())).abort_handle();

        udp.backchannel = Some(BackchannelListener {
            server_rtp_port: pair.rtp_port,
            tasks: vec![rtp_task, rtcp_task],
        });
        entry.touch();

        tracing::trace!(
            session,
            client_port,
            server_port = pair.rtp_port,
            "UDP backchannel listener started"
        );
        Ok(pair.rtp_port)
    }

    /// Unblock fan-out for a session (RTSP PLAY).
    pub async fn set_playing(&self, session: &str) {
        if let Some(entry) = self.clients.read().await.get(session) {
            entry.playing.store(true, Ordering::Relaxed);
        }
    }

    /// Install the back-channel sink. Packets arriving on the RTSP
    /// back-channel (UDP listener or interleaved demux) flow into it.
    pub fn set_backchannel_sink(&self, tx: mpsc::UnboundedSender<Packet>) {
        *self.backchannel_tx.lock() = Some(tx);
    }

    /// Route one back-channel packet toward the bridge. Packets arriving
    /// before a sink is installed are dropped without error.
    pub fn forward_backchannel(&self, packet: Packet) {
        if let Some(tx) = self.backchannel_tx.lock().as_ref() {
            let _ = tx.send(packet);
        }
    }

    pub async fn forward_video(&self, packet: &Packet) {
        self.forward(packet, TrackKind::Video).await;
    }

    pub async fn forward_audio(&self, packet: &Packet) {
        self.forward(packet, TrackKind::Audio).await;
    }

    async fn forward(&self, packet: &Packet, track: TrackKind) {
        let clients = self.clients.read().await;
        if clients.is_empty() {
            return;
        }

        let data = match packet.marshal() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "failed to marshal RTP packet");
                return;
            }
        };

        for (session, entry) in clients.iter() {
            if !entry.playing.load(Ordering::Relaxed) {
                continue;
            }

            match &entry.kind {
                SinkKind::Udp(udp) => {
                    let socket = match track {
                        TrackKind::Video => udp.video.as_ref(),
                        TrackKind::Audio => udp.audio.as_ref(),
                    };
                    if let Some(socket) = socket {
                        match socket.send(&data).await {
                            Ok(_) => entry.touch(),
                            Err(e) => {
                                tracing::debug!(%session, error = %e, "UDP RTP write failed")
                            }
                        }
                    }
                }
                SinkKind::Tcp(tcp) => {
                    let channel = match track {
                        TrackKind::Video => tcp.video_channel,
                        TrackKind::Audio => tcp.audio_channel,
                    };
                    let framed = frame_interleaved(channel, &data);
                    let mut conn = tcp.conn.lock().await;
                    match conn.write_all(&framed).await {
                        Ok(()) => entry.touch(),
                        Err(e) => {
                            tracing::debug!(%session, error = %e, "interleaved RTP write failed")
                        }
                    }
                }
            }
        }
    }

    /// Deregister a sink, closing owned sockets and back-channel listeners.
    pub async fn remove_client(&self, session: &str) {
        let mut clients = self.clients.write().await;
        if let Some(entry) = clients.remove(session) {
            entry.abort_backchannel_tasks();
            tracing::trace!(session, "removed RTP client");
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Remove sinks whose last successful write is older than `timeout`.
    pub async fn cleanup_inactive(&self, timeout: Duration) {
        let mut clients = self.clients.write().await;
        let now = Instant::now();
        clients.retain(|session, entry| {
            let idle = now.duration_since(*entry.last_activity.lock());
            if idle > timeout {
                entry.abort_backchannel_tasks();
                tracing::trace!(%session, idle_secs = idle.as_secs(), "removed idle RTP client");
                false
            } else {
                true
            }
        });
    }

    /// Close all owned sockets, stop back-channel listeners, clear the
    /// registry. TCP connections are left to the RTSP layer.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut clients = self.clients.write().await;
        for entry in clients.values() {
            entry.abort_backchannel_tasks();
        }
        clients.clear();
        tracing::trace!("RTP forwarder stopped");
    }
}

impl Default for RtpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

async fn connect_udp(peer_ip: IpAddr, port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect((peer_ip, port)).await?;
    Ok(socket)
}

/// Back-channel RTP listener: parse inbound datagrams and route them to
/// the bridge's sink. Unparseable datagrams are skipped.
async fn backchannel_rtp_loop(
    session: String,
    listener: UdpSocket,
    sink: Arc<parking_lot::Mutex<Option<mpsc::UnboundedSender<Packet>>>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 1500];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.recv_from(&mut buf) => match result {
                Ok((n, _)) => {
                    let mut data = &buf[..n];
                    if let Ok(packet) = Packet::unmarshal(&mut data) {
                        if let Some(tx) = sink.lock().as_ref() {
                            let _ = tx.send(packet);
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(%session, error = %e, "backchannel RTP listener closed");
                    break;
                }
            }
        }
    }
}

async fn backchannel_rtcp_drain(listener: UdpSocket, cancel: CancellationToken) {
    let mut buf = vec![0u8; 1500];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.recv_from(&mut buf) => {
                if result.is_err() {
                    break;
                }
                // RTCP is not consumed; drain and discard.
            }
        }
    }
}
