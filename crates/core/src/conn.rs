//! Per-connection RTSP handling.
//!
//! One task per TCP connection. The first request resolves the camera
//! path through the inventory and attaches the connection to a stream
//! (creating it lazily); subsequent requests run through the method
//! dispatch. Between requests the reader peeks one byte: a `$` means an
//! interleaved frame follows (back-channel RTP from the client), anything
//! else is parsed as an RTSP request. Reads carry a 60 s deadline; an
//! idle or broken connection deregisters the client from the server and
//! its stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

use crate::error::EngineError;
use crate::forward::{SharedTcpWriter, INTERLEAVED_MAGIC};
use crate::protocol::transport::{parse_transport, Track, TransportSpec};
use crate::protocol::{self, sdp, RtspRequest, RtspResponse};
use crate::server::ServerShared;
use crate::session::{ClientSession, TransportMode, SESSION_TIMEOUT_SECS};
use crate::stream::CameraStream;

const READ_DEADLINE: Duration = Duration::from_secs(SESSION_TIMEOUT_SECS);

/// Cap on a single request's header block.
const MAX_REQUEST_BYTES: usize = 16 * 1024;

enum Flow {
    Continue,
    Close,
}

fn flow(write_ok: bool) -> Flow {
    if write_ok {
        Flow::Continue
    } else {
        Flow::Close
    }
}

pub(crate) async fn handle_connection(
    server: Arc<ServerShared>,
    socket: TcpStream,
    peer: SocketAddr,
) {
    tracing::info!(%peer, "RTSP client connected");

    let (read_half, write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let writer: SharedTcpWriter = Arc::new(tokio::sync::Mutex::new(write_half));

    // The first request carries the camera path.
    let first_raw = match timeout(READ_DEADLINE, read_raw_request(&mut reader)).await {
        Ok(Ok(Some(raw))) => raw,
        _ => {
            tracing::debug!(%peer, "connection closed before first request");
            return;
        }
    };
    let first = match RtspRequest::parse(&first_raw) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "malformed initial request");
            send_to(&writer, RtspResponse::bad_request()).await;
            return;
        }
    };

    let (camera_path, resolution) = match protocol::extract_camera_path(&first.uri) {
        Some(parsed) => parsed,
        None => {
            tracing::warn!(%peer, uri = %first.uri, "request URI has no camera path");
            send_to(&writer, RtspResponse::bad_request()).await;
            return;
        }
    };

    let binding = match server.inventory.resolve(&camera_path) {
        Some(binding) => binding,
        None => {
            tracing::warn!(%peer, %camera_path, "no camera at path");
            send_to(&writer, RtspResponse::not_found()).await;
            return;
        }
    };
    tracing::info!(
        %peer,
        camera = %binding.camera.device_name,
        device_id = %binding.camera.device_id,
        %resolution,
        "RTSP connection for camera"
    );

    let stream = server.get_or_create_stream(&binding, resolution);
    let client = ClientSession::new(peer, &camera_path, resolution);
    let session_id = client.id.clone();

    server.register_client(&client);
    stream.add_client(&client.id);

    let mut conn = Connection {
        reader,
        writer,
        peer,
        client,
        stream: stream.clone(),
        server: server.clone(),
    };
    let reason = conn.run(first).await;

    server.remove_client(&session_id);
    stream.remove_client(&session_id).await;
    tracing::info!(%peer, reason, "RTSP client disconnected");
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: SharedTcpWriter,
    peer: SocketAddr,
    client: ClientSession,
    stream: Arc<CameraStream>,
    server: Arc<ServerShared>,
}

impl Connection {
    /// Request/interleaved-frame loop. Returns the reason for exiting.
    async fn run(&mut self, first: RtspRequest) -> &'static str {
        if let Flow::Close = self.dispatch(&first).await {
            return "closed after initial request";
        }

        let cancel = self.server.cancel.clone();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return "server shutting down",
                result = timeout(READ_DEADLINE, peek_byte(&mut self.reader)) => result,
            };

            let byte = match next {
                Err(_) => return "session timeout",
                Ok(Err(_)) => return "read error",
                Ok(Ok(None)) => return "connection closed by client",
                Ok(Ok(Some(byte))) => byte,
            };

            if byte == INTERLEAVED_MAGIC {
                if self.read_interleaved().await.is_err() {
                    return "interleaved read error";
                }
                continue;
            }

            let raw = match timeout(READ_DEADLINE, read_raw_request(&mut self.reader)).await {
                Err(_) => return "session timeout",
                Ok(Err(_)) => return "read error",
                Ok(Ok(None)) => return "connection closed by client",
                Ok(Ok(Some(raw))) => raw,
            };
            if raw.trim().is_empty() {
                continue;
            }

            match RtspRequest::parse(&raw) {
                Ok(request) => {
                    if let Flow::Close = self.dispatch(&request).await {
                        return "teardown";
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "malformed request");
                    if !self.send(RtspResponse::bad_request()).await {
                        return "write error";
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, request: &RtspRequest) -> Flow {
        let cseq = request.cseq().unwrap_or("0").to_string();
        tracing::debug!(
            peer = %self.peer,
            method = %request.method,
            uri = %request.uri,
            %cseq,
            "request"
        );

        match request.method.as_str() {
            "OPTIONS" => flow(
                self.send(
                    RtspResponse::ok()
                        .add_header("CSeq", &cseq)
                        .add_header("Public", "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN"),
                )
                .await,
            ),
            "DESCRIBE" => self.handle_describe(request, &cseq).await,
            "SETUP" => self.handle_setup(request, &cseq).await,
            "PLAY" => self.handle_play(request, &cseq).await,
            "TEARDOWN" => self.handle_teardown(request, &cseq).await,
            method => {
                tracing::warn!(method, %cseq, "unsupported RTSP method");
                flow(
                    self.send(RtspResponse::not_implemented().add_header("CSeq", &cseq))
                        .await,
                )
            }
        }
    }

    async fn handle_describe(&mut self, request: &RtspRequest, cseq: &str) -> Flow {
        let skill = self.stream.camera().parsed_skill();
        let body = sdp::generate(&skill, self.client.resolution, &request.uri);

        flow(
            self.send(
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Content-Base", &request.uri)
                    .add_header("Cache-Control", "no-cache")
                    .with_body(body),
            )
            .await,
        )
    }

    async fn handle_setup(&mut self, request: &RtspRequest, cseq: &str) -> Flow {
        let transport_header = match request.get_header("Transport") {
            Some(header) => header,
            None => {
                tracing::warn!(%cseq, "SETUP missing Transport header");
                return flow(self.send(RtspResponse::bad_request().add_header("CSeq", cseq)).await);
            }
        };

        let track = Track::from_path(&request.uri);
        let spec = match parse_transport(transport_header, track.unwrap_or(Track::Video)) {
            Ok(spec) => spec,
            Err(EngineError::UnsupportedTransport(_)) => {
                tracing::warn!(%cseq, transport_header, "unsupported transport");
                return flow(
                    self.send(RtspResponse::unsupported_transport().add_header("CSeq", cseq))
                        .await,
                );
            }
            Err(e) => {
                tracing::warn!(%cseq, transport_header, error = %e, "invalid Transport header");
                return flow(self.send(RtspResponse::bad_request().add_header("CSeq", cseq)).await);
            }
        };

        let mode = match spec {
            TransportSpec::Udp { .. } => TransportMode::Udp,
            TransportSpec::Tcp { .. } => TransportMode::TcpInterleaved,
        };
        if let Some(previous) = self.client.transport {
            if previous != mode {
                tracing::warn!(
                    session_id = %self.client.id,
                    "SETUP transport mode conflicts with earlier SETUP"
                );
                return flow(self.send(RtspResponse::bad_request().add_header("CSeq", cseq)).await);
            }
        }
        self.client.transport = Some(mode);

        let forwarder = self.stream.forwarder().clone();
        let mut server_port = None;

        match spec {
            TransportSpec::Tcp { rtp_channel, .. } => {
                match track {
                    Some(Track::Video) => self.client.video_channel = rtp_channel,
                    Some(Track::Audio) => self.client.audio_channel = rtp_channel,
                    Some(Track::Backchannel) => {
                        self.client.back_channel = rtp_channel;
                        self.client.back_setup = true;
                    }
                    None => {}
                }
                forwarder
                    .add_tcp_client(
                        &self.client.id,
                        self.writer.clone(),
                        self.client.video_channel,
                        self.client.audio_channel,
                        self.client.back_channel,
                    )
                    .await;
            }
            TransportSpec::Udp { rtp_port, .. } => {
                match track {
                    Some(Track::Video) => self.client.video_port = rtp_port,
                    Some(Track::Audio) => self.client.audio_port = rtp_port,
                    Some(Track::Backchannel) => self.client.back_client_port = rtp_port,
                    None => {}
                }

                if let Err(e) = forwarder
                    .add_udp_client(
                        &self.client.id,
                        self.peer.ip(),
                        self.client.video_port,
                        self.client.audio_port,
                    )
                    .await
                {
                    tracing::error!(error = %e, "failed to register UDP RTP client");
                    return flow(
                        self.send(RtspResponse::internal_error().add_header("CSeq", cseq))
                            .await,
                    );
                }

                if track == Some(Track::Backchannel) {
                    match forwarder
                        .setup_udp_backchannel(&self.client.id, rtp_port)
                        .await
                    {
                        Ok(port) => {
                            self.client.back_server_port = port;
                            self.client.back_setup = true;
                            server_port = Some(port);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to set up UDP backchannel");
                            return flow(
                                self.send(RtspResponse::internal_error().add_header("CSeq", cseq))
                                    .await,
                            );
                        }
                    }
                }
            }
        }

        self.client.setup_count += 1;
        tracing::trace!(
            session_id = %self.client.id,
            setup_count = self.client.setup_count,
            track = ?track,
            "track set up"
        );

        flow(
            self.send(
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Transport", &spec.response_value(server_port))
                    .add_header("Session", &self.client.session_header()),
            )
            .await,
        )
    }

    async fn handle_play(&mut self, request: &RtspRequest, cseq: &str) -> Flow {
        match request.session_id() {
            Some(id) if id == self.client.id => {}
            _ => {
                tracing::warn!(%cseq, "PLAY with missing or mismatched Session header");
                return flow(
                    self.send(RtspResponse::session_not_found().add_header("CSeq", cseq))
                        .await,
                );
            }
        }

        self.stream.forwarder().set_playing(&self.client.id).await;
        tracing::info!(session_id = %self.client.id, "client playing");

        let rtp_info = format!("url={};seq=1;rtptime=0", request.uri);
        flow(
            self.send(
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Session", &self.client.id)
                    .add_header("Range", "npt=0.000-")
                    .add_header("RTP-Info", &rtp_info),
            )
            .await,
        )
    }

    async fn handle_teardown(&mut self, request: &RtspRequest, cseq: &str) -> Flow {
        match request.session_id() {
            Some(id) if id == self.client.id => {}
            _ => {
                tracing::warn!(%cseq, "TEARDOWN with missing or mismatched Session header");
                return flow(
                    self.send(RtspResponse::session_not_found().add_header("CSeq", cseq))
                        .await,
                );
            }
        }

        tracing::info!(session_id = %self.client.id, "client teardown");
        let _ = self
            .send(
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Session", &self.client.id),
            )
            .await;
        Flow::Close
    }

    /// Consume one interleaved frame. Back-channel RTP is routed to the
    /// bridge; frames on other channels (client RTCP) are dropped.
    async fn read_interleaved(&mut self) -> std::io::Result<()> {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header).await?;
        if header[0] != INTERLEAVED_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "missing interleaved magic byte",
            ));
        }

        let channel = header[1];
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await?;

        if self.client.back_setup
            && self.client.transport == Some(TransportMode::TcpInterleaved)
            && channel == self.client.back_channel
        {
            let mut data = body.as_slice();
            if let Ok(packet) = Packet::unmarshal(&mut data) {
                self.stream.forwarder().forward_backchannel(packet);
            }
        }
        Ok(())
    }

    async fn send(&self, response: RtspResponse) -> bool {
        tracing::debug!(peer = %self.peer, status = response.status_code, "response");
        let bytes = response.serialize();
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes.as_bytes()).await.is_ok()
    }
}

async fn send_to(writer: &SharedTcpWriter, response: RtspResponse) {
    let mut writer = writer.lock().await;
    let _ = writer.write_all(response.serialize().as_bytes()).await;
}

/// Peek the next byte without consuming it. `None` at EOF.
async fn peek_byte<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<u8>> {
    let buf = reader.fill_buf().await?;
    Ok(buf.first().copied())
}

/// Read one request's header block (through the blank line). `None` at
/// EOF before any byte of the request.
async fn read_raw_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<String>> {
    let mut text = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            if text.is_empty() {
                return Ok(None);
            }
            break;
        }
        text.push_str(&line);
        if line == "\r\n" || line == "\n" || text.len() > MAX_REQUEST_BYTES {
            break;
        }
    }
    Ok(Some(text))
}
