//! RTSP client session state (RFC 2326 §3, §12.37).
//!
//! One [`ClientSession`] per TCP connection, created on accept and
//! destroyed on connection close or TEARDOWN. The transport mode becomes
//! fixed on the first SETUP; later SETUPs must agree (mismatch is a 400).

use std::net::SocketAddr;

use crate::camera::Resolution;

/// Session timeout in seconds (RFC 2326 §12.37); echoed in the `Session`
/// response header and enforced as the connection read deadline.
pub const SESSION_TIMEOUT_SECS: u64 = 60;

/// Negotiated RTP transport mode, fixed at the first SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Udp,
    TcpInterleaved,
}

/// Per-connection RTSP client state.
#[derive(Debug)]
pub struct ClientSession {
    /// Unique session identifier (16 hex chars, 8 random bytes).
    pub id: String,
    /// Camera path this connection resolved to (e.g. `/Front`).
    pub camera_path: String,
    pub resolution: Resolution,
    /// Remote address of the RTSP TCP connection; UDP sinks are addressed
    /// to this peer's IP.
    pub peer: SocketAddr,
    /// Fixed on first SETUP.
    pub transport: Option<TransportMode>,

    // UDP per-track client ports (0 = track not set up).
    pub video_port: u16,
    pub audio_port: u16,
    pub back_client_port: u16,
    /// Server-side back-channel listener port (even; RTCP on +1).
    pub back_server_port: u16,

    // TCP interleaved per-track RTP channels.
    pub video_channel: u8,
    pub audio_channel: u8,
    pub back_channel: u8,

    /// Whether the back-channel track completed SETUP; inbound back-channel
    /// RTP on an un-SETUP channel is dropped.
    pub back_setup: bool,
    /// Number of tracks that completed SETUP on this connection.
    pub setup_count: u32,
}

impl ClientSession {
    pub fn new(peer: SocketAddr, camera_path: &str, resolution: Resolution) -> Self {
        Self {
            id: generate_session_id(),
            camera_path: camera_path.to_string(),
            resolution,
            peer,
            transport: None,
            video_port: 0,
            audio_port: 0,
            back_client_port: 0,
            back_server_port: 0,
            video_channel: 0,
            audio_channel: 2,
            back_channel: 4,
            back_setup: false,
            setup_count: 0,
        }
    }

    /// `Session` response header value, e.g. `00CAFE00DEADBEEF;timeout=60`.
    pub fn session_header(&self) -> String {
        format!("{};timeout={}", self.id, SESSION_TIMEOUT_SECS)
    }
}

/// 16 hex chars from 8 random bytes.
pub fn generate_session_id() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 51234)
    }

    #[test]
    fn session_id_is_16_hex_chars() {
        let id = generate_session_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_session_id());
    }

    #[test]
    fn new_session_defaults() {
        let session = ClientSession::new(peer(), "/Front", Resolution::Hd);
        assert!(session.transport.is_none());
        assert_eq!(session.setup_count, 0);
        assert_eq!(session.video_channel, 0);
        assert_eq!(session.audio_channel, 2);
        assert_eq!(session.back_channel, 4);
        assert!(!session.back_setup);
    }

    #[test]
    fn session_header_carries_timeout() {
        let session = ClientSession::new(peer(), "/Front", Resolution::Hd);
        assert_eq!(
            session.session_header(),
            format!("{};timeout=60", session.id)
        );
    }
}
