//! Transport header negotiation (RFC 2326 §12.39).
//!
//! Two transports are accepted:
//!
//! - `RTP/AVP;unicast;client_port=X-Y` — UDP, the client declares its
//!   receive ports.
//! - `RTP/AVP/TCP;interleaved=X-Y` — interleaved on the RTSP connection;
//!   when the client omits channels they default per track
//!   (video 0/1, audio 2/3, backchannel 4/5).
//!
//! Anything else is rejected with 461 Unsupported Transport.

use crate::error::{EngineError, ParseErrorKind, Result};

/// Which track a SETUP request addresses, from its control path suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    Video,
    Audio,
    Backchannel,
}

impl Track {
    /// Resolve a SETUP URI's control suffix. `None` for URIs without a
    /// known track suffix.
    pub fn from_path(uri: &str) -> Option<Self> {
        if uri.ends_with("/backchannel") {
            Some(Self::Backchannel)
        } else if uri.ends_with("/video") {
            Some(Self::Video)
        } else if uri.ends_with("/audio") {
            Some(Self::Audio)
        } else {
            None
        }
    }

    /// Default interleaved (RTP, RTCP) channel pair for this track.
    pub fn default_channels(self) -> (u8, u8) {
        match self {
            Self::Video => (0, 1),
            Self::Audio => (2, 3),
            Self::Backchannel => (4, 5),
        }
    }
}

/// Negotiated transport parameters for one track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSpec {
    Udp { rtp_port: u16, rtcp_port: u16 },
    Tcp { rtp_channel: u8, rtcp_channel: u8 },
}

impl TransportSpec {
    /// Format the Transport response header. For a UDP back-channel the
    /// server's listener pair is echoed via `server_port`.
    pub fn response_value(&self, server_port: Option<u16>) -> String {
        match self {
            Self::Tcp {
                rtp_channel,
                rtcp_channel,
            } => format!("RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel}"),
            Self::Udp { rtp_port, rtcp_port } => match server_port {
                Some(server_rtp) => format!(
                    "RTP/AVP;unicast;client_port={rtp_port}-{rtcp_port};server_port={}-{}",
                    server_rtp,
                    server_rtp + 1
                ),
                None => format!("RTP/AVP;unicast;client_port={rtp_port}-{rtcp_port}"),
            },
        }
    }
}

/// Parse a client Transport header for the given track.
///
/// Returns [`EngineError::UnsupportedTransport`] when neither profile
/// matches (→ 461), [`EngineError::Parse`] when the UDP form lacks usable
/// client ports (→ 400).
pub fn parse_transport(header: &str, track: Track) -> Result<TransportSpec> {
    if header.contains("RTP/AVP/TCP") {
        let (rtp_channel, rtcp_channel) = match parameter(header, "interleaved=") {
            Some(spec) => {
                let mut parts = spec.split('-');
                let rtp: u8 = parts
                    .next()
                    .and_then(|p| p.trim().parse().ok())
                    .ok_or(EngineError::Parse {
                        kind: ParseErrorKind::InvalidHeader,
                    })?;
                let rtcp: u8 = parts
                    .next()
                    .and_then(|p| p.trim().parse().ok())
                    .unwrap_or_else(|| rtp.wrapping_add(1));
                (rtp, rtcp)
            }
            None => track.default_channels(),
        };
        return Ok(TransportSpec::Tcp {
            rtp_channel,
            rtcp_channel,
        });
    }

    if header.contains("RTP/AVP") {
        let ports = parameter(header, "client_port=").ok_or(EngineError::Parse {
            kind: ParseErrorKind::InvalidHeader,
        })?;
        let mut parts = ports.split('-');
        let rtp_port: u16 = parts
            .next()
            .and_then(|p| p.trim().parse().ok())
            .ok_or(EngineError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
        if rtp_port == 0 {
            return Err(EngineError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            });
        }
        let rtcp_port: u16 = parts
            .next()
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or_else(|| rtp_port.wrapping_add(1));
        return Ok(TransportSpec::Udp { rtp_port, rtcp_port });
    }

    Err(EngineError::UnsupportedTransport(header.to_string()))
}

/// Value of a `key=value` parameter among the header's `;`-separated parts.
fn parameter<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_with_client_ports() {
        let spec = parse_transport("RTP/AVP;unicast;client_port=50000-50001", Track::Video).unwrap();
        assert_eq!(
            spec,
            TransportSpec::Udp {
                rtp_port: 50000,
                rtcp_port: 50001
            }
        );
    }

    #[test]
    fn udp_single_port_infers_rtcp() {
        let spec = parse_transport("RTP/AVP;unicast;client_port=50000", Track::Audio).unwrap();
        assert_eq!(
            spec,
            TransportSpec::Udp {
                rtp_port: 50000,
                rtcp_port: 50001
            }
        );
    }

    #[test]
    fn udp_without_client_port_is_bad_request() {
        let err = parse_transport("RTP/AVP;unicast", Track::Video).unwrap_err();
        assert!(matches!(err, EngineError::Parse { .. }));
    }

    #[test]
    fn udp_zero_port_is_bad_request() {
        let err = parse_transport("RTP/AVP;unicast;client_port=0-1", Track::Video).unwrap_err();
        assert!(matches!(err, EngineError::Parse { .. }));
    }

    #[test]
    fn tcp_with_explicit_channels() {
        let spec = parse_transport("RTP/AVP/TCP;unicast;interleaved=2-3", Track::Video).unwrap();
        assert_eq!(
            spec,
            TransportSpec::Tcp {
                rtp_channel: 2,
                rtcp_channel: 3
            }
        );
    }

    #[test]
    fn tcp_default_channels_per_track() {
        assert_eq!(
            parse_transport("RTP/AVP/TCP;unicast", Track::Video).unwrap(),
            TransportSpec::Tcp {
                rtp_channel: 0,
                rtcp_channel: 1
            }
        );
        assert_eq!(
            parse_transport("RTP/AVP/TCP;unicast", Track::Audio).unwrap(),
            TransportSpec::Tcp {
                rtp_channel: 2,
                rtcp_channel: 3
            }
        );
        assert_eq!(
            parse_transport("RTP/AVP/TCP;unicast", Track::Backchannel).unwrap(),
            TransportSpec::Tcp {
                rtp_channel: 4,
                rtcp_channel: 5
            }
        );
    }

    #[test]
    fn tcp_single_channel_infers_rtcp() {
        let spec = parse_transport("RTP/AVP/TCP;interleaved=6", Track::Video).unwrap();
        assert_eq!(
            spec,
            TransportSpec::Tcp {
                rtp_channel: 6,
                rtcp_channel: 7
            }
        );
    }

    #[test]
    fn unknown_profile_is_unsupported() {
        let err = parse_transport("RAW/RAW/UDP;unicast", Track::Video).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedTransport(_)));
    }

    #[test]
    fn response_values() {
        let tcp = TransportSpec::Tcp {
            rtp_channel: 0,
            rtcp_channel: 1,
        };
        assert_eq!(tcp.response_value(None), "RTP/AVP/TCP;unicast;interleaved=0-1");

        let udp = TransportSpec::Udp {
            rtp_port: 60000,
            rtcp_port: 60001,
        };
        assert_eq!(
            udp.response_value(None),
            "RTP/AVP;unicast;client_port=60000-60001"
        );
        assert_eq!(
            udp.response_value(Some(50080)),
            "RTP/AVP;unicast;client_port=60000-60001;server_port=50080-50081"
        );
    }

    #[test]
    fn track_from_path() {
        assert_eq!(Track::from_path("rtsp://h/Front/video"), Some(Track::Video));
        assert_eq!(Track::from_path("rtsp://h/Front/audio"), Some(Track::Audio));
        assert_eq!(
            Track::from_path("rtsp://h/Front/backchannel"),
            Some(Track::Backchannel)
        );
        assert_eq!(Track::from_path("rtsp://h/Front"), None);
    }
}
