//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol — parsing
//! requests, building responses, negotiating transports, and generating
//! SDP from the camera's skill blob.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/Front RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! ## URL convention
//!
//! `rtsp://host:port/<camera-name>[/hd|/sd]` — the camera name resolves
//! through the inventory collaborator, the optional suffix selects the
//! stream resolution (default `hd`). Per-track control paths append
//! `/video`, `/audio`, or `/backchannel`.
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Negotiate transport (UDP ports or interleaved channels) |
//! | PLAY | §10.5 | Start media delivery |
//! | TEARDOWN | §10.7 | Destroy session |

pub mod request;
pub mod response;
pub mod sdp;
pub mod transport;

pub use request::RtspRequest;
pub use response::RtspResponse;

use crate::camera::Resolution;

/// Extract the camera path and requested resolution from an RTSP URI.
///
/// Track control suffixes are stripped first so SETUP URIs resolve to the
/// same camera as the base URI:
///
/// ```
/// use tuya_rtsp::camera::Resolution;
/// use tuya_rtsp::protocol::extract_camera_path;
///
/// let (path, res) = extract_camera_path("rtsp://host:8554/Front/sd").unwrap();
/// assert_eq!(path, "/Front");
/// assert_eq!(res, Resolution::Sd);
///
/// let (path, res) = extract_camera_path("rtsp://host:8554/Front/video").unwrap();
/// assert_eq!(path, "/Front");
/// assert_eq!(res, Resolution::Hd);
/// ```
pub fn extract_camera_path(uri: &str) -> Option<(String, Resolution)> {
    let after_scheme = uri.strip_prefix("rtsp://")?;
    let slash = after_scheme.find('/')?;
    let mut path = &after_scheme[slash..];

    if path.is_empty() || path == "/" {
        return None;
    }

    for suffix in ["/video", "/audio", "/backchannel"] {
        if let Some(stripped) = path.strip_suffix(suffix) {
            path = stripped;
            break;
        }
    }

    let mut resolution = Resolution::Hd;
    if let Some(stripped) = path.strip_suffix("/hd") {
        path = stripped;
    } else if let Some(stripped) = path.strip_suffix("/sd") {
        path = stripped;
        resolution = Resolution::Sd;
    }

    if path.is_empty() || path == "/" {
        return None;
    }

    Some((path.to_string(), resolution))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_path_defaults_to_hd() {
        assert_eq!(
            extract_camera_path("rtsp://localhost:8554/Front"),
            Some(("/Front".to_string(), Resolution::Hd))
        );
    }

    #[test]
    fn resolution_suffixes() {
        assert_eq!(
            extract_camera_path("rtsp://localhost:8554/Front/hd"),
            Some(("/Front".to_string(), Resolution::Hd))
        );
        assert_eq!(
            extract_camera_path("rtsp://localhost:8554/Front/sd"),
            Some(("/Front".to_string(), Resolution::Sd))
        );
    }

    #[test]
    fn track_suffix_is_stripped_before_resolution() {
        assert_eq!(
            extract_camera_path("rtsp://localhost:8554/Front/sd/backchannel"),
            Some(("/Front".to_string(), Resolution::Sd))
        );
        assert_eq!(
            extract_camera_path("rtsp://localhost:8554/Front/audio"),
            Some(("/Front".to_string(), Resolution::Hd))
        );
    }

    #[test]
    fn empty_and_root_paths_rejected() {
        assert_eq!(extract_camera_path("rtsp://localhost:8554"), None);
        assert_eq!(extract_camera_path("rtsp://localhost:8554/"), None);
        assert_eq!(extract_camera_path("*"), None);
    }

    #[test]
    fn nested_camera_path_survives() {
        assert_eq!(
            extract_camera_path("rtsp://h/garden/Back/sd"),
            Some(("/garden/Back".to_string(), Resolution::Sd))
        );
    }
}
