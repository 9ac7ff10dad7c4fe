//! SDP generation for DESCRIBE responses (RFC 4566 / RFC 8866).
//!
//! The session description is derived from the camera's skill blob:
//!
//! ```text
//! v=0
//! o=- <unix> <unix> IN IP4 0.0.0.0
//! s=Tuya Camera Stream
//! c=IN IP4 0.0.0.0
//! t=0 0
//! a=control:*
//! a=range:npt=0-
//! m=video 0 RTP/AVP 96            ← codec from the selected stream type
//! a=rtpmap:96 H264/90000
//! a=fmtp:96 packetization-mode=1;profile-level-id=42001e
//! a=control:<base>/video
//! a=recvonly
//! m=audio 0 RTP/AVP 0             ← from the first skill audio entry
//! a=rtpmap:0 PCMU/8000
//! a=control:<base>/audio
//! a=recvonly
//! m=audio 0 RTP/AVP 0             ← talk-back mirror of the audio line
//! a=rtpmap:0 PCMU/8000
//! a=control:<base>/backchannel
//! a=sendonly
//! ```
//!
//! Cameras whose skill omits a video or audio entry fall back to H.264 and
//! PCMU defaults so clients always see three m-sections.

use crate::camera::{Resolution, Skill, CODEC_TYPE_HEVC};

const SESSION_NAME: &str = "Tuya Camera Stream";

/// Generate the DESCRIBE SDP for a camera at the requested resolution.
///
/// `base_url` is the request URL; track control paths are derived from it.
pub fn generate(skill: &Skill, resolution: Resolution, base_url: &str) -> String {
    let now = chrono::Utc::now().timestamp();

    let mut sdp: Vec<String> = Vec::new();
    sdp.push("v=0".to_string());
    sdp.push(format!("o=- {now} {now} IN IP4 0.0.0.0"));
    sdp.push(format!("s={SESSION_NAME}"));
    sdp.push("c=IN IP4 0.0.0.0".to_string());
    sdp.push("t=0 0".to_string());
    sdp.push("a=control:*".to_string());
    sdp.push("a=range:npt=0-".to_string());

    push_video_section(&mut sdp, skill, resolution, base_url);

    let (audio_mline, audio_rtpmap) = audio_lines(skill);
    sdp.push(audio_mline.clone());
    sdp.push(audio_rtpmap.clone());
    sdp.push(format!("a=control:{base_url}/audio"));
    sdp.push("a=recvonly".to_string());

    // Talk-back repeats the audio format with the opposite direction.
    sdp.push(audio_mline);
    sdp.push(audio_rtpmap);
    sdp.push(format!("a=control:{base_url}/backchannel"));
    sdp.push("a=sendonly".to_string());

    format!("{}\r\n", sdp.join("\r\n"))
}

fn push_video_section(sdp: &mut Vec<String>, skill: &Skill, resolution: Resolution, base_url: &str) {
    let stream_type = skill.stream_type_for(resolution);

    sdp.push("m=video 0 RTP/AVP 96".to_string());
    match skill.video_for(stream_type) {
        Some(video) if video.codec_type == CODEC_TYPE_HEVC => {
            sdp.push("a=rtpmap:96 H265/90000".to_string());
            sdp.push("a=fmtp:96 profile-id=1".to_string());
        }
        _ => {
            // H.264, also the fallback when the skill lists no video.
            sdp.push("a=rtpmap:96 H264/90000".to_string());
            sdp.push("a=fmtp:96 packetization-mode=1;profile-level-id=42001e".to_string());
        }
    }
    sdp.push(format!("a=control:{base_url}/video"));
    sdp.push("a=recvonly".to_string());
}

/// Audio m-line and rtpmap from the first skill audio entry.
///
/// Codec map: 101/105 → PCMU (payload 0), 106 → PCMA (payload 8),
/// anything else → PCMU.
fn audio_lines(skill: &Skill) -> (String, String) {
    match skill.first_audio().map(|a| a.codec_type) {
        Some(106) => (
            "m=audio 0 RTP/AVP 8".to_string(),
            "a=rtpmap:8 PCMA/8000".to_string(),
        ),
        _ => (
            "m=audio 0 RTP/AVP 0".to_string(),
            "a=rtpmap:0 PCMU/8000".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "rtsp://localhost:8554/Front";

    fn h264_skill() -> Skill {
        Skill::parse(
            r#"{"videos":[{"streamType":2,"codecType":2,"width":1920,"height":1080}],
                "audios":[{"codecType":105}]}"#,
        )
        .unwrap()
    }

    #[test]
    fn h264_sdp_has_three_sections() {
        let sdp = generate(&h264_skill(), Resolution::Hd, BASE);
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("s=Tuya Camera Stream\r\n"));
        assert!(sdp.contains("a=control:*\r\n"));
        assert!(sdp.contains("a=range:npt=0-\r\n"));
        assert_eq!(sdp.matches("m=").count(), 3, "video + audio + backchannel");
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("a=fmtp:96 packetization-mode=1;profile-level-id=42001e\r\n"));
        assert!(sdp.contains("m=audio 0 RTP/AVP 0\r\n"));
        assert!(sdp.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(sdp.ends_with("\r\n"));
    }

    #[test]
    fn track_controls_and_directions() {
        let sdp = generate(&h264_skill(), Resolution::Hd, BASE);
        assert!(sdp.contains(&format!("a=control:{BASE}/video\r\na=recvonly\r\n")));
        assert!(sdp.contains(&format!("a=control:{BASE}/audio\r\na=recvonly\r\n")));
        assert!(sdp.contains(&format!("a=control:{BASE}/backchannel\r\na=sendonly\r\n")));
    }

    #[test]
    fn hevc_video_line() {
        let skill = Skill::parse(
            r#"{"videos":[{"streamType":2,"codecType":4,"width":2560,"height":1440}],
                "audios":[{"codecType":105}]}"#,
        )
        .unwrap();
        let sdp = generate(&skill, Resolution::Hd, BASE);
        assert!(sdp.contains("a=rtpmap:96 H265/90000\r\n"));
        assert!(sdp.contains("a=fmtp:96 profile-id=1\r\n"));
        assert!(!sdp.contains("H264"));
    }

    #[test]
    fn sd_resolution_reflects_substream_codec() {
        // Main stream HEVC, sub stream H.264: /sd must describe H.264.
        let skill = Skill::parse(
            r#"{"videos":[
                {"streamType":2,"codecType":4,"width":2560,"height":1440},
                {"streamType":4,"codecType":2,"width":640,"height":360}],
                "audios":[{"codecType":105}]}"#,
        )
        .unwrap();
        let sd = generate(&skill, Resolution::Sd, BASE);
        assert!(sd.contains("H264"));
        let hd = generate(&skill, Resolution::Hd, BASE);
        assert!(hd.contains("H265"));
    }

    #[test]
    fn pcma_audio_codec() {
        let skill = Skill::parse(
            r#"{"videos":[{"streamType":2,"codecType":2,"width":1920,"height":1080}],
                "audios":[{"codecType":106}]}"#,
        )
        .unwrap();
        let sdp = generate(&skill, Resolution::Hd, BASE);
        assert!(sdp.contains("m=audio 0 RTP/AVP 8\r\n"));
        assert!(sdp.contains("a=rtpmap:8 PCMA/8000\r\n"));
    }

    #[test]
    fn empty_skill_falls_back_to_h264_and_pcmu() {
        let sdp = generate(&Skill::default(), Resolution::Hd, BASE);
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert_eq!(sdp.matches("m=").count(), 3);
    }
}
