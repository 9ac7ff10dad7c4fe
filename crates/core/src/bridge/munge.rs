//! Localized SDP text transforms for device interop.
//!
//! Two quirks need patching around:
//!
//! - Devices reject offers with RTP header-extension maps; every
//!   `a=extmap:` line is stripped before the offer is published.
//! - Some devices answer with a single audio payload format even when the
//!   offer listed several; the answer's first audio m-line is rebuilt from
//!   the offer's formats so the peer connection accepts all of them.

const AUDIO_ATTR_KEYS: [&str; 4] = ["a=rtpmap:", "a=fmtp:", "a=rtcp-fb:", "a=extmap:"];

/// Remove all `a=extmap:` lines from an SDP blob.
pub fn strip_extmap(sdp: &str) -> String {
    let mut out = String::with_capacity(sdp.len());
    for line in sdp.split_inclusive("\r\n") {
        if !line.starts_with("a=extmap:") {
            out.push_str(line);
        }
    }
    out
}

/// Rebuild the answer's first audio m-line from the offer.
///
/// Applies only when the answer's first audio section carries
/// `a=recvonly` (the single-format device answer); otherwise the answer is
/// returned unchanged. The m-line format list is replaced with the offer's,
/// the offer's `rtpmap`/`fmtp`/`rtcp-fb`/`extmap` attributes are carried
/// over, and the answer's remaining attributes are kept after them.
pub fn fix_answer_audio(offer: &str, answer: &str) -> String {
    let answer_lines: Vec<&str> = answer.lines().collect();

    let (audio_start, audio_end) = match media_section(&answer_lines, "m=audio") {
        Some(span) => span,
        None => return answer.to_string(),
    };

    let answer_section = &answer_lines[audio_start..audio_end];
    if !answer_section.iter().any(|l| *l == "a=recvonly") {
        return answer.to_string();
    }

    let offer_lines: Vec<&str> = offer.lines().collect();
    let (offer_start, offer_end) = match media_section(&offer_lines, "m=audio") {
        Some(span) => span,
        None => return answer.to_string(),
    };
    let offer_section = &offer_lines[offer_start..offer_end];

    let offer_formats = match formats_of(offer_section[0]) {
        Some(f) => f,
        None => return answer.to_string(),
    };
    let offer_attrs: Vec<&str> = offer_section
        .iter()
        .copied()
        .filter(|l| AUDIO_ATTR_KEYS.iter().any(|k| l.starts_with(k)))
        .collect();

    // New m-line: answer's media/port/proto with the offer's format list.
    let proto_prefix = answer_section[0]
        .splitn(4, ' ')
        .take(3)
        .collect::<Vec<_>>()
        .join(" ");
    let new_mline = format!("{proto_prefix} {offer_formats}");

    let mut rebuilt: Vec<String> = Vec::with_capacity(answer.len() / 16);
    for line in &answer_lines[..audio_start] {
        rebuilt.push((*line).to_string());
    }
    rebuilt.push(new_mline);
    // Non-attribute section lines (c=, b=, …) keep their place; attributes
    // come last: the offer's codec attributes, then the answer's rest.
    for line in &answer_section[1..] {
        if !line.starts_with("a=") {
            rebuilt.push((*line).to_string());
        }
    }
    for line in &offer_attrs {
        rebuilt.push((*line).to_string());
    }
    for line in &answer_section[1..] {
        if line.starts_with("a=") && !AUDIO_ATTR_KEYS.iter().any(|k| line.starts_with(k)) {
            rebuilt.push((*line).to_string());
        }
    }
    for line in &answer_lines[audio_end..] {
        rebuilt.push((*line).to_string());
    }

    let mut out = rebuilt.join("\r\n");
    out.push_str("\r\n");
    out
}

/// `[start, end)` line span of the first media section matching `kind`,
/// running to the next `m=` line or end of input.
fn media_section(lines: &[&str], kind: &str) -> Option<(usize, usize)> {
    let start = lines.iter().position(|l| l.starts_with(kind))?;
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map(|offset| start + 1 + offset)
        .unwrap_or(lines.len());
    Some((start, end))
}

/// The format list of an m-line: everything after `m=<media> <port> <proto>`.
fn formats_of(mline: &str) -> Option<&str> {
    let mut parts = mline.splitn(4, ' ');
    parts.next()?;
    parts.next()?;
    parts.next()?;
    parts.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 1 1 IN IP4 0.0.0.0\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111 0 8\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:8 PCMA/8000\r\n\
        a=fmtp:111 minptime=10\r\n\
        a=rtcp-fb:111 transport-cc\r\n\
        a=sendrecv\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=recvonly\r\n";

    const ANSWER: &str = "v=0\r\n\
        o=- 2 2 IN IP4 0.0.0.0\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 0\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=mid:0\r\n\
        a=recvonly\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=sendonly\r\n";

    #[test]
    fn strip_extmap_removes_only_extmap_lines() {
        let sdp = "v=0\r\na=extmap:1 urn:ietf:params:rtp-hdrext:sdes:mid\r\n\
                   a=rtpmap:96 H264/90000\r\na=extmap:3 something\r\na=recvonly\r\n";
        let out = strip_extmap(sdp);
        assert!(!out.contains("a=extmap"));
        assert!(out.contains("v=0\r\n"));
        assert!(out.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(out.contains("a=recvonly\r\n"));
    }

    #[test]
    fn strip_extmap_noop_without_extmap() {
        let sdp = "v=0\r\nm=video 0 RTP/AVP 96\r\n";
        assert_eq!(strip_extmap(sdp), sdp);
    }

    #[test]
    fn answer_fix_copies_offer_formats() {
        let fixed = fix_answer_audio(OFFER, ANSWER);
        assert!(
            fixed.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 0 8\r\n"),
            "answer m-line must carry the offer's format list: {fixed}"
        );
        assert!(fixed.contains("a=rtpmap:111 opus/48000/2\r\n"));
        assert!(fixed.contains("a=fmtp:111 minptime=10\r\n"));
        assert!(fixed.contains("a=rtcp-fb:111 transport-cc\r\n"));
        // Answer's non-codec attributes survive.
        assert!(fixed.contains("a=mid:0\r\n"));
        assert!(fixed.contains("a=recvonly\r\n"));
        // Video section untouched.
        assert!(fixed.contains("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n"));
        assert!(fixed.contains("a=sendonly\r\n"));
    }

    #[test]
    fn answer_fix_keeps_connection_line_in_place() {
        let fixed = fix_answer_audio(OFFER, ANSWER);
        let mline = fixed.find("m=audio").unwrap();
        let cline = fixed[mline..].find("c=IN IP4 0.0.0.0").unwrap();
        let first_attr = fixed[mline..].find("a=").unwrap();
        assert!(cline < first_attr, "c= must precede attributes");
    }

    #[test]
    fn answer_without_recvonly_audio_is_unchanged() {
        let answer = ANSWER.replace("a=recvonly", "a=sendrecv");
        assert_eq!(fix_answer_audio(OFFER, &answer), answer);
    }

    #[test]
    fn answer_without_audio_is_unchanged() {
        let answer = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=recvonly\r\n";
        assert_eq!(fix_answer_audio(OFFER, answer), answer);
    }
}
