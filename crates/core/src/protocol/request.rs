use crate::error::{EngineError, ParseErrorKind, Result};

/// A parsed RTSP request (RFC 2326 §6).
///
/// The wire format follows HTTP/1.1 syntax: a start line
/// (`Method SP Request-URI SP RTSP-Version`), any number of
/// `Name: Value` header lines, and a blank line. Header lookup is
/// case-insensitive per RFC 2326 §4.2.
#[derive(Debug)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, …).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:8554/Front/video`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers in arrival order, names as received.
    pub headers: Vec<(String, String)>,
}

impl RtspRequest {
    /// Parse one complete request (start line through the blank line).
    ///
    /// Anything malformed — no start line, a start line with the wrong
    /// word count, a header without a colon — is an
    /// [`EngineError::Parse`], which the connection layer answers with
    /// 400.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();

        let start_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or(EngineError::Parse {
                kind: ParseErrorKind::EmptyRequest,
            })?;
        let (method, uri, version) = split_start_line(start_line)?;

        if version != "RTSP/1.0" {
            tracing::warn!(version, "request uses an unexpected RTSP version");
        }

        let headers = lines
            .take_while(|line| !line.is_empty())
            .map(split_header)
            .collect::<Result<Vec<_>>>()?;

        Ok(RtspRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, wanted: &str) -> Option<&str> {
        self.headers
            .iter()
            .find_map(|(name, value)| name.eq_ignore_ascii_case(wanted).then_some(value.as_str()))
    }

    /// The CSeq header, which numbers request/response pairs
    /// (RFC 2326 §12.17); every response echoes it.
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// The session id from the `Session` header, with any `;timeout=`
    /// suffix stripped.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
    }
}

/// Split `Method SP Request-URI SP RTSP-Version` — exactly three words.
fn split_start_line(line: &str) -> Result<(&str, &str, &str)> {
    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next(), words.next()) {
        (Some(method), Some(uri), Some(version), None) => Ok((method, uri, version)),
        _ => Err(EngineError::Parse {
            kind: ParseErrorKind::InvalidRequestLine,
        }),
    }
}

fn split_header(line: &str) -> Result<(String, String)> {
    let (name, value) = line.split_once(':').ok_or(EngineError::Parse {
        kind: ParseErrorKind::InvalidHeader,
    })?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_request() {
        let raw = "OPTIONS rtsp://localhost:8554/Front RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "OPTIONS");
        assert_eq!(req.uri, "rtsp://localhost:8554/Front");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), Some("1"));
    }

    #[test]
    fn parse_setup_with_transport() {
        let raw = "SETUP rtsp://localhost:8554/Front/video RTSP/1.0\r\n\
                   CSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=50000-50001\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "SETUP");
        assert_eq!(req.cseq(), Some("3"));
        assert_eq!(
            req.get_header("Transport"),
            Some("RTP/AVP;unicast;client_port=50000-50001")
        );
    }

    #[test]
    fn parse_empty_request() {
        assert!(RtspRequest::parse("").is_err());
        assert!(RtspRequest::parse("\r\n\r\n").is_err());
    }

    #[test]
    fn parse_invalid_start_line() {
        assert!(RtspRequest::parse("JUST_A_METHOD\r\n\r\n").is_err());
        assert!(RtspRequest::parse("ONE TWO THREE FOUR\r\n\r\n").is_err());
    }

    #[test]
    fn parse_header_without_colon() {
        let raw = "OPTIONS rtsp://h RTSP/1.0\r\nbroken header line\r\n\r\n";
        assert!(RtspRequest::parse(raw).is_err());
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let raw = "OPTIONS rtsp://localhost RTSP/1.0\r\ncseq: 42\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.get_header("CSeq"), Some("42"));
        assert_eq!(req.get_header("cseq"), Some("42"));
        assert_eq!(req.get_header("CSEQ"), Some("42"));
    }

    #[test]
    fn header_values_are_trimmed() {
        let raw = "OPTIONS rtsp://h RTSP/1.0\r\nCSeq:   7  \r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.cseq(), Some("7"));
    }

    #[test]
    fn session_id_strips_timeout_suffix() {
        let raw = "PLAY rtsp://h/Front RTSP/1.0\r\nCSeq: 5\r\nSession: 00CAFE00DEADBEEF;timeout=60\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.session_id(), Some("00CAFE00DEADBEEF"));
    }

    #[test]
    fn reparse_is_equivalent_modulo_header_order() {
        let raw = "SETUP rtsp://h/Front/audio RTSP/1.0\r\n\
                   CSeq: 4\r\n\
                   Transport: RTP/AVP;unicast;client_port=50002-50003\r\n\
                   Session: AABB\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();

        let mut emitted = format!("{} {} {}\r\n", req.method, req.uri, req.version);
        for (name, value) in &req.headers {
            emitted.push_str(&format!("{name}: {value}\r\n"));
        }
        emitted.push_str("\r\n");

        assert_eq!(emitted, raw);
    }
}
