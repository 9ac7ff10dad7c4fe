/// An RTSP response (RFC 2326 §7).
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// Server: TuyaIPCTerminal/1.0\r\n
/// Date: Mon, 02 Jan 2006 15:04:05 GMT\r\n
/// CSeq: 1\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Uses a builder pattern — chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present, and
/// a body defaults to `Content-Type: application/sdp` unless one was set.
#[must_use]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Server identification string included in every RTSP response
/// per RFC 2326 §12.36.
pub const SERVER_AGENT: &str = "TuyaIPCTerminal/1.0";

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![
                ("Server".to_string(), SERVER_AGENT.to_string()),
                ("Date".to_string(), http_date()),
            ],
            body: None,
        }
    }

    /// 200 OK — success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 400 Bad Request — malformed or missing required header.
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 404 Not Found — no camera at the requested path.
    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    /// 454 Session Not Found — missing or mismatched Session header.
    pub fn session_not_found() -> Self {
        Self::new(454, "Session Not Found")
    }

    /// 461 Unsupported Transport.
    pub fn unsupported_transport() -> Self {
        Self::new(461, "Unsupported Transport")
    }

    /// 500 Internal Server Error — the upstream could not be started.
    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    /// 501 Not Implemented — method outside the supported set.
    pub fn not_implemented() -> Self {
        Self::new(501, "Not Implemented")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14), plus `Content-Type: application/sdp` when no
    /// content type was set.
    pub fn serialize(&self) -> String {
        let mut response = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);

        for (name, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            response.push_str(&format!("Content-Length: {}\r\n", body.len()));
            if !self
                .headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("Content-Type"))
            {
                response.push_str("Content-Type: application/sdp\r\n");
            }
            response.push_str("\r\n");
            response.push_str(body);
        } else {
            response.push_str("\r\n");
        }
        response
    }
}

/// RFC 1123 date in GMT, e.g. `Mon, 02 Jan 2006 15:04:05 GMT`.
fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_no_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "1")
            .add_header("Public", "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN");
        let s = resp.serialize();
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains("Server: TuyaIPCTerminal/1.0\r\n"));
        assert!(s.contains("Date: "));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.contains("Public: OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN\r\n"));
        assert!(s.ends_with("\r\n"));
    }

    #[test]
    fn serialize_with_body_defaults_content_type() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "2")
            .with_body("v=0\r\n".to_string());
        let s = resp.serialize();
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.contains("Content-Type: application/sdp\r\n"));
        assert!(s.ends_with("v=0\r\n"));
    }

    #[test]
    fn explicit_content_type_is_not_duplicated() {
        let resp = RtspResponse::ok()
            .add_header("Content-Type", "text/parameters")
            .with_body("x: 1\r\n".to_string());
        let s = resp.serialize();
        assert_eq!(s.matches("Content-Type").count(), 1);
        assert!(s.contains("Content-Type: text/parameters\r\n"));
    }

    #[test]
    fn status_constructors() {
        assert_eq!(RtspResponse::bad_request().status_code, 400);
        assert_eq!(RtspResponse::not_found().status_code, 404);
        assert_eq!(RtspResponse::session_not_found().status_code, 454);
        assert_eq!(RtspResponse::unsupported_transport().status_code, 461);
        assert_eq!(RtspResponse::internal_error().status_code, 500);
        assert_eq!(RtspResponse::not_implemented().status_code, 501);
    }

    #[test]
    fn date_header_is_rfc1123_gmt() {
        let date = http_date();
        assert!(date.ends_with(" GMT"));
        // "Mon, 02 Jan 2006 15:04:05 GMT" is 29 chars.
        assert_eq!(date.len(), 29);
    }
}
