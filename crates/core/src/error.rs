//! Error types for the streaming engine.

use std::fmt;

/// Errors that can occur in the streaming engine.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) — malformed RTSP messages;
///   [`UnsupportedTransport`](Self::UnsupportedTransport) — Transport header
///   outside `RTP/AVP` / `RTP/AVP/TCP`.
/// - **Transport**: [`Io`](Self::Io) — socket/network failures;
///   [`NoPortAvailable`](Self::NoPortAvailable) — UDP pair allocation
///   exhausted its attempt budget.
/// - **Signaling**: [`SignalingClosed`](Self::SignalingClosed),
///   [`Signaling`](Self::Signaling) — MQTT session failures.
/// - **Upstream**: [`Upstream`](Self::Upstream) — WebRTC negotiation or a
///   live bridge failed; [`WebRtc`](Self::WebRtc) — peer-connection API
///   errors; [`Cloud`](Self::Cloud) — the cloud API collaborator failed.
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning),
///   [`NotFound`](Self::NotFound), [`SessionNotFound`](Self::SessionNotFound).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The Transport header requested something other than RTP/AVP over
    /// UDP or TCP-interleaved.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// No RTSP path resolved to a camera.
    #[error("no camera at path: {0}")]
    NotFound(String),

    /// The RTSP Session header is missing or does not match.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Consecutive UDP port pair allocation failed after the attempt budget.
    #[error("no UDP port pair available after {attempts} attempts")]
    NoPortAvailable { attempts: u32 },

    /// Publish attempted on a signaling client that has shut down.
    #[error("signaling client is closed")]
    SignalingClosed,

    /// MQTT-level signaling failure (connect, subscribe, publish).
    #[error("signaling error: {0}")]
    Signaling(String),

    /// A cloud API collaborator call failed.
    #[error("cloud API error: {0}")]
    Cloud(String),

    /// The upstream WebRTC session failed to start or was lost.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Peer-connection API error.
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Invariant violation; aborts the affected stream only.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// An interleaved frame did not start with the `$` magic byte.
    InvalidInterleavedFrame,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidInterleavedFrame => write!(f, "invalid interleaved frame"),
        }
    }
}

/// Convenience alias for `Result<T, EngineError>`.
pub type Result<T> = std::result::Result<T, EngineError>;
