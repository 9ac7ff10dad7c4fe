//! # tuya_rtsp — RTSP server for cloud-signaled Tuya WebRTC cameras
//!
//! Bridges proprietary cloud-signaled WebRTC camera streams to a
//! standards-compliant RTSP server, so any RTSP client (media player, NVR,
//! home-automation hub) can consume cameras otherwise reachable only
//! through the vendor mobile app.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Request/response parsing, session lifecycle, transport negotiation, interleaved framing |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP | Packet forwarding, even/odd port pair convention |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | Session description generation for DESCRIBE responses |
//! | [RFC 8829](https://tools.ietf.org/html/rfc8829) | JSEP | Offer/answer negotiation with the device over MQTT signaling |
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  Server      — accept loop, registries,   │
//! │                idle reaper                │
//! ├───────────────────────────────────────────┤
//! │  Conn        — per-connection RTSP loop,  │
//! │                interleaved demux          │
//! │  Protocol    — parsing, SDP, transports   │
//! ├───────────────────────────────────────────┤
//! │  Stream      — lazy start, refcounted     │
//! │                shutdown with grace delay  │
//! ├───────────────────────────────────────────┤
//! │  Bridge      — peer connection, SDP munge,│
//! │                HEVC data channel, talkback│
//! │  Signaling   — MQTT offer/answer/ICE      │
//! │  Forward     — RTP fan-out to clients     │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tuya_rtsp::{Server, ServerConfig};
//! # use tuya_rtsp::cloud::{CameraInventory, CloudApi};
//! # async fn run(inventory: Arc<dyn CameraInventory>, cloud: Arc<dyn CloudApi>) {
//! let server = Server::new(ServerConfig::default(), inventory, cloud);
//! server.start().await.unwrap();
//! // … run until shutdown …
//! server.stop().await;
//! # }
//! ```
//!
//! Authentication, camera discovery, and persistent storage live outside
//! this crate; the engine consumes them through the [`cloud`] collaborator
//! traits.
//!
//! ## Crate layout
//!
//! - [`server`] — [`Server`] orchestrator, registries, idle reaper.
//! - [`stream`] — per-(camera, resolution) lifecycle and grace timer.
//! - [`bridge`] — WebRTC peer connection and negotiation over signaling.
//! - [`signaling`] — MQTT session multiplexing and wire frames.
//! - [`forward`] — RTP fan-out to UDP and TCP-interleaved sinks.
//! - [`protocol`] — RTSP parsing, responses, transports, SDP.
//! - [`session`] — RTSP client session state.
//! - [`camera`] — camera descriptors and the device skill blob.
//! - [`cloud`] — collaborator interfaces (inventory, cloud API).
//! - [`ports`] — even/odd UDP port pair allocation.
//! - [`error`] — [`EngineError`] and [`Result`] alias.

pub mod bridge;
pub mod camera;
pub mod cloud;
mod conn;
pub mod error;
pub mod forward;
pub mod ports;
pub mod protocol;
pub mod server;
pub mod session;
pub mod signaling;
pub mod stream;
pub mod sync;

pub use camera::{CameraInfo, Resolution, Skill, StreamKey};
pub use cloud::{CameraBinding, CameraInventory, CloudApi, UserSession};
pub use error::{EngineError, Result};
pub use server::{Server, ServerConfig, ServerStats};
pub use stream::{CameraStream, StreamState};
