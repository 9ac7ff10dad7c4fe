//! Camera descriptors and the device skill blob.
//!
//! A camera is described by an externally supplied [`CameraInfo`] whose
//! `skill` field carries the device-reported JSON capability blob. The blob
//! enumerates the available video streams (stream type, codec, resolution)
//! and audio formats, plus a capability bitmask. Everything the engine
//! knows about a device's media formats comes from here:
//!
//! - which upstream "stream type" integer to request for `hd` vs `sd`,
//! - whether the selected stream is HEVC (delivered over a data channel),
//! - which codecs to advertise in the DESCRIBE SDP.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Video codec type 4 in the skill blob means H.265/HEVC; 2 means H.264.
pub const CODEC_TYPE_HEVC: i32 = 4;

/// Externally supplied camera descriptor. Immutable within a stream session.
///
/// Identity is `device_id`. The `rtsp_path` is the human path clients use
/// (e.g. `/Front`); `skill` is the raw JSON capability blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraInfo {
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub uuid: String,
    pub rtsp_path: String,
    #[serde(default)]
    pub user_key: String,
    /// Raw skill blob JSON as reported by the cloud.
    pub skill: String,
}

impl CameraInfo {
    /// Parse the skill blob. A malformed or empty blob yields the default
    /// (no streams), which downstream consumers treat via codec fallbacks.
    pub fn parsed_skill(&self) -> Skill {
        Skill::parse(&self.skill).unwrap_or_default()
    }
}

/// Requested stream resolution, from the URL path suffix (`/hd`, `/sd`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Resolution {
    #[default]
    Hd,
    Sd,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hd => "hd",
            Self::Sd => "sd",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hd" => Ok(Self::Hd),
            "sd" => Ok(Self::Sd),
            other => Err(EngineError::Internal(format!(
                "unknown resolution tag: {other}"
            ))),
        }
    }
}

/// Stream registry key: one upstream session per (device, resolution).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub device_id: String,
    pub resolution: Resolution,
}

impl StreamKey {
    pub fn new(device_id: &str, resolution: Resolution) -> Self {
        Self {
            device_id: device_id.to_string(),
            resolution,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.device_id, self.resolution)
    }
}

/// Device capability blob (`skill` JSON).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Skill {
    /// Capability bitmask; bit 5 indicates hd/sd clarity support.
    #[serde(default)]
    pub webrtc: i64,
    #[serde(default)]
    pub audios: Vec<AudioSkill>,
    #[serde(default)]
    pub videos: Vec<VideoSkill>,
}

/// One video stream entry in the skill blob.
#[derive(Debug, Clone, Deserialize)]
pub struct VideoSkill {
    /// Which of the camera's streams this is (e.g. 2 = main, 4 = sub).
    #[serde(rename = "streamType")]
    pub stream_type: i32,
    /// 2 = H.264, 4 = H.265.
    #[serde(rename = "codecType")]
    pub codec_type: i32,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
    #[serde(rename = "sampleRate", default)]
    pub sample_rate: i32,
    #[serde(rename = "profileId", default)]
    pub profile_id: Option<String>,
}

/// One audio format entry in the skill blob.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioSkill {
    #[serde(rename = "codecType")]
    pub codec_type: i32,
    #[serde(default)]
    pub channels: i32,
    #[serde(rename = "dataBit", default)]
    pub data_bit: i32,
    #[serde(rename = "sampleRate", default)]
    pub sample_rate: i32,
}

impl Skill {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| EngineError::Internal(format!("malformed skill blob: {e}")))
    }

    /// Resolve the upstream stream type for a resolution tag.
    ///
    /// `hd` selects the stream with the highest pixel area, `sd` the lowest.
    /// Falls back to stream type 1 when the blob lists no videos.
    pub fn stream_type_for(&self, resolution: Resolution) -> i32 {
        const DEFAULT_STREAM_TYPE: i32 = 1;

        if self.videos.is_empty() {
            return DEFAULT_STREAM_TYPE;
        }

        let mut highest = (0i64, DEFAULT_STREAM_TYPE);
        let mut lowest = (0i64, DEFAULT_STREAM_TYPE);

        for video in &self.videos {
            let area = i64::from(video.width) * i64::from(video.height);
            if area > highest.0 {
                highest = (area, video.stream_type);
            }
            if lowest.0 == 0 || area < lowest.0 {
                lowest = (area, video.stream_type);
            }
        }

        match resolution {
            Resolution::Hd => highest.1,
            Resolution::Sd => lowest.1,
        }
    }

    /// Whether the given stream type carries HEVC video.
    pub fn is_hevc(&self, stream_type: i32) -> bool {
        self.videos
            .iter()
            .find(|v| v.stream_type == stream_type)
            .map(|v| v.codec_type == CODEC_TYPE_HEVC)
            .unwrap_or(false)
    }

    /// The video entry for a stream type, if present.
    pub fn video_for(&self, stream_type: i32) -> Option<&VideoSkill> {
        self.videos.iter().find(|v| v.stream_type == stream_type)
    }

    /// First advertised audio format, if any.
    pub fn first_audio(&self) -> Option<&AudioSkill> {
        self.audios.first()
    }

    /// Whether the device supports hd/sd clarity selection (bit 5 of the
    /// capability bitmask).
    pub fn supports_clarity(&self) -> bool {
        (self.webrtc & (1 << 5)) != 0
    }
}
