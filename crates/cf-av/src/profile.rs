//! Output presets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use cf_core::{Error, Result};

/// H.264 quality for every preset.
pub const VIDEO_CRF: u32 = 18;

/// Target rendition for a transcode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Profile {
    #[default]
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
}

impl Profile {
    pub const ALL: [Profile; 2] = [Profile::P720, Profile::P1080];

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::P720 => "720p",
            Profile::P1080 => "1080p",
        }
    }

    /// Output frame height in pixels.
    pub fn height(&self) -> u32 {
        match self {
            Profile::P720 => 720,
            Profile::P1080 => 1080,
        }
    }

    /// ffmpeg filter scaling to the target height with an even width that
    /// keeps the source aspect ratio.
    pub fn scale_filter(&self) -> String {
        format!("scale=-2:{}", self.height())
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "720p" => Ok(Profile::P720),
            "1080p" => Ok(Profile::P1080),
            other => Err(Error::Validation(format!("unknown preset: {other}"))),
        }
    }
}
