use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::Error;

/// Raster encodings a user can request for the converted file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetFormat {
    Jpg,
    Png,
    Gif,
    Webp,
}

impl TargetFormat {
    pub const ALL: [Self; 4] = [Self::Jpg, Self::Png, Self::Gif, Self::Webp];

    pub const fn mime_type(self) -> &'static str {
        match self {
            Self::Jpg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
        }
    }

    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }

    pub const fn id(self) -> &'static str {
        match self {
            Self::Jpg => "JPG",
            Self::Png => "PNG",
            Self::Gif => "GIF",
            Self::Webp => "WEBP",
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Identifiers arrive from the request and may name anything.
impl FromStr for TargetFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "JPG" | "JPEG" => Ok(Self::Jpg),
            "PNG" => Ok(Self::Png),
            "GIF" => Ok(Self::Gif),
            "WEBP" => Ok(Self::Webp),
            _ => Err(Error::UnsupportedFormat(s.to_owned())),
        }
    }
}
