//! Transform descriptor value types: target dimensions, resize mode, and
//! output format, with the canonical string forms embedded in cache ids.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Target width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

// Accepts "100x200" but also legacy separators like "100,200"; a bare
// "100" means a square.
static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+)(?:[^0-9]+([0-9]+))?$").expect("size regex"));

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Dimensions {
        Dimensions { width, height }
    }

    pub fn square(edge: u32) -> Dimensions {
        Dimensions {
            width: edge,
            height: edge,
        }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Dimensions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Dimensions> {
        let caps = SIZE_RE
            .captures(s)
            .ok_or_else(|| Error::InvalidDescriptor(format!("cannot parse size {s:?}")))?;
        let parse = |m: &str| {
            m.parse::<u32>()
                .map_err(|_| Error::InvalidDescriptor(format!("size out of range in {s:?}")))
        };
        let width = parse(&caps[1])?;
        let height = match caps.get(2) {
            Some(m) => parse(m.as_str())?,
            None => width,
        };
        Ok(Dimensions { width, height })
    }
}

/// How the source image is fitted into the target dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Fill the target completely, cropping overflow around the center.
    Crop,
    /// Fit inside the target, preserving aspect ratio.
    Shrink,
    /// Match the target exactly, ignoring aspect ratio.
    Stretch,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Crop => "crop",
            Mode::Shrink => "shrink",
            Mode::Stretch => "stretch",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = Error;

    /// Case-insensitive; `fit` and `fill` are legacy aliases accepted at the
    /// boundary only and never rendered back out. Legacy `fit` scaled to
    /// cover and center-cropped to the exact target (today's crop); legacy
    /// `fill` scaled to contain without cropping (today's shrink).
    fn from_str(s: &str) -> Result<Mode> {
        match s.to_ascii_lowercase().as_str() {
            "crop" | "fit" => Ok(Mode::Crop),
            "shrink" | "fill" => Ok(Mode::Shrink),
            "stretch" => Ok(Mode::Stretch),
            _ => Err(Error::InvalidDescriptor(format!("unknown resize mode {s:?}"))),
        }
    }
}

/// Output image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    /// Parse sentinel for unrecognized names; rejected before a descriptor
    /// goes live, so it never appears in a cache id.
    Unknown,
    Jpeg,
    Png,
    WebP,
}

impl Format {
    /// Lossy parse: unrecognized names yield `Unknown` so callers can
    /// substitute their default format.
    pub fn from_name(s: &str) -> Format {
        match s.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Format::Jpeg,
            "png" => Format::Png,
            "webp" => Format::WebP,
            _ => Format::Unknown,
        }
    }

    /// File extension, used as the id suffix and the convert output prefix.
    pub fn ext(&self) -> &'static str {
        match self {
            Format::Jpeg => "jpg",
            Format::Png => "png",
            Format::WebP => "webp",
            Format::Unknown => "unknown",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Format::Jpeg => "image/jpeg",
            Format::Png => "image/png",
            Format::WebP => "image/webp",
            Format::Unknown => "application/octet-stream",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ext())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_parse_and_render() {
        let d: Dimensions = "100x200".parse().unwrap();
        assert_eq!(d, Dimensions::new(100, 200));
        assert_eq!(d.to_string(), "100x200");
    }

    #[test]
    fn bare_number_is_square() {
        let d: Dimensions = "128".parse().unwrap();
        assert_eq!(d, Dimensions::square(128));
    }

    #[test]
    fn legacy_separators_accepted() {
        assert_eq!(
            "100,200".parse::<Dimensions>().unwrap(),
            Dimensions::new(100, 200)
        );
        assert_eq!(
            "100X200".parse::<Dimensions>().unwrap(),
            Dimensions::new(100, 200)
        );
    }

    #[test]
    fn dimensions_reject_garbage() {
        assert!("".parse::<Dimensions>().is_err());
        assert!("abc".parse::<Dimensions>().is_err());
        assert!("100x".parse::<Dimensions>().is_err());
        // 2^32 does not fit in u32
        assert!("4294967296".parse::<Dimensions>().is_err());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("crop".parse::<Mode>().unwrap(), Mode::Crop);
        assert_eq!("SHRINK".parse::<Mode>().unwrap(), Mode::Shrink);
        assert_eq!("Stretch".parse::<Mode>().unwrap(), Mode::Stretch);
        assert!("pad".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_legacy_aliases() {
        assert_eq!("fit".parse::<Mode>().unwrap(), Mode::Crop);
        assert_eq!("fill".parse::<Mode>().unwrap(), Mode::Shrink);
        // Canonical rendering never uses the aliases.
        assert_eq!(Mode::Crop.to_string(), "crop");
        assert_eq!(Mode::Shrink.to_string(), "shrink");
    }

    #[test]
    fn format_names() {
        assert_eq!(Format::from_name("jpeg"), Format::Jpeg);
        assert_eq!(Format::from_name("JPG"), Format::Jpeg);
        assert_eq!(Format::from_name("png"), Format::Png);
        assert_eq!(Format::from_name("webp"), Format::WebP);
        assert_eq!(Format::from_name("tiff"), Format::Unknown);
    }

    #[test]
    fn format_mime_types() {
        assert_eq!(Format::Jpeg.mime_type(), "image/jpeg");
        assert_eq!(Format::Png.mime_type(), "image/png");
        assert_eq!(Format::WebP.mime_type(), "image/webp");
    }
}
