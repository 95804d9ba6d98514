use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Build a little-endian FourCC code from four ASCII bytes.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// Packed pixel formats the pump understands.
///
/// Both 4:2:2 variants store two pixels in a 4-byte macropixel; they only
/// differ in byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PixelFormat {
    /// `[Y0, U, Y1, V]`, what webcams deliver natively.
    Yuy2,
    /// `[U, Y0, V, Y1]`, what network video receivers expect.
    Uyvy,
    /// Anything else, identified by its FourCC.
    Other(u32),
}

impl PixelFormat {
    /// Map a FourCC code to a pixel format.
    pub fn from_fourcc(code: u32) -> Self {
        match code {
            c if c == fourcc(b"YUY2") || c == fourcc(b"YUYV") => Self::Yuy2,
            c if c == fourcc(b"UYVY") => Self::Uyvy,
            other => Self::Other(other),
        }
    }

    /// FourCC code for this format.
    pub fn fourcc(self) -> u32 {
        match self {
            Self::Yuy2 => fourcc(b"YUY2"),
            Self::Uyvy => fourcc(b"UYVY"),
            Self::Other(code) => code,
        }
    }

    /// Whether this is one of the packed 4:2:2 layouts.
    pub fn is_packed_422(self) -> bool {
        matches!(self, Self::Yuy2 | Self::Uyvy)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.fourcc().to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic()) {
            write!(f, "{}", String::from_utf8_lossy(&bytes))
        } else {
            write!(f, "{:08X}", self.fourcc())
        }
    }
}

/// Frame rate as an exact rational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameRate {
    /// 60 fps expressed the way network receivers expect it (60000/1000).
    pub const SIXTY: Self = Self {
        numerator: 60_000,
        denominator: 1_000,
    };

    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Duration of one frame, or `None` for a degenerate rate.
    pub fn interval(self) -> Option<Duration> {
        if self.numerator == 0 || self.denominator == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            f64::from(self.denominator) / f64::from(self.numerator),
        ))
    }

    pub fn as_f64(self) -> f64 {
        if self.denominator == 0 {
            return 0.0;
        }
        f64::from(self.numerator) / f64::from(self.denominator)
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::SIXTY
    }
}

/// Metadata describing a tightly packed frame handed to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDesc {
    pub width: u32,
    pub height: u32,
    pub stride_bytes: u32,
    pub frame_rate: FrameRate,
    pub pixel_format: PixelFormat,
    /// Capture timestamp relative to stream start.
    pub timestamp: Duration,
    /// Monotonic frame counter assigned by the pump, starting at 1.
    pub sequence: u64,
}

impl FrameDesc {
    /// Total payload size in bytes.
    pub fn len(&self) -> usize {
        self.stride_bytes as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_known_formats() {
        assert_eq!(PixelFormat::from_fourcc(fourcc(b"YUY2")), PixelFormat::Yuy2);
        assert_eq!(PixelFormat::from_fourcc(fourcc(b"UYVY")), PixelFormat::Uyvy);
        assert_eq!(PixelFormat::Uyvy.fourcc(), fourcc(b"UYVY"));
    }

    #[test]
    fn yuyv_is_treated_as_yuy2() {
        assert_eq!(PixelFormat::from_fourcc(fourcc(b"YUYV")), PixelFormat::Yuy2);
    }

    #[test]
    fn unknown_fourcc_is_preserved() {
        let nv12 = fourcc(b"NV12");
        assert_eq!(PixelFormat::from_fourcc(nv12), PixelFormat::Other(nv12));
        assert!(!PixelFormat::Other(nv12).is_packed_422());
    }

    #[test]
    fn display_prints_ascii_fourcc() {
        assert_eq!(PixelFormat::Yuy2.to_string(), "YUY2");
        assert_eq!(PixelFormat::Other(0x0000_0016).to_string(), "00000016");
    }

    #[test]
    fn sixty_fps_interval() {
        let interval = FrameRate::SIXTY.interval().unwrap();
        assert!((interval.as_secs_f64() - 1.0 / 60.0).abs() < 1e-9);
        assert_eq!(FrameRate::new(0, 1).interval(), None);
    }

    #[test]
    fn frame_desc_len_uses_stride() {
        let desc = FrameDesc {
            width: 4,
            height: 3,
            stride_bytes: 8,
            frame_rate: FrameRate::SIXTY,
            pixel_format: PixelFormat::Uyvy,
            timestamp: Duration::ZERO,
            sequence: 1,
        };
        assert_eq!(desc.len(), 24);
        assert!(!desc.is_empty());
    }
}
