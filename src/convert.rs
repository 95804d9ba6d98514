// Packed 4:2:2 byte reordering and pitch normalization.
//
// Capture devices hand out rows padded to an alignment boundary; sinks want
// tightly packed rows. Both conversions here run in a single pass over the
// source and do no colour arithmetic.

use thiserror::Error;

use crate::error::PumpError;
use crate::frame::PixelFormat;

/// Reasons a conversion cannot run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("width {0} is not a whole number of macropixels")]
    OddWidth(u32),

    #[error("pitch {pitch} is smaller than the packed row size {row}")]
    PitchTooSmall { pitch: usize, row: usize },

    #[error("source holds {actual} bytes, needs at least {required}")]
    SourceTooShort { required: usize, actual: usize },

    #[error("destination holds {actual} bytes, needs at least {required}")]
    DestinationTooShort { required: usize, actual: usize },

    #[error("unsupported target layout {0}")]
    UnsupportedLayout(PixelFormat),
}

impl From<ConvertError> for PumpError {
    fn from(e: ConvertError) -> Self {
        PumpError::FrameReadFailure(e.to_string())
    }
}

/// Size in bytes of a tightly packed 4:2:2 frame.
pub fn packed_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 2
}

/// Check dimensions and buffer sizes, returning the packed row length.
fn validate(
    src: &[u8],
    pitch: usize,
    width: u32,
    height: u32,
    dst_len: usize,
) -> Result<usize, ConvertError> {
    if width % 2 != 0 {
        return Err(ConvertError::OddWidth(width));
    }
    let row = width as usize * 2;
    if pitch < row {
        return Err(ConvertError::PitchTooSmall { pitch, row });
    }
    // The last row only needs its visible bytes; trailing padding may be absent.
    let required = match height as usize {
        0 => 0,
        h => (h - 1) * pitch + row,
    };
    if src.len() < required {
        return Err(ConvertError::SourceTooShort {
            required,
            actual: src.len(),
        });
    }
    let packed = row * height as usize;
    if dst_len < packed {
        return Err(ConvertError::DestinationTooShort {
            required: packed,
            actual: dst_len,
        });
    }
    Ok(row)
}

/// Convert a pitched YUY2 frame into tightly packed UYVY.
///
/// Each source macropixel `[Y0, U, Y1, V]` becomes `[U, Y0, V, Y1]` at the
/// same packed offset. Source rows start `pitch` bytes apart; destination
/// rows are exactly `width * 2` bytes.
pub fn convert(
    src: &[u8],
    pitch: usize,
    width: u32,
    height: u32,
    dst: &mut [u8],
) -> Result<(), ConvertError> {
    convert_into(PixelFormat::Uyvy, src, pitch, width, height, dst)
}

/// Convert a pitched YUY2 frame into the given packed 4:2:2 layout.
///
/// `Uyvy` swaps bytes within each macropixel; `Yuy2` only strips the row
/// padding.
pub fn convert_into(
    layout: PixelFormat,
    src: &[u8],
    pitch: usize,
    width: u32,
    height: u32,
    dst: &mut [u8],
) -> Result<(), ConvertError> {
    let row = validate(src, pitch, width, height, dst.len())?;
    if row == 0 {
        return Ok(());
    }

    match layout {
        PixelFormat::Uyvy => {
            for (y, dst_row) in dst.chunks_exact_mut(row).take(height as usize).enumerate() {
                let src_row = &src[y * pitch..y * pitch + row];
                for (d, s) in dst_row.chunks_exact_mut(4).zip(src_row.chunks_exact(4)) {
                    d[0] = s[1]; // U
                    d[1] = s[0]; // Y0
                    d[2] = s[3]; // V
                    d[3] = s[2]; // Y1
                }
            }
        }
        PixelFormat::Yuy2 => {
            for (y, dst_row) in dst.chunks_exact_mut(row).take(height as usize).enumerate() {
                dst_row.copy_from_slice(&src[y * pitch..y * pitch + row]);
            }
        }
        other => return Err(ConvertError::UnsupportedLayout(other)),
    }
    Ok(())
}

/// Convert into a freshly allocated, tightly packed buffer.
pub fn convert_to_vec(
    layout: PixelFormat,
    src: &[u8],
    pitch: usize,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, ConvertError> {
    let mut out = vec![0u8; packed_len(width, height)];
    convert_into(layout, src, pitch, width, height, &mut out)?;
    Ok(out)
}
