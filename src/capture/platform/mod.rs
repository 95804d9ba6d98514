#[cfg(target_os = "windows")]
pub mod windows;

use crate::capture::source::CaptureSource;
use crate::error::Result;

#[cfg(target_os = "windows")]
pub use self::windows::{MediaFoundationEnumerator, MediaFoundationSource};

/// Open the platform's capture device at `requested`, or the first one.
///
/// The returned source must be dropped on the thread that opened it.
#[cfg(target_os = "windows")]
pub fn open_device(requested: Option<usize>) -> Result<Box<dyn CaptureSource>> {
    Ok(Box::new(MediaFoundationSource::open(requested)?))
}

#[cfg(not(target_os = "windows"))]
pub fn open_device(_requested: Option<usize>) -> Result<Box<dyn CaptureSource>> {
    Err(crate::error::PumpError::DeviceUnavailable(
        "no capture backend for this platform; set SYNTHETIC_CAMERA=1".to_string(),
    ))
}
