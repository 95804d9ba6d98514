use std::time::Duration;

use crate::capture::device::NegotiatedFormat;
use crate::error::Result;
use crate::frame::PixelFormat;

/// A raw frame borrowed from the capture device.
///
/// Borrows the source mutably, so it cannot outlive the next pull.
#[derive(Debug)]
pub struct CapturedFrame<'a> {
    /// Row-pitched pixel data, at least `(height - 1) * pitch + width * 2` bytes.
    pub data: &'a [u8],
    /// Byte distance between row starts. May exceed `width * 2`.
    pub pitch: usize,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Presentation time relative to stream start.
    pub timestamp: Duration,
}

/// Outcome of one blocking pull.
#[derive(Debug)]
pub enum CaptureEvent<'a> {
    Frame(CapturedFrame<'a>),
    /// The device delivered a stream tick without a sample.
    NoSample,
    /// The stream ended. Terminal, not an error.
    EndOfStream,
}

/// A negotiated capture device exposing a blocking pull of raw frames.
///
/// Implemented per platform (Media Foundation on Windows) plus a synthetic
/// source for tests and headless runs.
pub trait CaptureSource: Send {
    /// The format fixed at initialisation time.
    fn format(&self) -> NegotiatedFormat;

    /// Block until the next sample arrives.
    ///
    /// Returns `Err(PumpError::FrameReadFailure)` when the device fails.
    fn next_frame(&mut self) -> Result<CaptureEvent<'_>>;

    /// Release the frame returned by the last pull, if any.
    fn release_frame(&mut self) {}
}
