use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::capture::device::{
    DeviceDescriptor, DeviceEnumerator, FormatNegotiator, NegotiatedFormat,
};
use crate::capture::source::{CaptureEvent, CaptureSource, CapturedFrame};
use crate::error::{PumpError, Result};
use crate::frame::{FrameRate, PixelFormat};

const SYNTHETIC_DEVICE_NAME: &str = "Synthetic Test Pattern";
const SYNTHETIC_SYMBOLIC_LINK: &str = "synthetic:test:pattern-001";

/// Filler written into row padding so leaks into the output are visible.
pub const PADDING_BYTE: u8 = 0xEE;

/// Enumerator that always reports the single synthetic device.
pub struct SyntheticEnumerator;

impl DeviceEnumerator for SyntheticEnumerator {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(vec![SyntheticSource::descriptor()])
    }
}

/// A fake capture device producing a moving YUY2 gradient.
///
/// Rows can carry padding like real drivers do, the stream can be cut after
/// a fixed number of frames, and individual pulls can be scripted to fail or
/// come back empty. Frames are produced as fast as they are pulled unless
/// pacing is switched on.
///
/// Enable via `SYNTHETIC_CAMERA=1` environment variable.
pub struct SyntheticSource {
    format: NegotiatedFormat,
    pitch: usize,
    frame: Vec<u8>,
    produced: u64,
    pulls: u64,
    frame_limit: Option<u64>,
    fail_at: Option<u64>,
    empty_pulls: HashSet<u64>,
    paced: bool,
    last_emit: Option<Instant>,
}

impl SyntheticSource {
    /// Create a source with tightly packed rows and no frame limit.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let format = NegotiatedFormat {
            width,
            height,
            pixel_format: PixelFormat::Yuy2,
            frame_rate: Some(FrameRate::SIXTY),
        };
        format.validate()?;
        let pitch = width as usize * 2;
        Ok(Self {
            format,
            pitch,
            frame: vec![PADDING_BYTE; pitch * height as usize],
            produced: 0,
            pulls: 0,
            frame_limit: None,
            fail_at: None,
            empty_pulls: HashSet::new(),
            paced: false,
            last_emit: None,
        })
    }

    /// Whether the synthetic camera is enabled via environment variable.
    pub fn is_enabled() -> bool {
        std::env::var("SYNTHETIC_CAMERA").is_ok_and(|v| v == "1" || v == "true")
    }

    pub fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            index: 0,
            display_name: SYNTHETIC_DEVICE_NAME.to_string(),
            symbolic_link: SYNTHETIC_SYMBOLIC_LINK.to_string(),
        }
    }

    /// Pad every row with `bytes` extra bytes.
    pub fn with_row_padding(mut self, bytes: usize) -> Self {
        self.pitch = self.format.width as usize * 2 + bytes;
        self.frame = vec![PADDING_BYTE; self.pitch * self.format.height as usize];
        self
    }

    /// Report end of stream after `frames` frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    pub fn with_frame_rate(mut self, rate: FrameRate) -> Self {
        self.format.frame_rate = Some(rate);
        self
    }

    /// Sleep between pulls so frames arrive at the configured rate.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Fail the `pull`-th call to `next_frame` (1-based).
    pub fn with_failure_at(mut self, pull: u64) -> Self {
        self.fail_at = Some(pull);
        self
    }

    /// Return `NoSample` on the `pull`-th call to `next_frame` (1-based).
    pub fn with_empty_pull_at(mut self, pull: u64) -> Self {
        self.empty_pulls.insert(pull);
        self
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Frames delivered so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn interval(&self) -> Duration {
        self.format
            .frame_rate
            .and_then(FrameRate::interval)
            .unwrap_or(Duration::from_micros(16_667))
    }

    fn wait_for_slot(&mut self) {
        if !self.paced {
            return;
        }
        let interval = self.interval();
        if let Some(last) = self.last_emit {
            let due = last + interval;
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.last_emit = Some(Instant::now());
    }

    /// Paint the gradient for the current frame, shifted one macropixel per frame.
    fn render(&mut self) {
        let width = self.format.width as usize;
        let height = self.format.height as usize;
        let shift = self.produced as usize * 2;
        for y in 0..height {
            let row = &mut self.frame[y * self.pitch..y * self.pitch + width * 2];
            let u = (y * 255 / height.max(1)) as u8;
            for (m, px) in row.chunks_exact_mut(4).enumerate() {
                let x = m * 2 + shift;
                px[0] = (x % 220 + 16) as u8; // Y0
                px[1] = u; // U
                px[2] = ((x + 1) % 220 + 16) as u8; // Y1
                px[3] = 255 - u; // V
            }
        }
    }
}

impl FormatNegotiator for SyntheticSource {
    fn negotiate_format(&mut self, _device: &DeviceDescriptor) -> Result<NegotiatedFormat> {
        Ok(self.format)
    }
}

impl CaptureSource for SyntheticSource {
    fn format(&self) -> NegotiatedFormat {
        self.format
    }

    fn next_frame(&mut self) -> Result<CaptureEvent<'_>> {
        self.pulls += 1;
        let pull = self.pulls;

        if self.fail_at == Some(pull) {
            return Err(PumpError::FrameReadFailure(format!(
                "synthetic failure on pull {pull}"
            )));
        }
        if self.empty_pulls.contains(&pull) {
            debug!("synthetic pull {pull}: no sample");
            return Ok(CaptureEvent::NoSample);
        }
        if self.frame_limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(CaptureEvent::EndOfStream);
        }

        self.wait_for_slot();
        self.render();
        let timestamp = self.interval().mul_f64(self.produced as f64);
        self.produced += 1;

        Ok(CaptureEvent::Frame(CapturedFrame {
            data: &self.frame,
            pitch: self.pitch,
            width: self.format.width,
            height: self.format.height,
            pixel_format: PixelFormat::Yuy2,
            timestamp,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::device;

    fn expect_frame(source: &mut SyntheticSource) -> (Vec<u8>, usize, Duration) {
        match source.next_frame().unwrap() {
            CaptureEvent::Frame(f) => (f.data.to_vec(), f.pitch, f.timestamp),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn odd_width_is_rejected() {
        assert!(matches!(
            SyntheticSource::new(641, 480),
            Err(PumpError::CapabilityNegotiationFailed(_))
        ));
    }

    #[test]
    fn frames_carry_row_padding() {
        let mut source = SyntheticSource::new(8, 4).unwrap().with_row_padding(16);
        let (data, pitch, _) = expect_frame(&mut source);
        assert_eq!(pitch, 32);
        assert_eq!(data.len(), 32 * 4);
        assert!(data[16..32].iter().all(|&b| b == PADDING_BYTE));
        assert!(data[..16].iter().all(|&b| b != PADDING_BYTE));
    }

    #[test]
    fn pattern_moves_between_frames() {
        let mut source = SyntheticSource::new(16, 2).unwrap();
        let (a, _, _) = expect_frame(&mut source);
        let (b, _, _) = expect_frame(&mut source);
        assert_ne!(a, b);
    }

    #[test]
    fn frame_limit_ends_the_stream() {
        let mut source = SyntheticSource::new(4, 2).unwrap().with_frame_limit(2);
        expect_frame(&mut source);
        expect_frame(&mut source);
        assert!(matches!(source.next_frame().unwrap(), CaptureEvent::EndOfStream));
        assert!(matches!(source.next_frame().unwrap(), CaptureEvent::EndOfStream));
        assert_eq!(source.produced(), 2);
    }

    #[test]
    fn scripted_failure_and_empty_pulls() {
        let mut source = SyntheticSource::new(4, 2)
            .unwrap()
            .with_empty_pull_at(2)
            .with_failure_at(3);
        expect_frame(&mut source);
        assert!(matches!(source.next_frame().unwrap(), CaptureEvent::NoSample));
        assert!(matches!(
            source.next_frame(),
            Err(PumpError::FrameReadFailure(_))
        ));
    }

    #[test]
    fn timestamps_advance_by_one_interval() {
        let mut source = SyntheticSource::new(4, 2)
            .unwrap()
            .with_frame_rate(FrameRate::new(30, 1));
        let (_, _, t0) = expect_frame(&mut source);
        let (_, _, t1) = expect_frame(&mut source);
        assert_eq!(t0, Duration::ZERO);
        let step = t1 - t0;
        assert!((step.as_secs_f64() - 1.0 / 30.0).abs() < 1e-6);
    }

    #[test]
    fn timestamps_keep_growing_past_u32_frames() {
        let mut source = SyntheticSource::new(4, 2)
            .unwrap()
            .with_frame_rate(FrameRate::new(60, 1));
        source.produced = u64::from(u32::MAX) + 2;
        let (_, _, timestamp) = expect_frame(&mut source);
        assert!(timestamp > Duration::from_secs(u64::from(u32::MAX) / 60));
    }

    #[test]
    fn paced_source_respects_frame_interval() {
        let mut source = SyntheticSource::new(4, 2)
            .unwrap()
            .with_frame_rate(FrameRate::new(50, 1))
            .paced(true);
        let started = Instant::now();
        for _ in 0..3 {
            expect_frame(&mut source);
        }
        assert!(started.elapsed() >= Duration::from_millis(38));
    }

    #[test]
    fn initializes_through_the_device_flow() {
        let mut source = SyntheticSource::new(1280, 720).unwrap();
        let (dev, fmt) = device::initialize(&SyntheticEnumerator, &mut source, None).unwrap();
        assert_eq!(dev.display_name, SYNTHETIC_DEVICE_NAME);
        assert_eq!(fmt.width, 1280);
        assert_eq!(fmt.pixel_format, PixelFormat::Yuy2);
    }

    #[test]
    fn is_enabled_reads_env_var() {
        // Only checks the default; the variable is unset in CI.
        if std::env::var("SYNTHETIC_CAMERA").is_err() {
            assert!(!SyntheticSource::is_enabled());
        }
    }
}
