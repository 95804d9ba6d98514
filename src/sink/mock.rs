//! Mock transmitter and graphics device for testing without NDI or a GPU.
//!
//! Both use a builder pattern for configuration and error injection, and
//! share their recorded state through an `Arc` so tests can inspect it after
//! handing the mock to a sink.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{PumpError, Result};
use crate::frame::FrameDesc;
use crate::sink::gpu::{GpuApi, MappedStaging, TextureDesc};
use crate::sink::sender::VideoSender;
use crate::stage::{LentFrame, Parity};

/// What `MockSender` saw for one `send_async` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub desc: FrameDesc,
    pub parity: Parity,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct MockSenderState {
    pub frames: Vec<SentFrame>,
    /// Number of `send_async(None)` calls.
    pub flushes: u32,
    pub closed: bool,
    /// Whether a frame is still held from the last call.
    pub holding: bool,
}

/// In-memory `VideoSender` that records every frame it is given.
///
/// Like a real transmitter it keeps the last frame until the next call.
pub struct MockSender {
    name: String,
    in_flight: Option<LentFrame>,
    state: Arc<Mutex<MockSenderState>>,
}

impl MockSender {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            in_flight: None,
            state: Arc::new(Mutex::new(MockSenderState::default())),
        }
    }

    /// Handle to the recorded state, usable after the sender is moved.
    pub fn state(&self) -> Arc<Mutex<MockSenderState>> {
        Arc::clone(&self.state)
    }
}

impl VideoSender for MockSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_async(&mut self, frame: Option<LentFrame>) {
        let mut state = self.state.lock();
        match &frame {
            Some(f) => {
                // SAFETY: read synchronously, while the pump is still inside publish.
                let bytes = unsafe { f.as_bytes() }.to_vec();
                state.frames.push(SentFrame {
                    desc: *f.desc(),
                    parity: f.parity(),
                    bytes,
                });
            }
            None => state.flushes += 1,
        }
        state.holding = frame.is_some();
        self.in_flight = frame;
    }

    fn close(&mut self) {
        self.in_flight = None;
        let mut state = self.state.lock();
        state.holding = false;
        state.closed = true;
    }
}

/// Configurable error injection for a specific operation.
#[derive(Debug, Clone)]
struct ErrorInjection {
    operation: &'static str,
    error: PumpError,
}

#[derive(Debug, Default)]
pub struct MockGpuState {
    pub textures: Option<TextureDesc>,
    pub staging: Vec<u8>,
    pub shared: Vec<u8>,
    pub row_pitch: usize,
    pub maps: u32,
    pub copies: u32,
    pub handle_requests: u32,
    pub flushes: u32,
    pub mapped: bool,
    error_injections: Vec<ErrorInjection>,
}

impl MockGpuState {
    /// Check for injected errors for the given operation.
    fn check_error(&mut self, operation: &str) -> Result<()> {
        if let Some(pos) = self
            .error_injections
            .iter()
            .position(|e| e.operation == operation)
        {
            let injection = self.error_injections.remove(pos);
            return Err(injection.error);
        }
        Ok(())
    }

    /// Shared texture contents with row padding stripped.
    pub fn shared_packed(&self) -> Vec<u8> {
        let Some(desc) = self.textures else {
            return Vec::new();
        };
        let row = desc.row_bytes();
        self.shared
            .chunks(self.row_pitch.max(1))
            .take(desc.height as usize)
            .flat_map(|r| r[..row.min(r.len())].iter().copied())
            .collect()
    }
}

/// In-memory `GpuApi` with driver-style row pitch alignment.
pub struct MockGpu {
    pitch_alignment: usize,
    handle: u64,
    staging_scratch: Vec<u8>,
    state: Arc<Mutex<MockGpuState>>,
}

impl MockGpu {
    pub fn new() -> Self {
        Self {
            pitch_alignment: 1,
            handle: 0x4242,
            staging_scratch: Vec::new(),
            state: Arc::new(Mutex::new(MockGpuState::default())),
        }
    }

    /// Round mapped row pitches up to a multiple of `alignment` bytes.
    pub fn with_pitch_alignment(mut self, alignment: usize) -> Self {
        self.pitch_alignment = alignment.max(1);
        self
    }

    pub fn with_handle(mut self, handle: u64) -> Self {
        self.handle = handle;
        self
    }

    /// Inject an error for a specific operation name.
    ///
    /// Operation names: `"create_textures"`, `"map_staging"`, `"shared_handle"`.
    pub fn with_error(self, operation: &'static str, error: PumpError) -> Self {
        self.state
            .lock()
            .error_injections
            .push(ErrorInjection { operation, error });
        self
    }

    /// Handle to the recorded state, usable after the device is moved.
    pub fn state(&self) -> Arc<Mutex<MockGpuState>> {
        Arc::clone(&self.state)
    }
}

impl Default for MockGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuApi for MockGpu {
    fn name(&self) -> &str {
        "mock"
    }

    fn create_textures(&mut self, desc: &TextureDesc) -> Result<()> {
        let mut state = self.state.lock();
        state.check_error("create_textures")?;
        let row_pitch = desc.row_bytes().div_ceil(self.pitch_alignment) * self.pitch_alignment;
        let size = row_pitch * desc.height as usize;
        state.textures = Some(*desc);
        state.row_pitch = row_pitch;
        state.staging = vec![0; size];
        state.shared = vec![0; size];
        Ok(())
    }

    fn map_staging(&mut self) -> Result<MappedStaging<'_>> {
        let mut state = self.state.lock();
        state.check_error("map_staging")?;
        if state.textures.is_none() {
            return Err(PumpError::PublishFailure("staging texture not created".to_string()));
        }
        state.maps += 1;
        state.mapped = true;
        let row_pitch = state.row_pitch;
        // Writes land in a scratch copy; unmap moves them into the texture.
        self.staging_scratch = state.staging.clone();
        drop(state);
        Ok(MappedStaging {
            data: &mut self.staging_scratch,
            row_pitch,
        })
    }

    fn unmap_staging(&mut self) {
        let mut state = self.state.lock();
        if state.mapped {
            state.staging = std::mem::take(&mut self.staging_scratch);
            state.mapped = false;
        }
    }

    fn copy_staging_to_shared(&mut self) {
        let mut state = self.state.lock();
        state.shared = state.staging.clone();
        state.copies += 1;
    }

    fn shared_handle(&mut self) -> Result<u64> {
        let mut state = self.state.lock();
        state.check_error("shared_handle")?;
        state.handle_requests += 1;
        Ok(self.handle)
    }

    fn flush(&mut self) {
        self.state.lock().flushes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn desc(width: u32, height: u32) -> TextureDesc {
        TextureDesc {
            width,
            height,
            layout: PixelFormat::Yuy2,
        }
    }

    #[test]
    fn pitch_alignment_pads_rows() {
        let mut gpu = MockGpu::new().with_pitch_alignment(64);
        gpu.create_textures(&desc(6, 2)).unwrap();
        let mapped = gpu.map_staging().unwrap();
        assert_eq!(mapped.row_pitch, 64);
        assert_eq!(mapped.data.len(), 128);
    }

    #[test]
    fn map_before_create_fails() {
        let mut gpu = MockGpu::new();
        assert!(matches!(
            gpu.map_staging(),
            Err(PumpError::PublishFailure(_))
        ));
    }

    #[test]
    fn injected_error_fires_once() {
        let mut gpu = MockGpu::new().with_error(
            "map_staging",
            PumpError::PublishFailure("device removed".to_string()),
        );
        gpu.create_textures(&desc(2, 1)).unwrap();
        assert!(gpu.map_staging().is_err());
        assert!(gpu.map_staging().is_ok());
    }

    #[test]
    fn writes_reach_shared_only_after_copy() {
        let mut gpu = MockGpu::new();
        let state = gpu.state();
        gpu.create_textures(&desc(2, 1)).unwrap();
        gpu.map_staging().unwrap().data.copy_from_slice(&[1, 2, 3, 4]);
        gpu.unmap_staging();
        assert_eq!(state.lock().shared, vec![0; 4]);
        gpu.copy_staging_to_shared();
        assert_eq!(state.lock().shared_packed(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn mock_sender_holds_last_frame_until_next_call() {
        use crate::frame::FrameRate;
        use crate::stage::DoubleBufferedStage;
        use std::time::Duration;

        let mut stage = DoubleBufferedStage::allocate(2, 1).unwrap();
        let mut sender = MockSender::new("mock");
        let state = sender.state();
        let (parity, _) = stage.next_target();
        let desc = FrameDesc {
            width: 2,
            height: 1,
            stride_bytes: 4,
            frame_rate: FrameRate::SIXTY,
            pixel_format: PixelFormat::Uyvy,
            timestamp: Duration::ZERO,
            sequence: 1,
        };
        sender.send_async(Some(stage.lend(parity, desc)));
        assert!(stage.buffer(parity).is_held());
        assert!(state.lock().holding);

        sender.send_async(None);
        assert!(!stage.buffer(parity).is_held());
        assert_eq!(state.lock().flushes, 1);
        assert_eq!(state.lock().frames.len(), 1);
    }
}
