//! `GpuApi` trait: abstracts the graphics device behind `SharedTextureSink`.
//!
//! Direct3D 11 implements it on Windows; `MockGpu` implements it in memory
//! for tests.

use crate::error::Result;
use crate::frame::PixelFormat;

/// Size and layout of the staging/shared texture pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub layout: PixelFormat,
}

impl TextureDesc {
    /// Packed bytes per row.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * 2
    }
}

/// CPU view of the mapped staging texture.
///
/// Rows start `row_pitch` bytes apart; the driver may pad them.
pub struct MappedStaging<'a> {
    pub data: &'a mut [u8],
    pub row_pitch: usize,
}

/// Graphics device operations needed to publish into a shared texture.
///
/// All methods take `&mut self`; the sink is the only caller.
pub trait GpuApi: Send {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Create a CPU-writable staging texture and a GPU-only texture flagged
    /// for cross-process sharing, both described by `desc`.
    fn create_textures(&mut self, desc: &TextureDesc) -> Result<()>;

    /// Map the staging texture for writing.
    ///
    /// Returns `PumpError::PublishFailure` if the map fails.
    fn map_staging(&mut self) -> Result<MappedStaging<'_>>;

    fn unmap_staging(&mut self);

    /// Queue a device-side copy from staging to shared. Returns without
    /// waiting for the copy to complete.
    fn copy_staging_to_shared(&mut self);

    /// OS handle other processes can open the shared texture with.
    fn shared_handle(&mut self) -> Result<u64>;

    /// Submit queued work.
    fn flush(&mut self) {}
}
