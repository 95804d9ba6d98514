use serde::Serialize;
use tracing::{debug, info};

use crate::error::{PumpError, Result};
use crate::frame::PixelFormat;
use crate::sink::gpu::{GpuApi, TextureDesc};
use crate::stage::LentFrame;

/// OS handle to the shared texture plus what a consumer needs to open it.
///
/// Valid for the lifetime of the exporting process. Consumers open it
/// read-only and never free it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedTextureHandle {
    pub raw: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

/// Publishes frames into a GPU texture other processes can open.
///
/// Each publish maps a CPU-writable staging texture, copies the frame in
/// row by row, unmaps, and queues a device copy into the shared texture.
pub struct SharedTextureSink {
    gpu: Box<dyn GpuApi>,
    desc: TextureDesc,
    handle: Option<SharedTextureHandle>,
    published: u64,
    shut_down: bool,
}

impl SharedTextureSink {
    /// Create the staging and shared textures on `gpu`.
    pub fn configure(
        mut gpu: Box<dyn GpuApi>,
        width: u32,
        height: u32,
        layout: PixelFormat,
    ) -> Result<Self> {
        if !layout.is_packed_422() {
            return Err(PumpError::SinkConfigurationFailure(format!(
                "shared texture cannot hold {layout}"
            )));
        }
        if width == 0 || height == 0 {
            return Err(PumpError::SinkConfigurationFailure(format!(
                "empty texture size {width}x{height}"
            )));
        }

        let desc = TextureDesc {
            width,
            height,
            layout,
        };
        gpu.create_textures(&desc)?;
        info!(
            "shared texture sink configured on {}: {width}x{height} {layout}",
            gpu.name()
        );
        Ok(Self {
            gpu,
            desc,
            handle: None,
            published: 0,
            shut_down: false,
        })
    }

    pub fn layout(&self) -> PixelFormat {
        self.desc.layout
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    /// Copy `frame` into the staging texture and queue the copy to the
    /// shared texture. The lease ends before this returns.
    pub fn publish(&mut self, frame: LentFrame) -> Result<()> {
        let fd = frame.desc();
        if fd.width != self.desc.width || fd.height != self.desc.height {
            return Err(PumpError::PublishFailure(format!(
                "frame is {}x{}, texture is {}x{}",
                fd.width, fd.height, self.desc.width, self.desc.height
            )));
        }

        let row = self.desc.row_bytes();
        let height = self.desc.height as usize;
        // SAFETY: read synchronously, before the pump touches this parity again.
        let src = unsafe { frame.as_bytes() };
        if src.len() < row * height {
            return Err(PumpError::PublishFailure(format!(
                "frame holds {} bytes, texture needs {}",
                src.len(),
                row * height
            )));
        }

        let mut mapped = self.gpu.map_staging()?;
        let pitch = mapped.row_pitch;
        if pitch < row || mapped.data.len() < (height - 1) * pitch + row {
            self.gpu.unmap_staging();
            return Err(PumpError::PublishFailure(format!(
                "mapped staging texture too small (pitch {pitch}, row {row})"
            )));
        }
        for (y, src_row) in src.chunks_exact(row).take(height).enumerate() {
            mapped.data[y * pitch..y * pitch + row].copy_from_slice(src_row);
        }
        self.gpu.unmap_staging();
        self.gpu.copy_staging_to_shared();

        self.published += 1;
        if self.published <= 3 {
            debug!(
                "texture frame {}: seq {} pitch {pitch}",
                self.published,
                fd.sequence
            );
        }
        drop(frame);
        Ok(())
    }

    /// The shared texture's OS handle, fetched once and cached.
    pub fn export_handle(&mut self) -> Result<SharedTextureHandle> {
        if let Some(handle) = self.handle {
            return Ok(handle);
        }
        let raw = self.gpu.shared_handle()?;
        let handle = SharedTextureHandle {
            raw,
            width: self.desc.width,
            height: self.desc.height,
            pixel_format: self.desc.layout,
        };
        info!(
            "shared texture handle is {raw:#x} ({}x{} {})",
            handle.width, handle.height, handle.pixel_format
        );
        self.handle = Some(handle);
        Ok(handle)
    }

    /// Submit outstanding GPU work. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.gpu.flush();
        info!("shared texture sink closed after {} frames", self.published);
    }
}

impl Drop for SharedTextureSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}
