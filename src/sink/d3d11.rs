//! Direct3D 11 back end for `SharedTextureSink`.

use tracing::{info, warn};
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
    D3D11_CPU_ACCESS_WRITE, D3D11_CREATE_DEVICE_FLAG, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_WRITE,
    D3D11_RESOURCE_MISC_SHARED, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT,
    D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_R8G8_B8G8_UNORM, DXGI_FORMAT_YUY2, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::IDXGIResource;

use crate::error::{PumpError, Result};
use crate::frame::PixelFormat;
use crate::sink::gpu::{GpuApi, MappedStaging, TextureDesc};

/// DXGI format holding `layout` at two bytes per pixel.
fn dxgi_format(layout: PixelFormat) -> Option<DXGI_FORMAT> {
    match layout {
        PixelFormat::Yuy2 => Some(DXGI_FORMAT_YUY2),
        // UYVY has no video format of its own; R8G8_B8G8 has the same byte order.
        PixelFormat::Uyvy => Some(DXGI_FORMAT_R8G8_B8G8_UNORM),
        PixelFormat::Other(_) => None,
    }
}

/// Hardware D3D11 device with a staging/shared texture pair.
pub struct D3d11Gpu {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    staging: Option<ID3D11Texture2D>,
    shared: Option<ID3D11Texture2D>,
    height: u32,
    mapped: bool,
}

// SAFETY: the immediate context is only used through `&mut self`, from one
// thread at a time.
unsafe impl Send for D3d11Gpu {}

impl D3d11Gpu {
    /// Create a hardware device and its immediate context.
    pub fn new() -> Result<Self> {
        let mut device: Option<ID3D11Device> = None;
        let mut context: Option<ID3D11DeviceContext> = None;
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                None,
                D3D11_CREATE_DEVICE_FLAG(0),
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        }
        .map_err(|e| PumpError::SinkConfigurationFailure(format!("D3D11CreateDevice: {e}")))?;

        match (device, context) {
            (Some(device), Some(context)) => {
                info!("D3D11 device created");
                Ok(Self {
                    device,
                    context,
                    staging: None,
                    shared: None,
                    height: 0,
                    mapped: false,
                })
            }
            _ => Err(PumpError::SinkConfigurationFailure(
                "D3D11CreateDevice returned no device".to_string(),
            )),
        }
    }

    fn create_texture(&self, desc: &D3D11_TEXTURE2D_DESC, what: &str) -> Result<ID3D11Texture2D> {
        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { self.device.CreateTexture2D(desc, None, Some(&mut texture)) }
            .map_err(|e| PumpError::SinkConfigurationFailure(format!("{what} texture: {e}")))?;
        texture.ok_or_else(|| {
            PumpError::SinkConfigurationFailure(format!("{what} texture was not created"))
        })
    }
}

impl GpuApi for D3d11Gpu {
    fn name(&self) -> &str {
        "d3d11"
    }

    fn create_textures(&mut self, desc: &TextureDesc) -> Result<()> {
        let format = dxgi_format(desc.layout).ok_or_else(|| {
            PumpError::SinkConfigurationFailure(format!("no DXGI format for {}", desc.layout))
        })?;

        let mut texture_desc = D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            MiscFlags: 0,
        };
        self.staging = Some(self.create_texture(&texture_desc, "staging")?);

        texture_desc.Usage = D3D11_USAGE_DEFAULT;
        texture_desc.CPUAccessFlags = 0;
        texture_desc.MiscFlags = D3D11_RESOURCE_MISC_SHARED.0 as u32;
        self.shared = Some(self.create_texture(&texture_desc, "shared")?);

        self.height = desc.height;
        Ok(())
    }

    fn map_staging(&mut self) -> Result<MappedStaging<'_>> {
        let staging = self
            .staging
            .as_ref()
            .ok_or_else(|| PumpError::PublishFailure("staging texture not created".to_string()))?;

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.context
                .Map(staging, 0, D3D11_MAP_WRITE, 0, Some(&mut mapped))
        }
        .map_err(|e| PumpError::PublishFailure(format!("Map staging texture: {e}")))?;
        self.mapped = true;

        let row_pitch = mapped.RowPitch as usize;
        // SAFETY: the driver maps at least RowPitch * Height bytes, valid
        // until Unmap, which needs `&mut self`.
        let data = unsafe {
            std::slice::from_raw_parts_mut(
                mapped.pData as *mut u8,
                row_pitch * self.height as usize,
            )
        };
        Ok(MappedStaging { data, row_pitch })
    }

    fn unmap_staging(&mut self) {
        if !self.mapped {
            return;
        }
        if let Some(staging) = &self.staging {
            unsafe { self.context.Unmap(staging, 0) };
        }
        self.mapped = false;
    }

    fn copy_staging_to_shared(&mut self) {
        if let (Some(staging), Some(shared)) = (&self.staging, &self.shared) {
            unsafe { self.context.CopyResource(shared, staging) };
        }
    }

    fn shared_handle(&mut self) -> Result<u64> {
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| {
                PumpError::SinkConfigurationFailure("shared texture not created".to_string())
            })?;
        let resource: IDXGIResource = shared
            .cast()
            .map_err(|e| PumpError::SinkConfigurationFailure(format!("IDXGIResource: {e}")))?;
        let handle = unsafe { resource.GetSharedHandle() }
            .map_err(|e| PumpError::SinkConfigurationFailure(format!("GetSharedHandle: {e}")))?;
        Ok(handle.0 as usize as u64)
    }

    fn flush(&mut self) {
        self.unmap_staging();
        unsafe { self.context.Flush() };
    }
}

impl Drop for D3d11Gpu {
    fn drop(&mut self) {
        if self.mapped {
            warn!("staging texture still mapped at teardown");
            self.unmap_staging();
        }
    }
}
