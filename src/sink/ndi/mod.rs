//! NDI transmitter with RAII lifecycle management.
//!
//! Only compiled when the `ndi` feature is enabled and the NDI runtime is
//! available for linking. Tests use `MockSender` instead.

mod ffi;

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::error::{PumpError, Result};
use crate::frame::FrameDesc;
use crate::sink::sender::VideoSender;
use crate::stage::LentFrame;

/// Whether the runtime has been initialised (global, since NDI is per-process).
static RUNTIME_INITIALISED: AtomicBool = AtomicBool::new(false);

fn video_frame(desc: &FrameDesc, data: *const u8) -> ffi::NDIlib_video_frame_v2_t {
    ffi::NDIlib_video_frame_v2_t {
        xres: desc.width as i32,
        yres: desc.height as i32,
        FourCC: ffi::NDILIB_FOURCC_UYVY,
        frame_rate_N: desc.frame_rate.numerator as i32,
        frame_rate_D: desc.frame_rate.denominator as i32,
        picture_aspect_ratio: 0.0,
        frame_format_type: ffi::NDILIB_FRAME_FORMAT_PROGRESSIVE,
        timecode: ffi::NDILIB_SEND_TIMECODE_SYNTHESIZE,
        p_data: data as *mut u8,
        line_stride_in_bytes: desc.stride_bytes as i32,
        p_metadata: std::ptr::null(),
        timestamp: 0,
    }
}

/// Sender backed by the NDI runtime.
///
/// Initialises the runtime on construction and releases it on close.
/// Only one instance should exist per process.
pub struct NdiSender {
    name: String,
    // Kept alive for the SDK, which may hold on to the pointer.
    _c_name: CString,
    instance: ffi::NDIlib_send_instance_t,
    /// Frame the SDK may still be reading.
    in_flight: Option<LentFrame>,
    closed: bool,
}

// SAFETY: the sender instance is only touched through `&mut self`.
unsafe impl Send for NdiSender {}

impl NdiSender {
    /// Initialise the runtime and create a sender called `name`.
    ///
    /// # Errors
    ///
    /// Returns `PumpError::SinkConfigurationFailure` if the runtime is
    /// already in use, rejects the CPU, or cannot create the sender.
    pub fn new(name: &str) -> Result<Self> {
        let c_name = CString::new(name).map_err(|_| {
            PumpError::SinkConfigurationFailure(format!("sender name {name:?} contains NUL"))
        })?;

        if RUNTIME_INITIALISED.swap(true, Ordering::SeqCst) {
            return Err(PumpError::SinkConfigurationFailure(
                "NDI runtime already initialised".to_string(),
            ));
        }

        if !unsafe { ffi::NDIlib_initialize() } {
            RUNTIME_INITIALISED.store(false, Ordering::SeqCst);
            return Err(PumpError::SinkConfigurationFailure(
                "NDI runtime reported this CPU as unsupported".to_string(),
            ));
        }

        let create = ffi::NDIlib_send_create_t {
            p_ndi_name: c_name.as_ptr(),
            p_groups: std::ptr::null(),
            clock_video: false,
            clock_audio: false,
        };
        let instance = unsafe { ffi::NDIlib_send_create(&create) };
        if instance.is_null() {
            unsafe { ffi::NDIlib_destroy() };
            RUNTIME_INITIALISED.store(false, Ordering::SeqCst);
            return Err(PumpError::SinkConfigurationFailure(format!(
                "could not create NDI sender '{name}'"
            )));
        }

        info!("NDI sender '{name}' created");
        Ok(Self {
            name: name.to_string(),
            _c_name: c_name,
            instance,
            in_flight: None,
            closed: false,
        })
    }
}

impl VideoSender for NdiSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_async(&mut self, frame: Option<LentFrame>) {
        if self.closed {
            return;
        }
        match frame {
            Some(frame) => {
                let video = video_frame(frame.desc(), frame.as_ptr());
                unsafe { ffi::NDIlib_send_send_video_async_v2(self.instance, &video) };
                // The SDK has let go of the previous frame once the call returns.
                self.in_flight = Some(frame);
            }
            None => {
                unsafe { ffi::NDIlib_send_send_video_async_v2(self.instance, std::ptr::null()) };
                self.in_flight = None;
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        unsafe {
            ffi::NDIlib_send_send_video_async_v2(self.instance, std::ptr::null());
        }
        self.in_flight = None;
        unsafe {
            ffi::NDIlib_send_destroy(self.instance);
            ffi::NDIlib_destroy();
        }
        RUNTIME_INITIALISED.store(false, Ordering::SeqCst);
        debug!("NDI sender '{}' destroyed", self.name);
    }
}

impl Drop for NdiSender {
    fn drop(&mut self) {
        self.close();
    }
}
