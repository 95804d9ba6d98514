//! Raw NDI SDK FFI declarations.
//!
//! Only compiled with the `ndi` feature, which links the NDI runtime. All
//! access goes through `NdiSender`; never call these directly.

#![allow(non_snake_case, non_camel_case_types)]

use std::ffi::{c_char, c_int, c_void};

pub type NDIlib_send_instance_t = *mut c_void;

/// `NDIlib_FourCC_video_type_UYVY`.
pub const NDILIB_FOURCC_UYVY: u32 = crate::frame::fourcc(b"UYVY");

/// `NDIlib_frame_format_type_progressive`.
pub const NDILIB_FRAME_FORMAT_PROGRESSIVE: c_int = 1;

/// Ask the SDK to generate the timecode.
pub const NDILIB_SEND_TIMECODE_SYNTHESIZE: i64 = i64::MAX;

#[repr(C)]
pub struct NDIlib_send_create_t {
    pub p_ndi_name: *const c_char,
    pub p_groups: *const c_char,
    pub clock_video: bool,
    pub clock_audio: bool,
}

#[repr(C)]
pub struct NDIlib_video_frame_v2_t {
    pub xres: c_int,
    pub yres: c_int,
    pub FourCC: u32,
    pub frame_rate_N: c_int,
    pub frame_rate_D: c_int,
    pub picture_aspect_ratio: f32,
    pub frame_format_type: c_int,
    pub timecode: i64,
    pub p_data: *mut u8,
    pub line_stride_in_bytes: c_int,
    pub p_metadata: *const c_char,
    pub timestamp: i64,
}

#[cfg_attr(windows, link(name = "Processing.NDI.Lib.x64"))]
#[cfg_attr(not(windows), link(name = "ndi"))]
extern "C" {
    /// Initialise the runtime. Returns false on unsupported CPUs.
    pub fn NDIlib_initialize() -> bool;

    /// Release the runtime.
    pub fn NDIlib_destroy();

    /// Create a sender. Returns null on failure.
    pub fn NDIlib_send_create(create: *const NDIlib_send_create_t) -> NDIlib_send_instance_t;

    pub fn NDIlib_send_destroy(instance: NDIlib_send_instance_t);

    /// Queue a frame. The SDK keeps reading `p_data` until the next call;
    /// passing null waits for the in-flight frame to be released.
    pub fn NDIlib_send_send_video_async_v2(
        instance: NDIlib_send_instance_t,
        frame: *const NDIlib_video_frame_v2_t,
    );
}
