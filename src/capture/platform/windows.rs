use std::time::Duration;

use tracing::{debug, info, warn};
use windows::core::{Interface, GUID, PWSTR};
use windows::Win32::Media::MediaFoundation::{
    IMF2DBuffer2, IMFActivate, IMFAttributes, IMFMediaBuffer, IMFMediaSource, IMFSourceReader,
    MF2DBuffer_LockFlags_Read, MFCreateAttributes, MFCreateSourceReaderFromMediaSource,
    MFEnumDeviceSources, MFShutdown, MFStartup, MFSTARTUP_FULL,
    MF_DEVSOURCE_ATTRIBUTE_FRIENDLY_NAME, MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE,
    MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_GUID,
    MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_SYMBOLIC_LINK, MF_MT_FRAME_RATE, MF_MT_FRAME_SIZE,
    MF_MT_SUBTYPE, MF_SOURCE_READERF_ENDOFSTREAM, MF_SOURCE_READERF_STREAMTICK,
    MF_SOURCE_READER_DISCONNECT_MEDIASOURCE_ON_SHUTDOWN, MF_SOURCE_READER_FIRST_VIDEO_STREAM,
};
use windows::Win32::System::Com::{
    CoInitializeEx, CoTaskMemFree, CoUninitialize, COINIT_MULTITHREADED,
};

use crate::capture::device::{
    self, DeviceDescriptor, DeviceEnumerator, FormatNegotiator, NegotiatedFormat,
};
use crate::capture::source::{CaptureEvent, CaptureSource, CapturedFrame};
use crate::error::{PumpError, Result};
use crate::frame::{FrameRate, PixelFormat};

/// MF version for Win7+.
const MF_VERSION: u32 = 0x0002_0070;

fn first_video_stream() -> u32 {
    MF_SOURCE_READER_FIRST_VIDEO_STREAM.0 as u32
}

/// COM thread guard: pairs CoInitializeEx with CoUninitialize.
struct ComGuard;

impl ComGuard {
    fn init() -> Result<Self> {
        unsafe {
            let hr = CoInitializeEx(None, COINIT_MULTITHREADED);
            if hr.is_err() {
                return Err(PumpError::ComInit(format!("CoInitializeEx failed: {hr:?}")));
            }
        }
        Ok(Self)
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        unsafe {
            CoUninitialize();
        }
    }
}

/// Pairs MFStartup with MFShutdown.
struct MfGuard;

impl MfGuard {
    fn startup() -> Result<Self> {
        unsafe { MFStartup(MF_VERSION, MFSTARTUP_FULL) }
            .map_err(|e| PumpError::ComInit(format!("MFStartup failed: {e}")))?;
        Ok(Self)
    }
}

impl Drop for MfGuard {
    fn drop(&mut self) {
        if let Err(e) = unsafe { MFShutdown() } {
            warn!("MFShutdown failed: {e}");
        }
    }
}

/// CoTaskMem-allocated array of device activation objects.
struct ActivateList {
    ptr: *mut Option<IMFActivate>,
    count: u32,
}

impl ActivateList {
    /// Enumerate video capture devices.
    ///
    /// # Safety
    /// COM must be initialised on the calling thread.
    unsafe fn enumerate() -> Result<Self> {
        let mut attributes: Option<IMFAttributes> = None;
        MFCreateAttributes(&mut attributes, 1)
            .map_err(|e| PumpError::DeviceUnavailable(format!("MFCreateAttributes: {e}")))?;
        let attributes = attributes.ok_or_else(|| {
            PumpError::DeviceUnavailable("MFCreateAttributes returned nothing".to_string())
        })?;
        attributes
            .SetGUID(
                &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE,
                &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_GUID,
            )
            .map_err(|e| PumpError::DeviceUnavailable(format!("SetGUID: {e}")))?;

        let mut ptr = std::ptr::null_mut();
        let mut count = 0u32;
        MFEnumDeviceSources(&attributes, &mut ptr, &mut count)
            .map_err(|e| PumpError::DeviceUnavailable(format!("MFEnumDeviceSources: {e}")))?;
        Ok(Self { ptr, count })
    }

    fn iter(&self) -> impl Iterator<Item = (usize, &IMFActivate)> {
        let slots: &[Option<IMFActivate>] = if self.ptr.is_null() {
            &[]
        } else {
            // SAFETY: MFEnumDeviceSources filled `count` entries.
            unsafe { std::slice::from_raw_parts(self.ptr, self.count as usize) }
        };
        slots
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.as_ref().map(|a| (i, a)))
    }
}

impl Drop for ActivateList {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        unsafe {
            for i in 0..self.count as usize {
                std::ptr::drop_in_place(self.ptr.add(i));
            }
            CoTaskMemFree(Some(self.ptr as *const _));
        }
    }
}

fn get_string(activate: &IMFActivate, key: &GUID) -> Option<String> {
    let mut raw = PWSTR::null();
    let mut len = 0u32;
    unsafe {
        activate.GetAllocatedString(key, &mut raw, &mut len).ok()?;
        let value = String::from_utf16_lossy(std::slice::from_raw_parts(raw.0, len as usize));
        CoTaskMemFree(Some(raw.0 as *const _));
        Some(value)
    }
}

fn describe(index: usize, activate: &IMFActivate) -> DeviceDescriptor {
    DeviceDescriptor {
        index,
        display_name: get_string(activate, &MF_DEVSOURCE_ATTRIBUTE_FRIENDLY_NAME)
            .unwrap_or_else(|| format!("Video device {index}")),
        symbolic_link: get_string(
            activate,
            &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_SYMBOLIC_LINK,
        )
        .unwrap_or_default(),
    }
}

/// Media Foundation video capture device enumerator.
pub struct MediaFoundationEnumerator;

impl DeviceEnumerator for MediaFoundationEnumerator {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let _guard = ComGuard::init()?;
        let list = unsafe { ActivateList::enumerate()? };
        Ok(list.iter().map(|(i, a)| describe(i, a)).collect())
    }
}

/// Activates a device, builds its source reader and reads the native format.
#[derive(Default)]
struct SourceReaderNegotiator {
    reader: Option<IMFSourceReader>,
}

impl FormatNegotiator for SourceReaderNegotiator {
    fn negotiate_format(&mut self, device: &DeviceDescriptor) -> Result<NegotiatedFormat> {
        let list = unsafe { ActivateList::enumerate()? };
        // Prefer the symbolic link; enumeration order can change between calls.
        let activate = list
            .iter()
            .find(|(i, a)| {
                let link = get_string(a, &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_SYMBOLIC_LINK);
                match link {
                    Some(link) if !device.symbolic_link.is_empty() => link == device.symbolic_link,
                    _ => *i == device.index,
                }
            })
            .map(|(_, a)| a.clone())
            .ok_or_else(|| {
                PumpError::DeviceUnavailable(format!("'{}' disappeared", device.display_name))
            })?;

        let reader = unsafe { create_reader(&activate)? };
        let format = unsafe { read_current_format(&reader)? };
        self.reader = Some(reader);
        Ok(format)
    }
}

unsafe fn create_reader(activate: &IMFActivate) -> Result<IMFSourceReader> {
    let media_source = activate
        .ActivateObject::<IMFMediaSource>()
        .map_err(|e| PumpError::DeviceUnavailable(format!("ActivateObject: {e}")))?;

    let mut attributes: Option<IMFAttributes> = None;
    MFCreateAttributes(&mut attributes, 1)
        .map_err(|e| PumpError::DeviceUnavailable(format!("MFCreateAttributes: {e}")))?;
    let attributes = attributes.ok_or_else(|| {
        PumpError::DeviceUnavailable("MFCreateAttributes returned nothing".to_string())
    })?;
    // Media source shuts down on drop if this isn't specified
    attributes
        .SetUINT32(&MF_SOURCE_READER_DISCONNECT_MEDIASOURCE_ON_SHUTDOWN, 1)
        .map_err(|e| PumpError::DeviceUnavailable(format!("SetUINT32: {e}")))?;

    MFCreateSourceReaderFromMediaSource(&media_source, &attributes).map_err(|e| {
        PumpError::DeviceUnavailable(format!("MFCreateSourceReaderFromMediaSource: {e}"))
    })
}

/// Read and re-apply the reader's current media type. No format change is
/// requested; the device keeps its native format.
unsafe fn read_current_format(reader: &IMFSourceReader) -> Result<NegotiatedFormat> {
    let negotiation = |what: &str, e: windows::core::Error| {
        PumpError::CapabilityNegotiationFailed(format!("{what}: {e}"))
    };

    let stream = first_video_stream();
    let media_type = reader
        .GetCurrentMediaType(stream)
        .map_err(|e| negotiation("GetCurrentMediaType", e))?;

    let size = media_type
        .GetUINT64(&MF_MT_FRAME_SIZE)
        .map_err(|e| negotiation("MF_MT_FRAME_SIZE", e))?;
    let width = (size >> 32) as u32;
    let height = (size & 0xFFFF_FFFF) as u32;

    // Video subtype GUIDs carry the FourCC in their first field.
    let subtype = media_type
        .GetGUID(&MF_MT_SUBTYPE)
        .map_err(|e| negotiation("MF_MT_SUBTYPE", e))?;
    let pixel_format = PixelFormat::from_fourcc(subtype.data1);

    let frame_rate = media_type.GetUINT64(&MF_MT_FRAME_RATE).ok().and_then(|r| {
        let rate = FrameRate::new((r >> 32) as u32, r as u32);
        rate.interval().map(|_| rate)
    });

    reader
        .SetCurrentMediaType(stream, None, &media_type)
        .map_err(|e| negotiation("SetCurrentMediaType", e))?;
    reader
        .SetStreamSelection(stream, true)
        .map_err(|e| negotiation("SetStreamSelection", e))?;

    debug!("current media type: {width}x{height} {pixel_format} {frame_rate:?}");
    Ok(NegotiatedFormat {
        width,
        height,
        pixel_format,
        frame_rate,
    })
}

/// A media buffer locked for reading. Unlocks on drop.
enum LockedBuffer {
    Planar(IMF2DBuffer2),
    Linear(IMFMediaBuffer),
}

impl Drop for LockedBuffer {
    fn drop(&mut self) {
        let result = unsafe {
            match self {
                Self::Planar(b) => b.Unlock2D(),
                Self::Linear(b) => b.Unlock(),
            }
        };
        if let Err(e) = result {
            warn!("failed to unlock media buffer: {e}");
        }
    }
}

/// Lock `buffer`, returning the guard, first scanline, pitch and readable length.
unsafe fn lock_buffer(
    buffer: IMFMediaBuffer,
    width: u32,
) -> Result<(LockedBuffer, *const u8, usize, usize)> {
    let read_failure = |what: &str, e: windows::core::Error| {
        PumpError::FrameReadFailure(format!("{what}: {e}"))
    };

    if let Ok(planar) = buffer.cast::<IMF2DBuffer2>() {
        let mut scanline0 = std::ptr::null_mut();
        let mut pitch = 0i32;
        let mut start = std::ptr::null_mut();
        let mut length = 0u32;
        planar
            .Lock2DSize(
                MF2DBuffer_LockFlags_Read,
                &mut scanline0,
                &mut pitch,
                &mut start,
                &mut length,
            )
            .map_err(|e| read_failure("Lock2DSize", e))?;
        let guard = LockedBuffer::Planar(planar);

        if pitch < 0 {
            return Err(PumpError::FrameReadFailure(format!(
                "bottom-up buffer (pitch {pitch}) is not supported"
            )));
        }
        let offset = (scanline0 as usize).saturating_sub(start as usize);
        let readable = (length as usize).saturating_sub(offset);
        return Ok((guard, scanline0 as *const u8, pitch as usize, readable));
    }

    let mut data = std::ptr::null_mut();
    let mut current = 0u32;
    buffer
        .Lock(&mut data, None, Some(&mut current))
        .map_err(|e| read_failure("Lock", e))?;
    Ok((
        LockedBuffer::Linear(buffer),
        data as *const u8,
        width as usize * 2,
        current as usize,
    ))
}

/// Media Foundation capture device exposing a blocking pull of YUY2 frames.
///
/// The locked media buffer of the last frame stays locked until the next
/// pull, `release_frame`, or drop.
pub struct MediaFoundationSource {
    // Declaration order is drop order: unlock, release the reader, then
    // shut down MF and COM.
    locked: Option<LockedBuffer>,
    reader: IMFSourceReader,
    format: NegotiatedFormat,
    first_timestamp: Option<i64>,
    _mf: MfGuard,
    _com: ComGuard,
}

// SAFETY: COM is initialised multithreaded and the source reader is used
// from one thread at a time. The guards must still be dropped on the thread
// that created them, which `open_device` documents.
unsafe impl Send for MediaFoundationSource {}

impl MediaFoundationSource {
    /// Initialise COM and Media Foundation, pick a device and negotiate its format.
    pub fn open(requested: Option<usize>) -> Result<Self> {
        let com = ComGuard::init()?;
        let mf = MfGuard::startup()?;

        let mut negotiator = SourceReaderNegotiator::default();
        let (device, format) =
            device::initialize(&MediaFoundationEnumerator, &mut negotiator, requested)?;
        let reader = negotiator.reader.take().ok_or_else(|| {
            PumpError::CapabilityNegotiationFailed("no source reader was created".to_string())
        })?;

        info!(
            "capturing from '{}' at {}x{}",
            device.display_name, format.width, format.height
        );
        Ok(Self {
            locked: None,
            reader,
            format,
            first_timestamp: None,
            _mf: mf,
            _com: com,
        })
    }

    fn relative_timestamp(&mut self, raw: i64) -> Duration {
        let first = *self.first_timestamp.get_or_insert(raw);
        Duration::from_nanos((raw - first).max(0) as u64 * 100)
    }
}

impl CaptureSource for MediaFoundationSource {
    fn format(&self) -> NegotiatedFormat {
        self.format
    }

    fn next_frame(&mut self) -> Result<CaptureEvent<'_>> {
        self.locked = None;

        let mut flags = 0u32;
        let mut timestamp = 0i64;
        let mut sample = None;
        unsafe {
            self.reader.ReadSample(
                first_video_stream(),
                0,
                None,
                Some(&mut flags),
                Some(&mut timestamp),
                Some(&mut sample),
            )
        }
        .map_err(|e| PumpError::FrameReadFailure(format!("ReadSample: {e}")))?;

        if flags & MF_SOURCE_READERF_ENDOFSTREAM.0 as u32 != 0 {
            info!("end of stream");
            return Ok(CaptureEvent::EndOfStream);
        }
        let Some(sample) = sample else {
            if flags & MF_SOURCE_READERF_STREAMTICK.0 as u32 != 0 {
                debug!("stream tick without sample");
            }
            return Ok(CaptureEvent::NoSample);
        };

        let buffer = unsafe { sample.ConvertToContiguousBuffer() }
            .map_err(|e| PumpError::FrameReadFailure(format!("ConvertToContiguousBuffer: {e}")))?;
        let (guard, data, pitch, readable) = unsafe { lock_buffer(buffer, self.format.width)? };
        self.locked = Some(guard);

        let timestamp = self.relative_timestamp(timestamp);
        // SAFETY: the buffer stays locked until the next pull, release or drop,
        // all of which need `&mut self`, so the slice cannot outlive the lock.
        let data = unsafe { std::slice::from_raw_parts(data, readable) };

        Ok(CaptureEvent::Frame(CapturedFrame {
            data,
            pitch,
            width: self.format.width,
            height: self.format.height,
            pixel_format: self.format.pixel_format,
            timestamp,
        }))
    }

    fn release_frame(&mut self) {
        self.locked = None;
    }
}
