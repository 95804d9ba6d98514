use serde::Serialize;
use tracing::info;

use crate::error::{PumpError, Result};
use crate::frame::{FrameRate, PixelFormat};

/// A capture device as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Position in the platform's enumeration order.
    pub index: usize,
    pub display_name: String,
    /// Platform identifier (symbolic link on Windows).
    pub symbolic_link: String,
}

/// Format agreed with the device. Fixed for the lifetime of the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_rate: Option<FrameRate>,
}

impl NegotiatedFormat {
    /// Check that the pump can convert this format.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(PumpError::CapabilityNegotiationFailed(format!(
                "device reported an empty frame size {}x{}",
                self.width, self.height
            )));
        }
        if self.pixel_format != PixelFormat::Yuy2 {
            return Err(PumpError::CapabilityNegotiationFailed(format!(
                "native format {} is not packed YUY2",
                self.pixel_format
            )));
        }
        if self.width % 2 != 0 {
            return Err(PumpError::CapabilityNegotiationFailed(format!(
                "width {} is not a whole number of macropixels",
                self.width
            )));
        }
        Ok(())
    }
}

/// Lists capture devices. Wraps platform enumeration for unit-testability.
pub trait DeviceEnumerator: Send + Sync {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>>;
}

/// Queries the native format of a device.
pub trait FormatNegotiator {
    fn negotiate_format(&mut self, device: &DeviceDescriptor) -> Result<NegotiatedFormat>;
}

/// Pick the device with the lowest enumeration index.
pub fn select_first(devices: &[DeviceDescriptor]) -> Option<&DeviceDescriptor> {
    devices.iter().min_by_key(|d| d.index)
}

/// Pick the requested device, or the lowest-index one when none is requested.
pub fn select_device(
    devices: &[DeviceDescriptor],
    requested: Option<usize>,
) -> Result<&DeviceDescriptor> {
    let selected = match requested {
        Some(index) => devices.iter().find(|d| d.index == index),
        None => select_first(devices),
    };
    selected.ok_or_else(|| match requested {
        Some(index) => PumpError::DeviceUnavailable(format!(
            "no capture device at index {index} ({} available)",
            devices.len()
        )),
        None => PumpError::DeviceUnavailable("no capture devices found".to_string()),
    })
}

/// Enumerate, select and negotiate in one step.
///
/// Fails with `DeviceUnavailable` when nothing matches the request and with
/// `CapabilityNegotiationFailed` when the device's native format cannot be
/// pumped.
pub fn initialize<N: FormatNegotiator + ?Sized>(
    enumerator: &dyn DeviceEnumerator,
    negotiator: &mut N,
    requested: Option<usize>,
) -> Result<(DeviceDescriptor, NegotiatedFormat)> {
    let devices = enumerator.list_devices()?;
    for d in &devices {
        info!("device {}: {}", d.index, d.display_name);
    }

    let device = select_device(&devices, requested)?.clone();
    let format = negotiator.negotiate_format(&device)?;
    format.validate()?;

    info!(
        "selected '{}': {}x{} {}",
        device.display_name, format.width, format.height, format.pixel_format
    );
    Ok((device, format))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::fourcc;

    fn device(index: usize, name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            index,
            display_name: name.to_string(),
            symbolic_link: format!(r"\\?\usb#vid_046d&pid_085e#{index}"),
        }
    }

    fn yuy2(width: u32, height: u32) -> NegotiatedFormat {
        NegotiatedFormat {
            width,
            height,
            pixel_format: PixelFormat::Yuy2,
            frame_rate: Some(FrameRate::new(30, 1)),
        }
    }

    #[test]
    fn select_first_picks_lowest_index() {
        let devices = vec![device(2, "C"), device(0, "A"), device(1, "B")];
        assert_eq!(select_first(&devices).unwrap().display_name, "A");
    }

    #[test]
    fn select_first_on_empty_list_is_none() {
        assert!(select_first(&[]).is_none());
    }

    #[test]
    fn select_device_honours_requested_index() {
        let devices = vec![device(0, "A"), device(1, "B")];
        assert_eq!(
            select_device(&devices, Some(1)).unwrap().display_name,
            "B"
        );
    }

    #[test]
    fn select_device_without_request_falls_back_to_first() {
        let devices = vec![device(1, "B"), device(0, "A")];
        assert_eq!(select_device(&devices, None).unwrap().index, 0);
    }

    #[test]
    fn select_device_missing_index_is_unavailable() {
        let devices = vec![device(0, "A")];
        assert!(matches!(
            select_device(&devices, Some(3)),
            Err(PumpError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn select_device_with_no_devices_is_unavailable() {
        assert!(matches!(
            select_device(&[], None),
            Err(PumpError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn validate_accepts_even_width_yuy2() {
        assert!(yuy2(1280, 720).validate().is_ok());
    }

    #[test]
    fn validate_rejects_other_formats() {
        let mut fmt = yuy2(640, 480);
        fmt.pixel_format = PixelFormat::Other(fourcc(b"MJPG"));
        assert!(matches!(
            fmt.validate(),
            Err(PumpError::CapabilityNegotiationFailed(_))
        ));
    }

    #[test]
    fn validate_rejects_odd_width_and_empty_size() {
        assert!(yuy2(641, 480).validate().is_err());
        assert!(yuy2(0, 480).validate().is_err());
    }

    struct MockEnumerator {
        devices: Vec<DeviceDescriptor>,
    }

    impl DeviceEnumerator for MockEnumerator {
        fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
            Ok(self.devices.clone())
        }
    }

    struct MockNegotiator {
        format: Result<NegotiatedFormat>,
        asked: Vec<usize>,
    }

    impl FormatNegotiator for MockNegotiator {
        fn negotiate_format(&mut self, device: &DeviceDescriptor) -> Result<NegotiatedFormat> {
            self.asked.push(device.index);
            self.format.clone()
        }
    }

    #[test]
    fn initialize_negotiates_the_selected_device() {
        let enumerator = MockEnumerator {
            devices: vec![device(1, "B"), device(0, "A")],
        };
        let mut negotiator = MockNegotiator {
            format: Ok(yuy2(1280, 720)),
            asked: vec![],
        };

        let (dev, fmt) = initialize(&enumerator, &mut negotiator, None).unwrap();
        assert_eq!(dev.display_name, "A");
        assert_eq!(fmt.width, 1280);
        assert_eq!(negotiator.asked, vec![0]);
    }

    #[test]
    fn initialize_without_devices_never_negotiates() {
        let enumerator = MockEnumerator { devices: vec![] };
        let mut negotiator = MockNegotiator {
            format: Ok(yuy2(640, 480)),
            asked: vec![],
        };

        let err = initialize(&enumerator, &mut negotiator, None).unwrap_err();
        assert!(matches!(err, PumpError::DeviceUnavailable(_)));
        assert!(negotiator.asked.is_empty());
    }

    #[test]
    fn initialize_propagates_negotiation_failure() {
        let enumerator = MockEnumerator {
            devices: vec![device(0, "A")],
        };
        let mut negotiator = MockNegotiator {
            format: Err(PumpError::CapabilityNegotiationFailed(
                "GetCurrentMediaType failed".to_string(),
            )),
            asked: vec![],
        };

        let err = initialize(&enumerator, &mut negotiator, Some(0)).unwrap_err();
        assert!(matches!(err, PumpError::CapabilityNegotiationFailed(_)));
    }

    #[test]
    fn initialize_rejects_unpumpable_format() {
        let enumerator = MockEnumerator {
            devices: vec![device(0, "A")],
        };
        let mut fmt = yuy2(640, 480);
        fmt.pixel_format = PixelFormat::Other(fourcc(b"NV12"));
        let mut negotiator = MockNegotiator {
            format: Ok(fmt),
            asked: vec![],
        };

        let err = initialize(&enumerator, &mut negotiator, None).unwrap_err();
        assert!(matches!(err, PumpError::CapabilityNegotiationFailed(_)));
    }

    #[test]
    fn descriptor_serialises_to_camelcase() {
        let json = serde_json::to_value(device(0, "Logitech BRIO")).unwrap();
        assert_eq!(json["displayName"], "Logitech BRIO");
        assert!(json["symbolicLink"].is_string());
    }
}
