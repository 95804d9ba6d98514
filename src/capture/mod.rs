// Capture domain: device discovery, format negotiation, and frame pulls.

pub mod device;
pub mod platform;
pub mod source;
pub mod synthetic;

pub use device::{DeviceDescriptor, DeviceEnumerator, FormatNegotiator, NegotiatedFormat};
pub use source::{CaptureEvent, CaptureSource, CapturedFrame};
pub use synthetic::SyntheticSource;
