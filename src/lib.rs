//! Capture-to-network / capture-to-shared-texture frame pump.
//!
//! A [`CaptureSource`](capture::CaptureSource) delivers pitched YUY2 frames,
//! the converter normalises them into the sink's packed layout inside a
//! [`DoubleBufferedStage`](stage::DoubleBufferedStage), and a
//! [`PublishSink`](sink::PublishSink) hands them on without waiting.

pub mod capture;
pub mod config;
pub mod convert;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod pump;
pub mod sink;
pub mod stage;

pub use config::PumpConfig;
pub use error::{PumpError, Result};
pub use frame::{FrameDesc, FrameRate, PixelFormat};
pub use pump::{FramePump, PumpReport, PumpState, StopSignal};
