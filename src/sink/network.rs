use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PumpError, Result};
use crate::frame::{FrameRate, PixelFormat};
use crate::sink::fanout::TcpFanoutSender;
use crate::sink::sender::VideoSender;
use crate::stage::LentFrame;

/// Default name advertised to receivers.
pub const DEFAULT_SENDER_NAME: &str = "webcam_to_ndi";

/// Fan-out listen address used when none is configured.
pub const DEFAULT_BIND: &str = "127.0.0.1:5960";

/// How frames leave the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Transport {
    /// Built-in fan-out to TCP clients connecting to `bind`.
    TcpFanout { bind: String },
    /// The NDI runtime. Needs the `ndi` feature.
    Ndi,
}

impl Default for Transport {
    fn default() -> Self {
        Self::TcpFanout {
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Publishes packed UYVY frames to a network transmitter.
///
/// The transmitter keeps each lent frame until the following publish.
/// `shutdown` (or drop) flushes it so no frame outlives the sink.
pub struct NetworkSink {
    sender: Box<dyn VideoSender>,
    frame_rate: FrameRate,
    published: u64,
    shut_down: bool,
}

impl NetworkSink {
    /// Create the sender for `transport` once.
    pub fn configure(
        sender_name: &str,
        transport: &Transport,
        frame_rate: FrameRate,
    ) -> Result<Self> {
        if sender_name.is_empty() {
            return Err(PumpError::SinkConfigurationFailure(
                "sender name must not be empty".to_string(),
            ));
        }
        if frame_rate.interval().is_none() {
            return Err(PumpError::SinkConfigurationFailure(format!(
                "invalid frame rate {}/{}",
                frame_rate.numerator, frame_rate.denominator
            )));
        }

        let sender: Box<dyn VideoSender> = match transport {
            Transport::TcpFanout { bind } => Box::new(TcpFanoutSender::bind(sender_name, bind)?),
            Transport::Ndi => ndi_sender(sender_name)?,
        };
        Ok(Self::with_sender(sender, frame_rate))
    }

    /// Wrap an existing sender.
    pub fn with_sender(sender: Box<dyn VideoSender>, frame_rate: FrameRate) -> Self {
        info!(
            "network sink '{}' at {}/{} fps",
            sender.name(),
            frame_rate.numerator,
            frame_rate.denominator
        );
        Self {
            sender,
            frame_rate,
            published: 0,
            shut_down: false,
        }
    }

    pub fn layout(&self) -> PixelFormat {
        PixelFormat::Uyvy
    }

    pub fn frame_rate(&self) -> FrameRate {
        self.frame_rate
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    /// Hand `frame` to the transmitter and return immediately.
    pub fn publish(&mut self, frame: LentFrame) -> Result<()> {
        if self.shut_down {
            return Err(PumpError::PublishFailure("network sink is shut down".to_string()));
        }
        let desc = frame.desc();
        if desc.pixel_format != PixelFormat::Uyvy || desc.stride_bytes != desc.width * 2 {
            return Err(PumpError::PublishFailure(format!(
                "expected packed UYVY, got {} with stride {}",
                desc.pixel_format, desc.stride_bytes
            )));
        }

        self.published += 1;
        if self.published <= 3 {
            debug!(
                "network frame {}: {}x{} seq {} parity {}",
                self.published,
                desc.width,
                desc.height,
                desc.sequence,
                frame.parity()
            );
        }
        self.sender.send_async(Some(frame));
        Ok(())
    }

    /// Release the in-flight frame and stop the transmitter. Safe to call
    /// more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.sender.send_async(None);
        self.sender.close();
        info!(
            "network sink '{}' closed after {} frames",
            self.sender.name(),
            self.published
        );
    }
}

impl Drop for NetworkSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(feature = "ndi")]
fn ndi_sender(name: &str) -> Result<Box<dyn VideoSender>> {
    Ok(Box::new(crate::sink::ndi::NdiSender::new(name)?))
}

#[cfg(not(feature = "ndi"))]
fn ndi_sender(_name: &str) -> Result<Box<dyn VideoSender>> {
    Err(PumpError::SinkConfigurationFailure(
        "built without NDI support; enable the `ndi` feature".to_string(),
    ))
}
