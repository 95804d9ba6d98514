// Publish sinks: where converted frames go.

#[cfg(target_os = "windows")]
pub mod d3d11;
pub mod fanout;
pub mod gpu;
pub mod mock;
#[cfg(feature = "ndi")]
pub mod ndi;
pub mod network;
pub mod sender;
pub mod texture;

pub use network::{NetworkSink, Transport, DEFAULT_BIND, DEFAULT_SENDER_NAME};
pub use texture::{SharedTextureHandle, SharedTextureSink};

use crate::error::Result;
use crate::frame::{FrameRate, PixelFormat};
use crate::stage::LentFrame;

/// Destination for converted frames. Closed set: one variant per output.
pub enum PublishSink {
    Network(NetworkSink),
    SharedTexture(SharedTextureSink),
}

impl PublishSink {
    /// Packed layout this sink consumes.
    pub fn layout(&self) -> PixelFormat {
        match self {
            Self::Network(s) => s.layout(),
            Self::SharedTexture(s) => s.layout(),
        }
    }

    /// Frame rate the sink advertises, if it advertises one.
    pub fn frame_rate(&self) -> Option<FrameRate> {
        match self {
            Self::Network(s) => Some(s.frame_rate()),
            Self::SharedTexture(_) => None,
        }
    }

    pub fn publish(&mut self, frame: LentFrame) -> Result<()> {
        match self {
            Self::Network(s) => s.publish(frame),
            Self::SharedTexture(s) => s.publish(frame),
        }
    }

    /// Release everything still in flight. Safe to call more than once.
    pub fn shutdown(&mut self) {
        match self {
            Self::Network(s) => s.shutdown(),
            Self::SharedTexture(s) => s.shutdown(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::SharedTexture(_) => "sharedTexture",
        }
    }
}

impl From<NetworkSink> for PublishSink {
    fn from(sink: NetworkSink) -> Self {
        Self::Network(sink)
    }
}

impl From<SharedTextureSink> for PublishSink {
    fn from(sink: SharedTextureSink) -> Self {
        Self::SharedTexture(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::mock::{MockGpu, MockSender};

    #[test]
    fn layouts_per_variant() {
        let network: PublishSink =
            NetworkSink::with_sender(Box::new(MockSender::new("cam")), FrameRate::SIXTY).into();
        assert_eq!(network.layout(), PixelFormat::Uyvy);
        assert_eq!(network.frame_rate(), Some(FrameRate::SIXTY));
        assert_eq!(network.kind(), "network");

        let texture: PublishSink =
            SharedTextureSink::configure(Box::new(MockGpu::new()), 4, 2, PixelFormat::Yuy2)
                .unwrap()
                .into();
        assert_eq!(texture.layout(), PixelFormat::Yuy2);
        assert_eq!(texture.frame_rate(), None);
    }
}
