use thiserror::Error;

/// Frame pump errors.
///
/// Every fatal condition in the pump surfaces as one of these variants.
/// End of stream is not an error and never appears here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PumpError {
    #[error("no capture device available: {0}")]
    DeviceUnavailable(String),

    #[error("capability negotiation failed: {0}")]
    CapabilityNegotiationFailed(String),

    #[error("frame read failed: {0}")]
    FrameReadFailure(String),

    #[error("sink configuration failed: {0}")]
    SinkConfigurationFailure(String),

    #[error("publish failed: {0}")]
    PublishFailure(String),

    #[error("COM initialisation failed: {0}")]
    ComInit(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, PumpError>;
