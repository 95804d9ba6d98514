//! `VideoSender` trait: abstracts a fire-and-forget video transmitter.
//!
//! `NetworkSink` drives any implementation: the built-in TCP fan-out, the
//! NDI runtime, or `MockSender` in tests.

use crate::stage::LentFrame;

/// A transmitter that accepts frames without waiting for them to go out.
///
/// Implementations keep the lent frame they were given until the next call,
/// then drop it. Passing `None` asks the transmitter to drop whatever it
/// still holds; the sink does this once before tearing the sender down.
/// Transmit failures happen off the caller's thread and are only logged.
pub trait VideoSender: Send {
    /// Name the sender advertises to receivers.
    fn name(&self) -> &str;

    /// Queue `frame` and return immediately.
    fn send_async(&mut self, frame: Option<LentFrame>);

    /// Stop any background work. Called once, after `send_async(None)`.
    fn close(&mut self) {}
}
