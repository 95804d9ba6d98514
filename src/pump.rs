//! The frame pump: pull, convert, stage, publish, repeat.
//!
//! Runs on the caller's thread. The only place it blocks is the capture
//! pull (and the stage's release wait when `HandoffPolicy::AwaitRelease` is
//! chosen). Any failure ends the run; nothing is retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::capture::{CaptureEvent, CaptureSource, NegotiatedFormat};
use crate::convert::convert_into;
use crate::diagnostics::{DiagnosticSnapshot, DiagnosticStats};
use crate::error::{PumpError, Result};
use crate::frame::{FrameDesc, FrameRate, PixelFormat};
use crate::sink::PublishSink;
use crate::stage::{DoubleBufferedStage, HandoffPolicy};

/// Lifecycle of a pump. Everything but `Running` is terminal once left `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PumpState {
    Idle,
    Running,
    /// The source reported end of stream.
    Draining,
    /// A fatal error ended the run.
    Stopped,
    /// The stop signal was raised.
    Cancelled,
}

/// Shared flag that asks a running pump to finish after the current frame.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Outcome of a run that ended without error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpReport {
    pub state: PumpState,
    pub frames_published: u64,
    pub diagnostics: DiagnosticSnapshot,
}

/// Moves frames from a capture source to a publish sink.
pub struct FramePump {
    // Field order is drop order: the sink lets go of its lent frame before
    // the scratch buffers are released.
    sink: PublishSink,
    stage: DoubleBufferedStage,
    source: Box<dyn CaptureSource>,
    format: NegotiatedFormat,
    frame_rate: FrameRate,
    state: PumpState,
    stop: StopSignal,
    stats: DiagnosticStats,
    sequence: u64,
}

impl FramePump {
    /// Allocate scratch buffers for the source's negotiated resolution.
    pub fn new(
        source: Box<dyn CaptureSource>,
        sink: PublishSink,
        policy: HandoffPolicy,
    ) -> Result<Self> {
        let format = source.format();
        format.validate()?;
        let stage = DoubleBufferedStage::allocate(format.width, format.height)?.with_policy(policy);
        let frame_rate = sink
            .frame_rate()
            .or(format.frame_rate)
            .unwrap_or_default();

        let mut stats = DiagnosticStats::new();
        stats.set_sink(Some(sink.kind().to_string()));

        Ok(Self {
            sink,
            stage,
            source,
            format,
            frame_rate,
            state: PumpState::Idle,
            stop: StopSignal::new(),
            stats,
            sequence: 0,
        })
    }

    /// Use an externally owned stop signal.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn format(&self) -> NegotiatedFormat {
        self.format
    }

    pub fn diagnostics(&self) -> DiagnosticSnapshot {
        self.stats.snapshot()
    }

    /// Run until end of stream, cancellation, or the first failure.
    ///
    /// The sink is shut down before this returns, whatever the outcome.
    pub fn run(&mut self) -> Result<PumpReport> {
        if self.state != PumpState::Idle {
            return Err(PumpError::Config(format!(
                "pump already ran (state {:?})",
                self.state
            )));
        }

        info!(
            "pump running: {}x{} -> {} ({}), {:.2} fps",
            self.format.width,
            self.format.height,
            self.sink.kind(),
            self.sink.layout(),
            self.frame_rate.as_f64()
        );
        self.state = PumpState::Running;

        let outcome = self.pump_frames();
        self.source.release_frame();
        self.sink.shutdown();
        self.stats.set_overlaps(self.stage.overlaps());
        if let Ok(json) = serde_json::to_string(&self.stats.snapshot()) {
            info!("diagnostics: {json}");
        }

        match outcome {
            Ok(state) => {
                self.state = state;
                let report = PumpReport {
                    state,
                    frames_published: self.sequence,
                    diagnostics: self.stats.snapshot(),
                };
                info!("pump finished ({state:?}) after {} frames", self.sequence);
                Ok(report)
            }
            Err(e) => {
                self.state = PumpState::Stopped;
                error!("pump stopped after {} frames: {e}", self.sequence);
                Err(e)
            }
        }
    }

    fn pump_frames(&mut self) -> Result<PumpState> {
        let layout = self.sink.layout();
        let width = self.format.width;
        let height = self.format.height;

        loop {
            if self.stop.is_raised() {
                info!("stop requested");
                return Ok(PumpState::Cancelled);
            }

            let frame = match self.source.next_frame()? {
                CaptureEvent::Frame(frame) => frame,
                CaptureEvent::NoSample => {
                    self.stats.record_skip();
                    continue;
                }
                CaptureEvent::EndOfStream => return Ok(PumpState::Draining),
            };
            let pulled = Instant::now();

            if frame.width != width || frame.height != height {
                return Err(PumpError::FrameReadFailure(format!(
                    "frame is {}x{}, negotiated {width}x{height}",
                    frame.width, frame.height
                )));
            }
            if frame.pixel_format != PixelFormat::Yuy2 {
                return Err(PumpError::FrameReadFailure(format!(
                    "frame format {} is not YUY2",
                    frame.pixel_format
                )));
            }

            let (parity, target) = self.stage.next_target();
            convert_into(layout, frame.data, frame.pitch, width, height, target)?;
            let timestamp = frame.timestamp;
            let pitch = frame.pitch;
            self.source.release_frame();

            self.sequence += 1;
            let desc = FrameDesc {
                width,
                height,
                stride_bytes: width * 2,
                frame_rate: self.frame_rate,
                pixel_format: layout,
                timestamp,
                sequence: self.sequence,
            };
            let lent = self.stage.lend(parity, desc);
            let bytes = lent.len();
            self.sink.publish(lent)?;

            self.stats.record_frame(bytes, pulled.elapsed());
            if self.sequence <= 3 {
                debug!(
                    "frame {}: pitch {pitch}, buffer {parity}, {bytes} bytes",
                    self.sequence
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticSource;
    use crate::convert::convert_to_vec;
    use crate::sink::mock::{MockGpu, MockSender};
    use crate::sink::{NetworkSink, SharedTextureSink};
    use crate::stage::Parity;

    fn network_sink() -> (
        PublishSink,
        Arc<parking_lot::Mutex<crate::sink::mock::MockSenderState>>,
    ) {
        let sender = MockSender::new("test");
        let state = sender.state();
        (
            NetworkSink::with_sender(Box::new(sender), FrameRate::SIXTY).into(),
            state,
        )
    }

    /// Wraps a source and raises the stop signal after `after` frames.
    struct StopAfter {
        inner: SyntheticSource,
        stop: StopSignal,
        after: u64,
    }

    impl CaptureSource for StopAfter {
        fn format(&self) -> NegotiatedFormat {
            self.inner.format()
        }

        fn next_frame(&mut self) -> Result<CaptureEvent<'_>> {
            if self.inner.produced() + 1 >= self.after {
                self.stop.raise();
            }
            self.inner.next_frame()
        }
    }

    #[test]
    fn end_of_stream_at_fifth_pull_publishes_four_frames() {
        let source = SyntheticSource::new(8, 4).unwrap().with_frame_limit(4);
        let (sink, state) = network_sink();
        let mut pump = FramePump::new(Box::new(source), sink, HandoffPolicy::Timed).unwrap();

        let report = pump.run().unwrap();
        assert_eq!(report.state, PumpState::Draining);
        assert_eq!(report.frames_published, 4);
        assert_eq!(pump.state(), PumpState::Draining);

        let state = state.lock();
        assert_eq!(state.frames.len(), 4);
        assert_eq!(state.flushes, 1);
        assert!(state.closed);
        assert!(!state.holding);
    }

    #[test]
    fn read_failure_on_third_pull_stops_after_two_publishes() {
        let source = SyntheticSource::new(8, 4).unwrap().with_failure_at(3);
        let (sink, state) = network_sink();
        let mut pump = FramePump::new(Box::new(source), sink, HandoffPolicy::Timed).unwrap();

        let err = pump.run().unwrap_err();
        assert!(matches!(err, PumpError::FrameReadFailure(_)));
        assert_eq!(pump.state(), PumpState::Stopped);

        let state = state.lock();
        assert_eq!(state.frames.len(), 2);
        assert!(state.frames.iter().all(|f| f.desc.sequence <= 2));
        assert!(state.closed);
    }

    #[test]
    fn published_frames_are_converted_uyvy_in_alternating_buffers() {
        let source = SyntheticSource::new(8, 4)
            .unwrap()
            .with_row_padding(24)
            .with_frame_limit(4);
        let (sink, state) = network_sink();
        let mut pump = FramePump::new(Box::new(source), sink, HandoffPolicy::Timed).unwrap();
        pump.run().unwrap();

        let mut reference = SyntheticSource::new(8, 4).unwrap().with_row_padding(24);
        let expected = match reference.next_frame().unwrap() {
            CaptureEvent::Frame(f) => {
                convert_to_vec(PixelFormat::Uyvy, f.data, f.pitch, f.width, f.height).unwrap()
            }
            other => panic!("expected a frame, got {other:?}"),
        };

        let state = state.lock();
        assert_eq!(state.frames[0].bytes, expected);
        let parities: Vec<Parity> = state.frames.iter().map(|f| f.parity).collect();
        assert_eq!(
            parities,
            vec![Parity::Even, Parity::Odd, Parity::Even, Parity::Odd]
        );
        let sequences: Vec<u64> = state.frames.iter().map(|f| f.desc.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        let desc = state.frames[0].desc;
        assert_eq!(desc.pixel_format, PixelFormat::Uyvy);
        assert_eq!(desc.stride_bytes, 16);
        assert_eq!(desc.frame_rate, FrameRate::new(60_000, 1_000));
    }

    #[test]
    fn empty_pulls_are_skipped() {
        let source = SyntheticSource::new(4, 2)
            .unwrap()
            .with_empty_pull_at(2)
            .with_frame_limit(3);
        let (sink, state) = network_sink();
        let mut pump = FramePump::new(Box::new(source), sink, HandoffPolicy::Timed).unwrap();

        let report = pump.run().unwrap();
        assert_eq!(report.frames_published, 3);
        assert_eq!(report.diagnostics.skipped_samples, 1);
        assert_eq!(state.lock().frames.len(), 3);
    }

    #[test]
    fn raised_stop_signal_cancels_before_first_pull() {
        let source = SyntheticSource::new(4, 2).unwrap();
        let (sink, state) = network_sink();
        let stop = StopSignal::new();
        let mut pump = FramePump::new(Box::new(source), sink, HandoffPolicy::Timed)
            .unwrap()
            .with_stop_signal(stop.clone());
        stop.raise();

        let report = pump.run().unwrap();
        assert_eq!(report.state, PumpState::Cancelled);
        assert_eq!(report.frames_published, 0);
        assert!(state.lock().closed);
    }

    #[test]
    fn stop_signal_raised_mid_run_finishes_current_frame() {
        let stop = StopSignal::new();
        let source = StopAfter {
            inner: SyntheticSource::new(4, 2).unwrap(),
            stop: stop.clone(),
            after: 3,
        };
        let (sink, state) = network_sink();
        let mut pump = FramePump::new(Box::new(source), sink, HandoffPolicy::Timed)
            .unwrap()
            .with_stop_signal(stop);

        let report = pump.run().unwrap();
        assert_eq!(report.state, PumpState::Cancelled);
        assert_eq!(report.frames_published, 3);
        assert_eq!(state.lock().frames.len(), 3);
    }

    #[test]
    fn staging_map_failure_stops_the_pump() {
        let gpu = MockGpu::new().with_error(
            "map_staging",
            PumpError::PublishFailure("Map failed".to_string()),
        );
        let sink =
            SharedTextureSink::configure(Box::new(gpu), 4, 2, PixelFormat::Yuy2).unwrap();
        let source = SyntheticSource::new(4, 2).unwrap().with_frame_limit(5);
        let mut pump = FramePump::new(Box::new(source), sink.into(), HandoffPolicy::Timed).unwrap();

        assert!(matches!(pump.run(), Err(PumpError::PublishFailure(_))));
        assert_eq!(pump.state(), PumpState::Stopped);
    }

    #[test]
    fn shared_texture_receives_padding_free_yuy2() {
        let gpu = MockGpu::new().with_pitch_alignment(32);
        let gpu_state = gpu.state();
        let sink = SharedTextureSink::configure(Box::new(gpu), 6, 2, PixelFormat::Yuy2).unwrap();
        let source = SyntheticSource::new(6, 2)
            .unwrap()
            .with_row_padding(10)
            .with_frame_limit(1);
        let mut pump = FramePump::new(Box::new(source), sink.into(), HandoffPolicy::Timed).unwrap();
        pump.run().unwrap();

        let mut reference = SyntheticSource::new(6, 2).unwrap().with_row_padding(10);
        let expected = match reference.next_frame().unwrap() {
            CaptureEvent::Frame(f) => {
                convert_to_vec(PixelFormat::Yuy2, f.data, f.pitch, f.width, f.height).unwrap()
            }
            other => panic!("expected a frame, got {other:?}"),
        };
        let gpu_state = gpu_state.lock();
        assert_eq!(gpu_state.shared_packed(), expected);
        assert_eq!(gpu_state.flushes, 1);
    }

    #[test]
    fn await_release_policy_runs_without_overlaps() {
        let source = SyntheticSource::new(4, 2).unwrap().with_frame_limit(6);
        let (sink, _) = network_sink();
        let policy = HandoffPolicy::AwaitRelease {
            timeout: std::time::Duration::from_millis(100),
        };
        let mut pump = FramePump::new(Box::new(source), sink, policy).unwrap();
        let report = pump.run().unwrap();
        assert_eq!(report.frames_published, 6);
        assert_eq!(report.diagnostics.buffer_overlaps, 0);
    }

    #[test]
    fn pump_runs_only_once() {
        let source = SyntheticSource::new(4, 2).unwrap().with_frame_limit(1);
        let (sink, _) = network_sink();
        let mut pump = FramePump::new(Box::new(source), sink, HandoffPolicy::Timed).unwrap();
        pump.run().unwrap();
        assert!(matches!(pump.run(), Err(PumpError::Config(_))));
    }

    #[test]
    fn report_serialises_to_camelcase() {
        let source = SyntheticSource::new(4, 2).unwrap().with_frame_limit(2);
        let (sink, _) = network_sink();
        let mut pump = FramePump::new(Box::new(source), sink, HandoffPolicy::Timed).unwrap();
        let json = serde_json::to_value(pump.run().unwrap()).unwrap();
        assert_eq!(json["state"], "draining");
        assert_eq!(json["framesPublished"], 2);
        assert_eq!(json["diagnostics"]["sink"], "network");
    }
}
