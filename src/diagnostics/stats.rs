use serde::Serialize;
use std::time::{Duration, Instant};

/// Collects diagnostic statistics for one pump run.
pub struct DiagnosticStats {
    frame_count: u64,
    skipped_samples: u64,
    total_bytes: u64,
    start_time: Instant,
    latency: Duration,
    max_latency: Duration,
    overlaps: u64,
    sink: Option<String>,
}

/// Snapshot of diagnostic stats, serialisable for logs and reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticSnapshot {
    pub fps: f64,
    pub frame_count: u64,
    pub skipped_samples: u64,
    pub skip_rate: f64,
    pub latency_ms: f64,
    pub max_latency_ms: f64,
    pub bandwidth_bps: u64,
    pub buffer_overlaps: u64,
    pub sink: Option<String>,
}

impl DiagnosticStats {
    /// Create new stats with zeroed counters.
    pub fn new() -> Self {
        Self {
            frame_count: 0,
            skipped_samples: 0,
            total_bytes: 0,
            start_time: Instant::now(),
            latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            overlaps: 0,
            sink: None,
        }
    }

    /// Label the sink frames are published to.
    pub fn set_sink(&mut self, sink: Option<String>) {
        self.sink = sink;
    }

    /// Record a published frame.
    ///
    /// `latency` is the time from the pull returning to the publish returning.
    pub fn record_frame(&mut self, bytes: usize, latency: Duration) {
        self.frame_count += 1;
        self.total_bytes += bytes as u64;
        self.latency = latency;
        self.max_latency = self.max_latency.max(latency);
    }

    /// Record a pull that returned no sample.
    pub fn record_skip(&mut self) {
        self.skipped_samples += 1;
    }

    /// Update the scratch-buffer overlap count reported by the stage.
    pub fn set_overlaps(&mut self, overlaps: u64) {
        self.overlaps = overlaps;
    }

    /// Calculate current FPS based on elapsed time.
    pub fn fps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        self.frame_count as f64 / elapsed
    }

    /// Skipped pulls as a percentage of all pulls (0.0 - 100.0).
    pub fn skip_rate(&self) -> f64 {
        let total = self.frame_count + self.skipped_samples;
        if total == 0 {
            return 0.0;
        }
        (self.skipped_samples as f64 / total as f64) * 100.0
    }

    /// Latest pull-to-publish latency in milliseconds.
    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }

    /// Bandwidth in bytes per second.
    pub fn bandwidth_bps(&self) -> u64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0;
        }
        (self.total_bytes as f64 / elapsed) as u64
    }

    /// Take a serialisable snapshot.
    pub fn snapshot(&self) -> DiagnosticSnapshot {
        DiagnosticSnapshot {
            fps: self.fps(),
            frame_count: self.frame_count,
            skipped_samples: self.skipped_samples,
            skip_rate: self.skip_rate(),
            latency_ms: self.latency_ms(),
            max_latency_ms: self.max_latency.as_secs_f64() * 1000.0,
            bandwidth_bps: self.bandwidth_bps(),
            buffer_overlaps: self.overlaps,
            sink: self.sink.clone(),
        }
    }
}

impl Default for DiagnosticStats {
    fn default() -> Self {
        Self::new()
    }
}
