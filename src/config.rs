use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capture::{CaptureSource, NegotiatedFormat, SyntheticSource};
use crate::error::{PumpError, Result};
use crate::frame::{FrameRate, PixelFormat};
use crate::sink::{NetworkSink, PublishSink, SharedTextureSink, Transport, DEFAULT_SENDER_NAME};
use crate::stage::HandoffPolicy;

/// Top-level pump configuration, stored as camelCase JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PumpConfig {
    /// Enumeration index of the capture device. `None` picks the first.
    pub device_index: Option<usize>,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub handoff: HandoffConfig,
}

/// Where frames come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SourceConfig {
    /// The platform capture device.
    #[default]
    Device,
    /// Generated gradient, paced to `fps`.
    Synthetic {
        #[serde(default = "default_synthetic_width")]
        width: u32,
        #[serde(default = "default_synthetic_height")]
        height: u32,
        #[serde(default)]
        row_padding: usize,
        #[serde(default)]
        frame_limit: Option<u64>,
        #[serde(default = "default_fps")]
        fps: u32,
    },
}

/// Where frames go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SinkConfig {
    Network {
        #[serde(default = "default_sender_name")]
        sender_name: String,
        #[serde(default)]
        transport: Transport,
        #[serde(default = "default_rate_num")]
        frame_rate_num: u32,
        #[serde(default = "default_rate_den")]
        frame_rate_den: u32,
    },
    SharedTexture {
        #[serde(default = "default_texture_layout")]
        layout: PixelFormat,
    },
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self::Network {
            sender_name: default_sender_name(),
            transport: Transport::default(),
            frame_rate_num: default_rate_num(),
            frame_rate_den: default_rate_den(),
        }
    }
}

/// Mirror of [`HandoffPolicy`] with the timeout in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HandoffConfig {
    #[default]
    Timed,
    AwaitRelease { timeout_ms: u64 },
}

fn default_synthetic_width() -> u32 {
    1280
}

fn default_synthetic_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    60
}

fn default_sender_name() -> String {
    DEFAULT_SENDER_NAME.to_string()
}

fn default_rate_num() -> u32 {
    FrameRate::SIXTY.numerator
}

fn default_rate_den() -> u32 {
    FrameRate::SIXTY.denominator
}

fn default_texture_layout() -> PixelFormat {
    PixelFormat::Yuy2
}

impl PumpConfig {
    /// Load a config from a JSON file, returning default on missing file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PumpError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| PumpError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Save to disk atomically (write .tmp then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| PumpError::Config(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PumpError::Config(e.to_string()))?;
        }

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| PumpError::Config(e.to_string()))?;
        std::fs::rename(&tmp_path, path).map_err(|e| PumpError::Config(e.to_string()))?;
        Ok(())
    }

    /// Swap a device source for the synthetic one when `SYNTHETIC_CAMERA` is set.
    pub fn with_env_overrides(self) -> Self {
        self.with_synthetic_override(SyntheticSource::is_enabled())
    }

    fn with_synthetic_override(mut self, enabled: bool) -> Self {
        if enabled && self.source == SourceConfig::Device {
            info!("SYNTHETIC_CAMERA set, using the synthetic source");
            self.source = SourceConfig::Synthetic {
                width: default_synthetic_width(),
                height: default_synthetic_height(),
                row_padding: 0,
                frame_limit: None,
                fps: default_fps(),
            };
        }
        self
    }

    pub fn handoff_policy(&self) -> HandoffPolicy {
        match self.handoff {
            HandoffConfig::Timed => HandoffPolicy::Timed,
            HandoffConfig::AwaitRelease { timeout_ms } => HandoffPolicy::AwaitRelease {
                timeout: Duration::from_millis(timeout_ms),
            },
        }
    }

    /// Open the configured capture source.
    pub fn open_source(&self) -> Result<Box<dyn CaptureSource>> {
        match &self.source {
            SourceConfig::Device => crate::capture::platform::open_device(self.device_index),
            SourceConfig::Synthetic {
                width,
                height,
                row_padding,
                frame_limit,
                fps,
            } => {
                let mut source = SyntheticSource::new(*width, *height)?
                    .with_row_padding(*row_padding)
                    .with_frame_rate(FrameRate::new(fps.saturating_mul(1000), 1000))
                    .paced(true);
                if let Some(limit) = frame_limit {
                    source = source.with_frame_limit(*limit);
                }
                Ok(Box::new(source))
            }
        }
    }

    /// Configure the sink for a source negotiated at `format`.
    pub fn build_sink(&self, format: &NegotiatedFormat) -> Result<PublishSink> {
        match &self.sink {
            SinkConfig::Network {
                sender_name,
                transport,
                frame_rate_num,
                frame_rate_den,
            } => {
                let rate = FrameRate::new(*frame_rate_num, *frame_rate_den);
                Ok(NetworkSink::configure(sender_name, transport, rate)?.into())
            }
            SinkConfig::SharedTexture { layout } => {
                let gpu = default_gpu()?;
                Ok(SharedTextureSink::configure(gpu, format.width, format.height, *layout)?.into())
            }
        }
    }
}

#[cfg(target_os = "windows")]
fn default_gpu() -> Result<Box<dyn crate::sink::gpu::GpuApi>> {
    Ok(Box::new(crate::sink::d3d11::D3d11Gpu::new()?))
}

#[cfg(not(target_os = "windows"))]
fn default_gpu() -> Result<Box<dyn crate::sink::gpu::GpuApi>> {
    Err(PumpError::SinkConfigurationFailure(
        "shared textures need Direct3D 11 (Windows only)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_returns_default_when_file_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nonexistent.json");
        let config = PumpConfig::load(&path).unwrap();
        assert_eq!(config, PumpConfig::default());
    }

    #[test]
    fn defaults_publish_uyvy_at_sixty_over_tcp() {
        let config = PumpConfig::default();
        assert_eq!(config.device_index, None);
        assert_eq!(config.source, SourceConfig::Device);
        assert_eq!(config.handoff_policy(), HandoffPolicy::Timed);
        match config.sink {
            SinkConfig::Network {
                sender_name,
                transport,
                frame_rate_num,
                frame_rate_den,
            } => {
                assert_eq!(sender_name, "webcam_to_ndi");
                assert_eq!(transport, Transport::default());
                assert_eq!((frame_rate_num, frame_rate_den), (60_000, 1_000));
            }
            other => panic!("unexpected default sink {other:?}"),
        }
    }

    #[test]
    fn load_parses_partial_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pump.json");
        let json = r#"{
            "deviceIndex": 2,
            "source": {"kind": "synthetic", "width": 640, "height": 480, "rowPadding": 64},
            "sink": {"kind": "network", "transport": {"kind": "ndi"}},
            "handoff": {"kind": "awaitRelease", "timeoutMs": 25}
        }"#;
        std::fs::write(&path, json).unwrap();

        let config = PumpConfig::load(&path).unwrap();
        assert_eq!(config.device_index, Some(2));
        assert_eq!(
            config.source,
            SourceConfig::Synthetic {
                width: 640,
                height: 480,
                row_padding: 64,
                frame_limit: None,
                fps: 60,
            }
        );
        assert!(matches!(
            config.sink,
            SinkConfig::Network {
                transport: Transport::Ndi,
                frame_rate_num: 60_000,
                ..
            }
        ));
        assert_eq!(
            config.handoff_policy(),
            HandoffPolicy::AwaitRelease {
                timeout: Duration::from_millis(25)
            }
        );
    }

    #[test]
    fn load_parses_shared_texture_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pump.json");
        std::fs::write(&path, r#"{"sink": {"kind": "sharedTexture", "layout": "uyvy"}}"#).unwrap();
        let config = PumpConfig::load(&path).unwrap();
        assert_eq!(
            config.sink,
            SinkConfig::SharedTexture {
                layout: PixelFormat::Uyvy
            }
        );
    }

    #[test]
    fn load_returns_error_for_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pump.json");
        std::fs::write(&path, "not valid json!!!").unwrap();
        assert!(matches!(PumpConfig::load(&path), Err(PumpError::Config(_))));
    }

    #[test]
    fn save_then_load_preserves_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("pump.json");
        let config = PumpConfig {
            device_index: Some(1),
            source: SourceConfig::Device,
            sink: SinkConfig::SharedTexture {
                layout: PixelFormat::Yuy2,
            },
            handoff: HandoffConfig::AwaitRelease { timeout_ms: 40 },
        };
        config.save(&path).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(PumpConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn saved_json_is_camelcase() {
        let json = serde_json::to_value(PumpConfig::default()).unwrap();
        assert_eq!(json["sink"]["kind"], "network");
        assert_eq!(json["sink"]["senderName"], "webcam_to_ndi");
        assert_eq!(json["sink"]["transport"]["kind"], "tcpFanout");
        assert_eq!(json["handoff"]["kind"], "timed");
    }

    #[test]
    fn synthetic_override_replaces_device_only() {
        let forced = PumpConfig::default().with_synthetic_override(true);
        assert!(matches!(forced.source, SourceConfig::Synthetic { width: 1280, .. }));

        let untouched = PumpConfig::default().with_synthetic_override(false);
        assert_eq!(untouched.source, SourceConfig::Device);

        let custom = PumpConfig {
            source: SourceConfig::Synthetic {
                width: 8,
                height: 2,
                row_padding: 0,
                frame_limit: Some(1),
                fps: 30,
            },
            ..PumpConfig::default()
        };
        assert_eq!(custom.clone().with_synthetic_override(true), custom);
    }

    #[test]
    fn open_source_builds_synthetic_with_padding() {
        let config = PumpConfig {
            source: SourceConfig::Synthetic {
                width: 8,
                height: 2,
                row_padding: 16,
                frame_limit: Some(1),
                fps: 30,
            },
            ..PumpConfig::default()
        };
        let source = config.open_source().unwrap();
        let format = source.format();
        assert_eq!((format.width, format.height), (8, 2));
        assert_eq!(format.frame_rate, Some(FrameRate::new(30_000, 1_000)));
    }

    #[test]
    fn open_source_rejects_odd_synthetic_width() {
        let config = PumpConfig {
            source: SourceConfig::Synthetic {
                width: 7,
                height: 2,
                row_padding: 0,
                frame_limit: None,
                fps: 60,
            },
            ..PumpConfig::default()
        };
        assert!(config.open_source().is_err());
    }

    #[test]
    fn build_sink_binds_tcp_fanout() {
        let config = PumpConfig {
            sink: SinkConfig::Network {
                sender_name: "test".to_string(),
                transport: Transport::TcpFanout {
                    bind: "127.0.0.1:0".to_string(),
                },
                frame_rate_num: 30_000,
                frame_rate_den: 1_001,
            },
            ..PumpConfig::default()
        };
        let format = NegotiatedFormat {
            width: 8,
            height: 2,
            pixel_format: PixelFormat::Yuy2,
            frame_rate: None,
        };
        let mut sink = config.build_sink(&format).unwrap();
        assert_eq!(sink.kind(), "network");
        assert_eq!(sink.frame_rate(), Some(FrameRate::new(30_000, 1_001)));
        sink.shutdown();
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn shared_texture_sink_needs_windows() {
        let config = PumpConfig {
            sink: SinkConfig::SharedTexture {
                layout: PixelFormat::Yuy2,
            },
            ..PumpConfig::default()
        };
        let format = NegotiatedFormat {
            width: 8,
            height: 2,
            pixel_format: PixelFormat::Yuy2,
            frame_rate: None,
        };
        assert!(matches!(
            config.build_sink(&format),
            Err(PumpError::SinkConfigurationFailure(_))
        ));
    }
}
