//! Typed configuration, deserialized from one JSON file at startup.
//!
//! Every section is validated before any thread or listener starts; a bad
//! config is fatal, never a degraded run. The network-facing sections carry
//! an `enabled` flag so individual collaborators can be switched off without
//! touching the rest of the file.

use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use vision_capture::CameraSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub cameras: CamerasConfig,
    pub color_bounds: ColorBounds,
    pub target_ratios: TargetRatios,
    pub distance_model: DistanceModel,
    #[serde(default)]
    pub data_server: DataServerConfig,
    #[serde(default)]
    pub robot_publisher: RobotPublisherConfig,
    #[serde(default)]
    pub stream_server: StreamServerConfig,
    #[serde(default)]
    pub status_led: StatusLedConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CamerasConfig {
    pub target_fps: u32,
    pub primary: CameraSection,
    #[serde(default)]
    pub secondary: Option<CameraSection>,
}

/// One camera's acquisition parameters. Optional image properties are only
/// pushed to the driver when present.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraSection {
    pub device_index: i32,
    pub frame_width: i32,
    pub frame_height: i32,
    #[serde(default)]
    pub brightness: Option<f64>,
    #[serde(default)]
    pub contrast: Option<f64>,
    #[serde(default)]
    pub saturation: Option<f64>,
    #[serde(default)]
    pub sharpness: Option<f64>,
    #[serde(default)]
    pub gain: Option<f64>,
    #[serde(default)]
    pub exposure: Option<f64>,
}

impl CameraSection {
    pub fn to_settings(&self) -> CameraSettings {
        CameraSettings {
            device_index: self.device_index,
            frame_width: self.frame_width,
            frame_height: self.frame_height,
            brightness: self.brightness,
            contrast: self.contrast,
            saturation: self.saturation,
            sharpness: self.sharpness,
            gain: self.gain,
            exposure: self.exposure,
        }
    }
}

/// HSV color in OpenCV ranges: H in [0, 180], S and V in [0, 255].
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct HsvColor {
    pub h: u8,
    pub s: u8,
    pub v: u8,
}

/// Inclusive HSV band used to build the binary mask.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ColorBounds {
    pub lower: HsvColor,
    pub upper: HsvColor,
}

/// Shape and pairing limits for candidate regions. All four comparisons are
/// inclusive on both ends.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct TargetRatios {
    pub h2w_ratio_min: f64,
    pub h2w_ratio_max: f64,
    pub area_ratio_min: f64,
    pub area_ratio_max: f64,
}

/// Cubic polynomial mapping target pixel row to distance in inches.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct DistanceModel {
    pub a3: f64,
    pub a2: f64,
    pub a1: f64,
    pub a0: f64,
}

/// Which reply layout the telemetry query server renders.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub enum MessageFormat {
    V1,
    #[default]
    V2,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataServerConfig {
    pub enabled: bool,
    pub tcp_port: u16,
    pub message_format: MessageFormat,
}

impl Default for DataServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tcp_port: 1111,
            message_format: MessageFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RobotPublisherConfig {
    pub enabled: bool,
    pub server_addr: String,
    pub tcp_port: u16,
}

impl Default for RobotPublisherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_addr: String::new(),
            tcp_port: 1735,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamServerConfig {
    pub enabled: bool,
    pub tcp_port: u16,
    pub image_width: i32,
    pub image_height: i32,
    pub push_interval_ms: u64,
}

impl Default for StreamServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tcp_port: 8080,
            image_width: 640,
            image_height: 480,
            push_interval_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusLedConfig {
    pub enabled: bool,
    pub on_target_threshold: i32,
    pub heartbeat_interval_ms: u64,
}

impl Default for StatusLedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            on_target_threshold: 10,
            heartbeat_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.target_fps == 0 {
            bail!("cameras.target_fps must be at least 1");
        }
        validate_camera("cameras.primary", &self.cameras.primary)?;
        if let Some(secondary) = &self.cameras.secondary {
            validate_camera("cameras.secondary", secondary)?;
        }
        if self.target_ratios.h2w_ratio_min > self.target_ratios.h2w_ratio_max {
            bail!("target_ratios: h2w_ratio_min exceeds h2w_ratio_max");
        }
        if self.target_ratios.area_ratio_min > self.target_ratios.area_ratio_max {
            bail!("target_ratios: area_ratio_min exceeds area_ratio_max");
        }
        if self.data_server.enabled && self.data_server.tcp_port == 0 {
            bail!("data_server: tcp_port must be non-zero when enabled");
        }
        if self.robot_publisher.enabled && self.robot_publisher.server_addr.is_empty() {
            bail!("robot_publisher: server_addr must be set when enabled");
        }
        if self.stream_server.enabled {
            if self.stream_server.tcp_port == 0 {
                bail!("stream_server: tcp_port must be non-zero when enabled");
            }
            if self.stream_server.image_width <= 0 || self.stream_server.image_height <= 0 {
                bail!("stream_server: image dimensions must be positive");
            }
            if self.stream_server.push_interval_ms == 0 {
                bail!("stream_server: push_interval_ms must be at least 1");
            }
        }
        if self.status_led.enabled && self.status_led.heartbeat_interval_ms == 0 {
            bail!("status_led: heartbeat_interval_ms must be at least 1");
        }
        Ok(())
    }
}

fn validate_camera(section: &str, camera: &CameraSection) -> Result<()> {
    if camera.frame_width <= 0 || camera.frame_height <= 0 {
        bail!("{section}: frame dimensions must be positive");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"{
        "cameras": {
            "target_fps": 20,
            "primary": { "device_index": 0, "frame_width": 640, "frame_height": 480, "exposure": -11.0 }
        },
        "color_bounds": {
            "lower": { "h": 60, "s": 100, "v": 60 },
            "upper": { "h": 90, "s": 255, "v": 255 }
        },
        "target_ratios": {
            "h2w_ratio_min": 2.0, "h2w_ratio_max": 6.0,
            "area_ratio_min": 3.0, "area_ratio_max": 5.0
        },
        "distance_model": { "a3": 0.0, "a2": 0.0, "a1": -0.5, "a0": 200.0 },
        "data_server": { "enabled": true, "tcp_port": 1111 },
        "stream_server": { "enabled": true, "tcp_port": 8080 }
    }"#;

    fn parse(text: &str) -> Config {
        serde_json::from_str(text).expect("parse")
    }

    #[test]
    fn parses_sample_config() {
        let config = parse(SAMPLE);
        config.validate().expect("valid");
        assert_eq!(config.cameras.target_fps, 20);
        assert_eq!(config.cameras.primary.exposure, Some(-11.0));
        assert!(config.cameras.secondary.is_none());
        assert_eq!(config.color_bounds.upper.s, 255);
        assert_eq!(config.data_server.tcp_port, 1111);
        // sections omitted entirely fall back to disabled defaults
        assert!(!config.robot_publisher.enabled);
        assert!(!config.status_led.enabled);
    }

    #[test]
    fn message_format_defaults_to_v2() {
        let config = parse(SAMPLE);
        assert_eq!(config.data_server.message_format, MessageFormat::V2);
    }

    #[test]
    fn rejects_zero_fps() {
        let mut config = parse(SAMPLE);
        config.cameras.target_fps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_ratio_band() {
        let mut config = parse(SAMPLE);
        config.target_ratios.area_ratio_min = 9.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_enabled_server_without_port() {
        let mut config = parse(SAMPLE);
        config.data_server.tcp_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(SAMPLE.as_bytes()).expect("write");
        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.cameras.primary.frame_width, 640);
    }

    #[test]
    fn load_fails_on_missing_file() {
        assert!(Config::load(Path::new("/nonexistent/vision.json")).is_err());
    }
}
