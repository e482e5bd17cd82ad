use anyhow::Error;
use thiserror::Error;

/// Acquisition parameters for one physical camera.
///
/// Resolution is always applied; the remaining properties are only pushed to
/// the driver when a value is present, leaving the device defaults otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub device_index: i32,
    pub frame_width: i32,
    pub frame_height: i32,
    pub brightness: Option<f64>,
    pub contrast: Option<f64>,
    pub saturation: Option<f64>,
    pub sharpness: Option<f64>,
    pub gain: Option<f64>,
    pub exposure: Option<f64>,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open camera device {index}")]
    Open { index: i32 },
    #[error("camera device {index} returned an empty frame")]
    EmptyFrame { index: i32 },
    #[error(transparent)]
    Other(#[from] Error),
}
