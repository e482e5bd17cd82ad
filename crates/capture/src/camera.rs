//! Camera rig open/configure/read.

use opencv::{
    core::{self, Mat},
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::debug;

use crate::types::{CameraSettings, CaptureError};

/// One opened capture device together with the index it was opened from.
struct Camera {
    capture: VideoCapture,
    index: i32,
}

/// One or two exclusively-owned capture devices.
///
/// The rig is not shared between threads; the pipeline owns it and reads one
/// frame per cycle.
pub struct CameraRig {
    primary: Camera,
    secondary: Option<Camera>,
}

impl CameraRig {
    /// Open and configure the device(s). Fails fast if a device cannot be
    /// opened, before any server or pipeline thread starts.
    pub fn open(
        primary: &CameraSettings,
        secondary: Option<&CameraSettings>,
    ) -> Result<Self, CaptureError> {
        let primary = open_camera(primary)?;
        let secondary = match secondary {
            Some(settings) => Some(open_camera(settings)?),
            None => None,
        };
        Ok(Self { primary, secondary })
    }

    /// Read one frame, merging a dual rig side by side.
    pub fn read_frame(&mut self) -> Result<Mat, CaptureError> {
        let left = read_camera(&mut self.primary)?;
        match self.secondary.as_mut() {
            Some(camera) => {
                let right = read_camera(camera)?;
                let mut merged = Mat::default();
                core::hconcat2(&left, &right, &mut merged)
                    .map_err(|e| CaptureError::Other(e.into()))?;
                Ok(merged)
            }
            None => Ok(left),
        }
    }
}

fn open_camera(settings: &CameraSettings) -> Result<Camera, CaptureError> {
    let mut capture = VideoCapture::new(settings.device_index, videoio::CAP_ANY)
        .map_err(|e| CaptureError::Other(e.into()))?;
    if !capture
        .is_opened()
        .map_err(|e| CaptureError::Other(e.into()))?
    {
        return Err(CaptureError::Open {
            index: settings.device_index,
        });
    }

    apply_settings(&mut capture, settings)?;

    let actual_w = capture
        .get(videoio::CAP_PROP_FRAME_WIDTH)
        .unwrap_or_default();
    let actual_h = capture
        .get(videoio::CAP_PROP_FRAME_HEIGHT)
        .unwrap_or_default();
    debug!(
        "camera {} opened at {}x{} (requested {}x{})",
        settings.device_index, actual_w, actual_h, settings.frame_width, settings.frame_height
    );

    Ok(Camera {
        capture,
        index: settings.device_index,
    })
}

/// Push resolution and any configured image properties to the driver.
fn apply_settings(capture: &mut VideoCapture, settings: &CameraSettings) -> Result<(), CaptureError> {
    let mut set = |prop: i32, value: f64| -> Result<(), CaptureError> {
        capture
            .set(prop, value)
            .map(|_| ())
            .map_err(|e| CaptureError::Other(e.into()))
    };

    set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(settings.frame_width))?;
    set(
        videoio::CAP_PROP_FRAME_HEIGHT,
        f64::from(settings.frame_height),
    )?;

    if let Some(value) = settings.brightness {
        set(videoio::CAP_PROP_BRIGHTNESS, value)?;
    }
    if let Some(value) = settings.contrast {
        set(videoio::CAP_PROP_CONTRAST, value)?;
    }
    if let Some(value) = settings.saturation {
        set(videoio::CAP_PROP_SATURATION, value)?;
    }
    if let Some(value) = settings.sharpness {
        set(videoio::CAP_PROP_SHARPNESS, value)?;
    }
    if let Some(value) = settings.gain {
        set(videoio::CAP_PROP_GAIN, value)?;
    }
    if let Some(value) = settings.exposure {
        set(videoio::CAP_PROP_EXPOSURE, value)?;
    }

    Ok(())
}

fn read_camera(camera: &mut Camera) -> Result<Mat, CaptureError> {
    let mut frame = Mat::default();
    let grabbed = camera
        .capture
        .read(&mut frame)
        .map_err(|e| CaptureError::Other(e.into()))?;
    let size = frame.size().map_err(|e| CaptureError::Other(e.into()))?;
    if !grabbed || size.width <= 0 {
        return Err(CaptureError::EmptyFrame {
            index: camera.index,
        });
    }
    Ok(frame)
}
