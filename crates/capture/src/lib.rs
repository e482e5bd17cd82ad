//! OpenCV-backed camera acquisition for the vision server.
//!
//! A [`CameraRig`] owns one or two `VideoCapture` devices. Dual rigs are read
//! in lockstep and merged side by side so the rest of the pipeline only ever
//! sees a single frame.

pub use camera::CameraRig;
pub use types::{CameraSettings, CaptureError};

mod camera;
mod types;
