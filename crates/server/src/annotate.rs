//! Overlay drawing and JPEG packaging for the annotated frame.
//!
//! Label positions are derived from the frame geometry once at startup, so
//! the overlay scales with whatever resolution (or merged dual-camera width)
//! the rig produces.

use opencv::{
    core::{Mat, Point, Scalar, Size, Vector},
    imgcodecs, imgproc,
    prelude::*,
};

use crate::detect::TargetPair;

// BGR overlay colors
const CONTOUR_COLOR: (f64, f64, f64) = (255.0, 0.0, 0.0);
const TARGET_COLOR: (f64, f64, f64) = (0.0, 0.0, 255.0);
const STATS_COLOR: (f64, f64, f64) = (0.0, 0.0, 255.0);
const CROSSHAIR_COLOR: (f64, f64, f64) = (255.0, 255.0, 255.0);

fn scalar(color: (f64, f64, f64)) -> Scalar {
    Scalar::new(color.0, color.1, color.2, 0.0)
}

/// Frame geometry and the label anchor points derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub width: i32,
    pub height: i32,
    pub center_x: i32,
    pub center_y: i32,
    fps_label: (i32, i32),
    mspf_label: (i32, i32),
    offset_label: (i32, i32),
    distance_label: (i32, i32),
}

impl FrameLayout {
    pub fn new(width: i32, height: i32) -> Self {
        let at = |wx: f64, hy: f64| {
            (
                (wx * f64::from(width)) as i32,
                (hy * f64::from(height)) as i32,
            )
        };
        Self {
            width,
            height,
            center_x: width / 2,
            center_y: height / 2,
            fps_label: at(0.78, 0.91),
            mspf_label: at(0.78, 0.96),
            offset_label: at(0.08, 0.91),
            distance_label: at(0.08, 0.96),
        }
    }
}

/// Crosshair at the frame center: a circle plus ±100 px axis lines.
pub fn draw_center_crosshair(frame: &mut Mat, layout: &FrameLayout) -> opencv::Result<()> {
    let center = Point::new(layout.center_x, layout.center_y);
    imgproc::circle(
        frame,
        center,
        10,
        scalar(CROSSHAIR_COLOR),
        1,
        imgproc::LINE_8,
        0,
    )?;
    imgproc::line(
        frame,
        Point::new(layout.center_x - 100, layout.center_y),
        Point::new(layout.center_x + 100, layout.center_y),
        scalar(CROSSHAIR_COLOR),
        1,
        imgproc::LINE_8,
        0,
    )?;
    imgproc::line(
        frame,
        Point::new(layout.center_x, layout.center_y - 100),
        Point::new(layout.center_x, layout.center_y + 100),
        scalar(CROSSHAIR_COLOR),
        1,
        imgproc::LINE_8,
        0,
    )?;
    Ok(())
}

/// Border the accepted pair's contours, cross-hair the top band's center,
/// and print the offset and estimated distance.
pub fn draw_target_overlay(
    frame: &mut Mat,
    layout: &FrameLayout,
    contours: &Vector<Vector<Point>>,
    pair: &TargetPair,
    delta_x: i32,
    delta_y: i32,
    distance_inches: i32,
) -> opencv::Result<()> {
    for region in [&pair.top, &pair.bottom] {
        imgproc::draw_contours(
            frame,
            contours,
            region.contour_index as i32,
            scalar(CONTOUR_COLOR),
            3,
            imgproc::LINE_8,
            &opencv::core::no_array(),
            i32::MAX,
            Point::new(0, 0),
        )?;
    }

    let target_x = pair.top.bbox.center_x();
    let target_y = pair.top.bbox.center_y();
    imgproc::circle(
        frame,
        Point::new(target_x, target_y),
        10,
        scalar(TARGET_COLOR),
        1,
        imgproc::LINE_8,
        0,
    )?;
    imgproc::line(
        frame,
        Point::new(target_x - 10, target_y),
        Point::new(target_x + 10, target_y),
        scalar(TARGET_COLOR),
        1,
        imgproc::LINE_8,
        0,
    )?;
    imgproc::line(
        frame,
        Point::new(target_x, target_y - 10),
        Point::new(target_x, target_y + 10),
        scalar(TARGET_COLOR),
        1,
        imgproc::LINE_8,
        0,
    )?;

    put_label(
        frame,
        &format!("Offset: {delta_x},{delta_y}"),
        layout.offset_label,
        CROSSHAIR_COLOR,
    )?;
    put_label(
        frame,
        &format!("Est Dist (in): {distance_inches}"),
        layout.distance_label,
        CROSSHAIR_COLOR,
    )?;
    Ok(())
}

/// FPS and milliseconds-per-frame labels, drawn every cycle.
pub fn draw_stats_overlay(
    frame: &mut Mat,
    layout: &FrameLayout,
    fps: i64,
    frame_msec: i64,
) -> opencv::Result<()> {
    put_label(
        frame,
        &format!(" FPS: {fps}"),
        layout.fps_label,
        STATS_COLOR,
    )?;
    put_label(
        frame,
        &format!("msPF: {frame_msec}"),
        layout.mspf_label,
        STATS_COLOR,
    )?;
    Ok(())
}

fn put_label(
    frame: &mut Mat,
    text: &str,
    at: (i32, i32),
    color: (f64, f64, f64),
) -> opencv::Result<()> {
    imgproc::put_text(
        frame,
        text,
        Point::new(at.0, at.1),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.7,
        scalar(color),
        2,
        imgproc::LINE_AA,
        false,
    )
}

/// Resize to the streaming resolution when it differs from the capture size.
pub fn resize_for_stream(frame: &Mat, width: i32, height: i32) -> opencv::Result<Mat> {
    let size = frame.size()?;
    if size.width == width && size.height == height {
        return Ok(frame.clone());
    }
    let mut resized = Mat::default();
    imgproc::resize(
        frame,
        &mut resized,
        Size::new(width, height),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;
    Ok(resized)
}

/// JPEG-encode a frame for the store.
pub fn encode_jpeg(frame: &Mat) -> opencv::Result<Vec<u8>> {
    let mut buffer = Vector::<u8>::new();
    imgcodecs::imencode(".jpg", frame, &mut buffer, &Vector::new())?;
    Ok(buffer.to_vec())
}
