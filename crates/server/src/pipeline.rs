//! The periodic frame-acquisition / target-detection cycle.
//!
//! One timer drives one logical writer. Every cycle reads a frame, builds the
//! HSV mask, extracts candidate regions, runs the detector, draws the
//! overlay, JPEG-encodes the result, and publishes snapshot + frame into the
//! shared store. A failed cycle still publishes: the snapshot goes out with
//! sentinel geometry and an incremented counter so consumers can tell "no
//! target" from "no vision server".

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use opencv::{
    core::{self, Mat, Point, Scalar, Vector},
    imgproc,
    prelude::*,
};
use tracing::{info, warn};
use vision_capture::CameraRig;

use crate::{
    annotate::{self, FrameLayout},
    config::{ColorBounds, Config},
    data::{AnnotatedFrame, CycleStats, SharedStore, TargetGeometry, TargetSnapshot},
    detect::{self, BoundingBox, Region},
    host::HostMonitor,
    publisher::RobotPublisher,
    smoothing::MovingAverage,
};

const FPS_WINDOW_SIZE: usize = 10;
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Timer period for a target frame rate: `floor(1000 / fps)` milliseconds.
pub(crate) fn cycle_period(target_fps: u32) -> Duration {
    Duration::from_millis(u64::from((1000 / target_fps.max(1)).max(1)))
}

/// Run the pipeline until the shutdown flag flips. Blocks the calling thread.
pub fn run(
    config: &Config,
    mut rig: CameraRig,
    layout: FrameLayout,
    store: SharedStore,
    publisher: Option<Arc<RobotPublisher>>,
    running: &AtomicBool,
) -> Result<()> {
    let period = cycle_period(config.cameras.target_fps);
    // a tick channel holds at most one pending tick, so a cycle that
    // overruns the period drops the missed ticks instead of stacking
    // overlapping cycles on the capture device
    let ticker = crossbeam_channel::tick(period);

    let mut fps_average = MovingAverage::new(FPS_WINDOW_SIZE);
    let mut host = HostMonitor::new();
    let mut frame_counter: u64 = 0;
    let mut last_cycle_start = Instant::now();

    info!(
        "pipeline running: {} FPS target, {:?} period, {}x{} frame",
        config.cameras.target_fps, period, layout.width, layout.height
    );

    while running.load(Ordering::Relaxed) {
        if ticker.recv_timeout(SHUTDOWN_POLL_INTERVAL).is_err() {
            continue;
        }

        let cycle_start = Instant::now();
        let elapsed_ms = cycle_start.duration_since(last_cycle_start).as_millis() as i64;
        last_cycle_start = cycle_start;
        if elapsed_ms > 0 {
            // smooth rates, not periods: the published figure is the moving
            // average of per-cycle instantaneous frames-per-second
            fps_average.add_sample(1000 / elapsed_ms);
        }
        metrics::gauge!("vision_pipeline_fps").set(fps_average.current() as f64);

        let host_metrics = host.sample();
        frame_counter += 1;

        let outcome = run_cycle(
            &mut rig,
            &layout,
            config,
            frame_counter,
            fps_average.current(),
            cycle_start,
        );

        let stats = CycleStats {
            fps: fps_average.current() as i32,
            frame_counter,
            frame_msec: cycle_start.elapsed().as_millis() as i64,
            battery_pct: host_metrics.battery_pct,
            cpu_pct: host_metrics.cpu_pct,
        };

        let (snapshot, frame) = match outcome {
            Ok(output) => {
                let snapshot = match output.geometry {
                    Some(geometry) => TargetSnapshot::sighted(geometry, stats),
                    None => TargetSnapshot::missed(stats),
                };
                (snapshot, Some(output.frame))
            }
            Err(err) => {
                warn!("cycle {frame_counter} failed: {err:#}");
                metrics::counter!("vision_cycle_errors_total").increment(1);
                (TargetSnapshot::missed(stats), None)
            }
        };

        store.publish(snapshot.clone(), frame);
        if let Some(publisher) = publisher.as_ref() {
            publisher.publish(&snapshot);
        }
        metrics::histogram!("vision_cycle_seconds").record(cycle_start.elapsed().as_secs_f64());
    }

    info!("pipeline stopped");
    Ok(())
}

struct CycleOutput {
    geometry: Option<TargetGeometry>,
    frame: AnnotatedFrame,
}

fn run_cycle(
    rig: &mut CameraRig,
    layout: &FrameLayout,
    config: &Config,
    frame_number: u64,
    fps: i64,
    cycle_start: Instant,
) -> Result<CycleOutput> {
    let mut frame = rig.read_frame().context("frame read failed")?;

    let mask = build_mask(&frame, &config.color_bounds).context("thresholding failed")?;
    let (contours, regions) = extract_regions(&mask).context("contour extraction failed")?;

    annotate::draw_center_crosshair(&mut frame, layout)
        .context("overlay drawing failed")?;

    let pair = detect::select_target_pair(&regions, &config.target_ratios);
    let geometry = match pair {
        Some(pair) => {
            let geometry = target_geometry(&pair, layout, config);
            annotate::draw_target_overlay(
                &mut frame,
                layout,
                &contours,
                &pair,
                geometry.delta_x,
                geometry.delta_y,
                geometry.distance_inches,
            )
            .context("target overlay failed")?;
            Some(geometry)
        }
        None => None,
    };

    annotate::draw_stats_overlay(
        &mut frame,
        layout,
        fps,
        cycle_start.elapsed().as_millis() as i64,
    )
    .context("stats overlay failed")?;

    let stream_frame = if config.stream_server.enabled {
        annotate::resize_for_stream(
            &frame,
            config.stream_server.image_width,
            config.stream_server.image_height,
        )
        .context("stream resize failed")?
    } else {
        frame
    };
    let jpeg = annotate::encode_jpeg(&stream_frame).context("JPEG encode failed")?;
    let size = stream_frame
        .size()
        .map_err(anyhow::Error::from)
        .context("frame size unavailable")?;

    Ok(CycleOutput {
        geometry,
        frame: AnnotatedFrame {
            jpeg,
            width: size.width,
            height: size.height,
            frame_number,
        },
    })
}

/// Threshold the BGR frame against the configured HSV band.
pub(crate) fn build_mask(frame: &Mat, bounds: &ColorBounds) -> opencv::Result<Mat> {
    let mut hsv = Mat::default();
    imgproc::cvt_color(frame, &mut hsv, imgproc::COLOR_BGR2HSV, 0)?;

    let lower = Scalar::new(
        f64::from(bounds.lower.h),
        f64::from(bounds.lower.s),
        f64::from(bounds.lower.v),
        0.0,
    );
    let upper = Scalar::new(
        f64::from(bounds.upper.h),
        f64::from(bounds.upper.s),
        f64::from(bounds.upper.v),
        0.0,
    );

    let mut mask = Mat::default();
    core::in_range(&hsv, &lower, &upper, &mut mask)?;
    Ok(mask)
}

/// Extract external contours and describe each as a candidate region.
pub(crate) fn extract_regions(
    mask: &Mat,
) -> opencv::Result<(Vector<Vector<Point>>, Vec<Region>)> {
    let mut contours: Vector<Vector<Point>> = Vector::new();
    imgproc::find_contours(
        mask,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_SIMPLE,
        Point::new(0, 0),
    )?;

    let mut regions = Vec::with_capacity(contours.len());
    for (index, contour) in contours.iter().enumerate() {
        let area = imgproc::contour_area(&contour, false)?;
        let rect = imgproc::bounding_rect(&contour)?;
        regions.push(Region {
            contour_index: index,
            bbox: BoundingBox {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
            },
            area,
        });
    }
    Ok((contours, regions))
}

/// Derive the published geometry from an accepted pair.
fn target_geometry(
    pair: &detect::TargetPair,
    layout: &FrameLayout,
    config: &Config,
) -> TargetGeometry {
    let bbox = pair.top.bbox;
    let target_x = bbox.center_x();
    let target_y = bbox.center_y();
    TargetGeometry {
        sw_x: bbox.x,
        sw_y: bbox.y,
        se_x: bbox.right(),
        se_y: bbox.bottom(),
        high_mid_y: target_y,
        delta_x: target_x - layout.center_x,
        delta_y: layout.center_y - target_y,
        distance_inches: detect::estimate_distance_inches(target_y, &config.distance_model),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use opencv::core::{Rect, CV_8UC3};

    use super::*;
    use crate::config::{HsvColor, TargetRatios};

    #[test]
    fn period_is_floor_of_millis_per_frame() {
        assert_eq!(cycle_period(20), Duration::from_millis(50));
        assert_eq!(cycle_period(30), Duration::from_millis(33));
        assert_eq!(cycle_period(1), Duration::from_millis(1000));
        // degenerate rates still yield a positive period
        assert_eq!(cycle_period(0), Duration::from_millis(1000));
        assert_eq!(cycle_period(2000), Duration::from_millis(1));
    }

    #[test]
    fn overrunning_cycles_skip_ticks_instead_of_stacking() {
        let ticker = crossbeam_channel::tick(Duration::from_millis(10));
        // simulate a cycle that overruns by several periods
        thread::sleep(Duration::from_millis(55));
        assert!(ticker.try_recv().is_ok());
        // only one tick was pending; the missed ones are gone
        assert!(ticker.try_recv().is_err());
    }

    fn green_scene() -> Mat {
        let mut frame =
            Mat::new_rows_cols_with_default(480, 640, CV_8UC3, Scalar::all(0.0)).expect("mat");
        let green = Scalar::new(0.0, 255.0, 0.0, 0.0);
        // top band 20x60, bottom band 10x30: both pass h2w in [2,6] and the
        // pair's area ratio lands inside [3,5]
        imgproc::rectangle(
            &mut frame,
            Rect::new(100, 100, 20, 60),
            green,
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .expect("rect");
        imgproc::rectangle(
            &mut frame,
            Rect::new(105, 170, 10, 30),
            green,
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .expect("rect");
        frame
    }

    fn green_bounds() -> ColorBounds {
        ColorBounds {
            lower: HsvColor { h: 50, s: 100, v: 100 },
            upper: HsvColor {
                h: 70,
                s: 255,
                v: 255,
            },
        }
    }

    #[test]
    fn mask_and_contours_find_synthetic_bands() {
        let frame = green_scene();
        let mask = build_mask(&frame, &green_bounds()).expect("mask");
        let (contours, regions) = extract_regions(&mask).expect("regions");
        assert_eq!(contours.len(), 2);
        assert_eq!(regions.len(), 2);

        let ratios = TargetRatios {
            h2w_ratio_min: 2.0,
            h2w_ratio_max: 6.0,
            area_ratio_min: 3.0,
            area_ratio_max: 5.0,
        };
        let pair = detect::select_target_pair(&regions, &ratios).expect("pair");
        assert!(pair.top.area > pair.bottom.area);
        assert_eq!(pair.top.bbox.width, 20);
        assert_eq!(pair.bottom.bbox.width, 10);
    }

    #[test]
    fn empty_mask_yields_no_candidates() {
        let frame =
            Mat::new_rows_cols_with_default(480, 640, CV_8UC3, Scalar::all(0.0)).expect("mat");
        let mask = build_mask(&frame, &green_bounds()).expect("mask");
        let (_, regions) = extract_regions(&mask).expect("regions");
        assert!(regions.is_empty());
    }
}
