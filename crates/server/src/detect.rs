//! Target detection over the candidate regions of a single frame.
//!
//! The physical target is two retro-reflective bands: a wide top strip and a
//! narrower bottom strip. A first pass filters candidates by the
//! height-to-width ratio of their bounding box; a second pass walks the
//! survivors largest-first and accepts the first pair whose area ratio falls
//! inside the configured band. Both passes are deterministic for a given
//! mask, which keeps results reproducible across runs and in tests.

use std::cmp::Ordering;

use crate::config::{DistanceModel, TargetRatios};

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn center_x(&self) -> i32 {
        self.x + self.width / 2
    }

    pub fn center_y(&self) -> i32 {
        self.y + self.height / 2
    }
}

/// One connected component found in the frame, valid for this frame only.
///
/// `contour_index` points back into the frame's contour list so the overlay
/// can draw the accepted pair; regions carry no cross-frame identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub contour_index: usize,
    pub bbox: BoundingBox,
    pub area: f64,
}

/// The accepted top/bottom band pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetPair {
    pub top: Region,
    pub bottom: Region,
}

/// Pick the top/bottom band pair out of this frame's candidate regions.
///
/// Candidates failing the height-to-width filter are discarded outright. The
/// survivors are sorted by area, largest first (stable, so equal areas keep
/// discovery order), and scanned outer-to-inner: the first pair whose
/// `top.area / bottom.area` lies within the configured band wins. Both ratio
/// comparisons are inclusive on both ends.
pub fn select_target_pair(regions: &[Region], ratios: &TargetRatios) -> Option<TargetPair> {
    let mut candidates: Vec<&Region> = regions
        .iter()
        .filter(|region| {
            if region.bbox.width <= 0 {
                return false;
            }
            let h2w = f64::from(region.bbox.height) / f64::from(region.bbox.width);
            h2w >= ratios.h2w_ratio_min && h2w <= ratios.h2w_ratio_max
        })
        .collect();

    candidates.sort_by(|a, b| b.area.partial_cmp(&a.area).unwrap_or(Ordering::Equal));

    for (index, top) in candidates.iter().enumerate() {
        for bottom in &candidates[index + 1..] {
            if bottom.area <= 0.0 {
                continue;
            }
            let area_ratio = top.area / bottom.area;
            if area_ratio >= ratios.area_ratio_min && area_ratio <= ratios.area_ratio_max {
                return Some(TargetPair {
                    top: **top,
                    bottom: **bottom,
                });
            }
        }
    }

    None
}

/// Estimate the distance to the target in whole inches from the pixel row of
/// the top band's center.
///
/// The cast truncates toward zero rather than rounding; existing calibration
/// coefficient sets depend on that.
pub fn estimate_distance_inches(high_mid_y: i32, model: &DistanceModel) -> i32 {
    let y = f64::from(high_mid_y);
    let inches = model.a3 * y.powi(3) + model.a2 * y.powi(2) + model.a1 * y + model.a0;
    inches as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ratios(h2w: (f64, f64), area: (f64, f64)) -> TargetRatios {
        TargetRatios {
            h2w_ratio_min: h2w.0,
            h2w_ratio_max: h2w.1,
            area_ratio_min: area.0,
            area_ratio_max: area.1,
        }
    }

    fn region(index: usize, width: i32, height: i32, area: f64) -> Region {
        Region {
            contour_index: index,
            bbox: BoundingBox {
                x: 0,
                y: 0,
                width,
                height,
            },
            area,
        }
    }

    #[test]
    fn no_candidates_yields_none() {
        let limits = ratios((2.0, 6.0), (3.0, 5.0));
        assert_eq!(select_target_pair(&[], &limits), None);
    }

    #[test]
    fn shape_filter_discards_everything() {
        let limits = ratios((2.0, 6.0), (3.0, 5.0));
        // squat boxes, h2w below the minimum
        let regions = [region(0, 100, 10, 4000.0), region(1, 80, 10, 1000.0)];
        assert_eq!(select_target_pair(&regions, &limits), None);
    }

    #[test]
    fn accepts_typical_band_pair() {
        let limits = ratios((2.0, 6.0), (3.0, 5.0));
        let regions = [region(0, 20, 60, 4000.0), region(1, 10, 30, 1000.0)];
        let pair = select_target_pair(&regions, &limits).expect("pair");
        assert_eq!(pair.top.area, 4000.0);
        assert_eq!(pair.bottom.area, 1000.0);
    }

    #[test]
    fn prefers_largest_viable_top() {
        let limits = ratios((0.5, 6.0), (3.5, 4.5));
        // 5000/1000 = 5.0 is out of band; 4000/1000 = 4.0 is in band
        let regions = [
            region(0, 20, 40, 5000.0),
            region(1, 20, 40, 4000.0),
            region(2, 10, 20, 1000.0),
        ];
        let pair = select_target_pair(&regions, &limits).expect("pair");
        assert_eq!(pair.top.area, 4000.0);
        assert_eq!(pair.bottom.area, 1000.0);
    }

    #[test]
    fn first_matching_sibling_wins() {
        let limits = ratios((0.5, 6.0), (2.0, 2.0));
        // sorted order keeps equal areas in discovery order; the inner scan
        // must skip the 1.0-ratio sibling and accept the first 2.0 ratio
        let regions = [
            region(0, 20, 40, 100.0),
            region(1, 20, 40, 100.0),
            region(2, 10, 20, 50.0),
        ];
        let pair = select_target_pair(&regions, &limits).expect("pair");
        assert_eq!(pair.top.contour_index, 0);
        assert_eq!(pair.bottom.contour_index, 2);
    }

    #[test]
    fn ratio_bounds_are_inclusive() {
        let limits = ratios((3.0, 3.0), (4.0, 4.0));
        // h2w exactly 3.0 on both, area ratio exactly 4.0
        let regions = [region(0, 20, 60, 4000.0), region(1, 10, 30, 1000.0)];
        assert!(select_target_pair(&regions, &limits).is_some());
    }

    #[test]
    fn unpaired_candidates_yield_none() {
        let limits = ratios((0.5, 6.0), (3.0, 5.0));
        // 4000/3000 = 1.33, out of band, and no other siblings
        let regions = [region(0, 20, 40, 4000.0), region(1, 20, 40, 3000.0)];
        assert_eq!(select_target_pair(&regions, &limits), None);
    }

    #[test]
    fn distance_truncates_toward_zero() {
        let model = DistanceModel {
            a3: 0.0,
            a2: 0.0,
            a1: -0.5,
            a0: 200.0,
        };
        // 200 - 75 = 125.0 exactly; 200 - 75.5 truncates to 124, not 125
        assert_eq!(estimate_distance_inches(150, &model), 125);
        assert_eq!(estimate_distance_inches(151, &model), 124);
    }

    #[test]
    fn distance_is_pure() {
        let model = DistanceModel {
            a3: 0.000001,
            a2: -0.002,
            a1: 0.25,
            a0: 90.0,
        };
        let first = estimate_distance_inches(240, &model);
        let second = estimate_distance_inches(240, &model);
        assert_eq!(first, second);
    }

    #[test]
    fn negative_estimate_truncates_toward_zero() {
        let model = DistanceModel {
            a3: 0.0,
            a2: 0.0,
            a1: 0.0,
            a0: -0.7,
        };
        assert_eq!(estimate_distance_inches(0, &model), 0);
    }
}
