//! Shared data passed between the pipeline and the network servers.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

/// Published result of the most recent detection cycle.
///
/// When `in_view` is false every geometry-derived field holds the sentinel
/// `-1`; fields are never left over from a previous cycle. `frame_counter`
/// increments exactly once per completed cycle, found or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetSnapshot {
    pub in_view: bool,
    pub sw_x: i32,
    pub sw_y: i32,
    pub se_x: i32,
    pub se_y: i32,
    pub high_mid_y: i32,
    pub delta_x: i32,
    pub delta_y: i32,
    pub distance_inches: i32,
    pub fps: i32,
    pub frame_counter: u64,
    pub frame_msec: i64,
    pub battery_pct: i32,
    pub cpu_pct: i32,
}

/// Per-cycle bookkeeping shared by both snapshot variants.
#[derive(Debug, Clone, Copy)]
pub struct CycleStats {
    pub fps: i32,
    pub frame_counter: u64,
    pub frame_msec: i64,
    pub battery_pct: i32,
    pub cpu_pct: i32,
}

/// Geometry of an accepted target pair, in frame pixel coordinates.
#[derive(Debug, Clone, Copy)]
pub struct TargetGeometry {
    pub sw_x: i32,
    pub sw_y: i32,
    pub se_x: i32,
    pub se_y: i32,
    pub high_mid_y: i32,
    pub delta_x: i32,
    pub delta_y: i32,
    pub distance_inches: i32,
}

impl TargetSnapshot {
    /// Snapshot for a cycle that accepted a target pair.
    pub fn sighted(geometry: TargetGeometry, stats: CycleStats) -> Self {
        Self {
            in_view: true,
            sw_x: geometry.sw_x,
            sw_y: geometry.sw_y,
            se_x: geometry.se_x,
            se_y: geometry.se_y,
            high_mid_y: geometry.high_mid_y,
            delta_x: geometry.delta_x,
            delta_y: geometry.delta_y,
            distance_inches: geometry.distance_inches,
            fps: stats.fps,
            frame_counter: stats.frame_counter,
            frame_msec: stats.frame_msec,
            battery_pct: stats.battery_pct,
            cpu_pct: stats.cpu_pct,
        }
    }

    /// Snapshot for a cycle with no accepted pair (or a failed frame read).
    /// Every geometry field is the `-1` sentinel.
    pub fn missed(stats: CycleStats) -> Self {
        Self {
            in_view: false,
            sw_x: -1,
            sw_y: -1,
            se_x: -1,
            se_y: -1,
            high_mid_y: -1,
            delta_x: -1,
            delta_y: -1,
            distance_inches: -1,
            fps: stats.fps,
            frame_counter: stats.frame_counter,
            frame_msec: stats.frame_msec,
            battery_pct: stats.battery_pct,
            cpu_pct: stats.cpu_pct,
        }
    }
}

/// Latest camera frame with the detection overlay drawn, already JPEG
/// encoded. Consumers get owned byte buffers, so a copy stays valid across
/// later publishes.
#[derive(Clone)]
pub struct AnnotatedFrame {
    pub jpeg: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub frame_number: u64,
}

struct Inner {
    snapshot: TargetSnapshot,
    frame: Option<AnnotatedFrame>,
}

/// Concurrency-safe holder of the latest snapshot and annotated frame.
///
/// One writer (the pipeline), many readers (the servers). Readers only ever
/// receive copies taken under the shared lock, so a torn snapshot is
/// impossible and nothing outside the lock scope aliases the live values.
pub struct StateStore {
    inner: RwLock<Inner>,
}

pub type SharedStore = Arc<StateStore>;

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                snapshot: TargetSnapshot::default(),
                frame: None,
            }),
        }
    }

    /// Replace the latest snapshot, and the latest frame when the cycle
    /// produced one. The previous frame's buffer is dropped on replacement.
    pub fn publish(&self, snapshot: TargetSnapshot, frame: Option<AnnotatedFrame>) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.snapshot = snapshot;
        if frame.is_some() {
            guard.frame = frame;
        }
    }

    /// Copy of the latest snapshot.
    pub fn snapshot(&self) -> TargetSnapshot {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        guard.snapshot.clone()
    }

    /// Owned copy of the latest annotated frame, `None` until the first
    /// cycle publishes one.
    pub fn frame(&self) -> Option<AnnotatedFrame> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        guard.frame.clone()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
