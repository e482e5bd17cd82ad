//! BlinkStick status LED heartbeat.
//!
//! A timer thread reads the latest snapshot and blinks the LED so the drive
//! team can see vision health without the dashboard: red when the target is
//! not in view, green when it is in view and centered within the configured
//! threshold, blue otherwise. The LED double-blinks when the smoothed frame
//! rate deviates more than 10 % from the target. Without a device the
//! heartbeat no-ops and everything else keeps running.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use hidapi::{HidApi, HidDevice};
use tracing::{debug, info, warn};

use crate::{config::StatusLedConfig, data::{SharedStore, TargetSnapshot}, telemetry};

const BLINKSTICK_VENDOR_ID: u16 = 0x20a0;
const BLINKSTICK_PRODUCT_ID: u16 = 0x41e5;

// classic palette carried over from the old dashboards
const COLOR_NOT_IN_VIEW: Rgb = Rgb(255, 131, 250);
const COLOR_ON_TARGET: Rgb = Rgb(0, 201, 87);
const COLOR_IN_VIEW: Rgb = Rgb(30, 144, 255);

const FPS_DEADBAND_PCT: f64 = 10.0;
const BLINK_DURATION: Duration = Duration::from_millis(250);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

/// Map a snapshot to the LED color.
fn pick_color(snapshot: &TargetSnapshot, on_target_threshold: i32) -> Rgb {
    if !snapshot.in_view {
        COLOR_NOT_IN_VIEW
    } else if snapshot.delta_x.abs() <= on_target_threshold {
        COLOR_ON_TARGET
    } else {
        COLOR_IN_VIEW
    }
}

/// Single blink at a healthy frame rate, double blink when more than 10 %
/// off target.
fn blink_count(target_fps: u32, actual_fps: i32) -> u32 {
    if target_fps == 0 {
        return 1;
    }
    let error_pct =
        ((f64::from(target_fps) - f64::from(actual_fps)) / f64::from(target_fps)).abs() * 100.0;
    if error_pct > FPS_DEADBAND_PCT {
        2
    } else {
        1
    }
}

pub struct StatusLed {
    device: Option<HidDevice>,
    on_target_threshold: i32,
    target_fps: u32,
}

impl StatusLed {
    /// Probe for a BlinkStick. An absent device is not an error; the
    /// heartbeat just no-ops.
    pub fn open(config: &StatusLedConfig, target_fps: u32) -> Self {
        let device = match HidApi::new() {
            Ok(api) => match api.open(BLINKSTICK_VENDOR_ID, BLINKSTICK_PRODUCT_ID) {
                Ok(device) => {
                    info!("status LED found");
                    Some(device)
                }
                Err(_) => {
                    info!("status LED not present; heartbeat disabled");
                    None
                }
            },
            Err(err) => {
                warn!("HID subsystem unavailable: {err}");
                None
            }
        };

        let mut led = Self {
            device,
            on_target_threshold: config.on_target_threshold,
            target_fps,
        };
        // force a known state on startup
        led.set_color(Rgb(0, 0, 0));
        led
    }

    pub fn is_available(&self) -> bool {
        self.device.is_some()
    }

    /// Blink once or twice in the color picked from the snapshot.
    pub fn update(&mut self, snapshot: &TargetSnapshot) {
        if self.device.is_none() {
            return;
        }
        let color = pick_color(snapshot, self.on_target_threshold);
        let repeats = blink_count(self.target_fps, snapshot.fps);
        for _ in 0..repeats {
            self.set_color(color);
            thread::sleep(BLINK_DURATION);
            self.set_color(Rgb(0, 0, 0));
            thread::sleep(BLINK_DURATION);
        }
    }

    fn set_color(&mut self, color: Rgb) {
        let Some(device) = self.device.as_ref() else {
            return;
        };
        // report id 1: set the first LED to an RGB value
        let report = [0x01, color.0, color.1, color.2];
        if let Err(err) = device.send_feature_report(&report) {
            debug!("status LED write failed: {err}");
            self.device = None;
        }
    }
}

/// Run the heartbeat on its own named thread until shutdown.
pub fn spawn_heartbeat(
    mut led: StatusLed,
    interval_ms: u64,
    store: SharedStore,
    running: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("vision-status-led", move || {
        let ticker = crossbeam_channel::tick(Duration::from_millis(interval_ms.max(1)));
        while running.load(Ordering::Relaxed) {
            if ticker.recv_timeout(SHUTDOWN_POLL_INTERVAL).is_ok() {
                let snapshot = store.snapshot();
                led.update(&snapshot);
            }
        }
        led.set_color(Rgb(0, 0, 0));
    })
}
