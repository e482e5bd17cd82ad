//! Host health sampled once per cycle into the snapshot.

use std::{fs, path::PathBuf};

use sysinfo::System;

#[derive(Debug, Clone, Copy, Default)]
pub struct HostMetrics {
    pub cpu_pct: i32,
    pub battery_pct: i32,
}

/// Samples CPU load via `sysinfo` and battery charge from the power-supply
/// sysfs. Coprocessors without a battery report `0`.
pub struct HostMonitor {
    system: System,
    battery_capacity: Option<PathBuf>,
}

impl HostMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        // prime the counters; usage is the delta between refreshes
        system.refresh_cpu_usage();
        Self {
            system,
            battery_capacity: find_battery_capacity(),
        }
    }

    pub fn sample(&mut self) -> HostMetrics {
        self.system.refresh_cpu_usage();
        let cpu_pct = self.system.global_cpu_info().cpu_usage() as i32;

        let battery_pct = self
            .battery_capacity
            .as_ref()
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|text| parse_capacity(&text))
            .unwrap_or(0);

        HostMetrics {
            cpu_pct,
            battery_pct,
        }
    }
}

impl Default for HostMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn find_battery_capacity() -> Option<PathBuf> {
    let entries = fs::read_dir("/sys/class/power_supply").ok()?;
    for entry in entries.flatten() {
        let kind = fs::read_to_string(entry.path().join("type")).unwrap_or_default();
        if kind.trim() == "Battery" {
            let capacity = entry.path().join("capacity");
            if capacity.exists() {
                return Some(capacity);
            }
        }
    }
    None
}

fn parse_capacity(text: &str) -> Option<i32> {
    text.trim().parse::<i32>().ok().map(|pct| pct.clamp(0, 100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sysfs_capacity() {
        assert_eq!(parse_capacity("85\n"), Some(85));
        assert_eq!(parse_capacity(" 100 "), Some(100));
        assert_eq!(parse_capacity("garbage"), None);
    }

    #[test]
    fn capacity_is_clamped() {
        assert_eq!(parse_capacity("130"), Some(100));
        assert_eq!(parse_capacity("-5"), Some(0));
    }

    #[test]
    fn sample_reports_sane_ranges() {
        let mut monitor = HostMonitor::new();
        let metrics = monitor.sample();
        assert!((0..=100).contains(&metrics.battery_pct));
        assert!(metrics.cpu_pct >= 0);
    }
}
