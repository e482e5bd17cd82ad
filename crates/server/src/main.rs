use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, bail, Context, Result};
use opencv::prelude::*;
use tracing::info;
use vision_capture::CameraRig;
use vision_server::{
    annotate::FrameLayout,
    config::Config,
    data::{SharedStore, StateStore},
    data_server::{DataServer, ScreenSize},
    pipeline,
    publisher::RobotPublisher,
    status_led::{self, StatusLed},
    stream, telemetry,
};

const USAGE: &str = "Usage: vision-server [--config <path>]\n\nPositional form is also \
supported: vision-server <config-path>. The default path is ./vision.json.";

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    telemetry::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let config_path = config_path_from_args(&args)?;
    let config = Config::load(&config_path)?;
    info!("configuration loaded from {}", config_path.display());

    let prometheus = telemetry::init_metrics_recorder();

    // open the camera(s) first: the probe frame fixes the geometry every
    // downstream consumer depends on
    let mut rig = CameraRig::open(
        &config.cameras.primary.to_settings(),
        config
            .cameras
            .secondary
            .as_ref()
            .map(|section| section.to_settings())
            .as_ref(),
    )
    .context("failed to open camera rig")?;
    let probe = rig
        .read_frame()
        .context("failed to read startup probe frame")?;
    let probe_size = probe
        .size()
        .map_err(anyhow::Error::from)
        .context("probe frame size unavailable")?;
    let layout = FrameLayout::new(probe_size.width, probe_size.height);
    info!(
        "camera rig ready, {}x{} analysis frame",
        layout.width, layout.height
    );

    let store: SharedStore = Arc::new(StateStore::new());
    let running = Arc::new(AtomicBool::new(true));

    let handler_running = running.clone();
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        handler_running.store(false, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;

    let mut data_server = if config.data_server.enabled {
        Some(DataServer::spawn(
            &config.data_server,
            ScreenSize {
                width: layout.width,
                height: layout.height,
            },
            store.clone(),
            running.clone(),
        )?)
    } else {
        None
    };

    let stream_server = if config.stream_server.enabled {
        Some(stream::spawn_stream_server(
            &config.stream_server,
            store.clone(),
            Some(prometheus.clone()),
        )?)
    } else {
        None
    };

    let publisher = if config.robot_publisher.enabled {
        Some(Arc::new(RobotPublisher::spawn(
            &config.robot_publisher,
            running.clone(),
        )?))
    } else {
        None
    };

    let led_heartbeat = if config.status_led.enabled {
        let led = StatusLed::open(&config.status_led, config.cameras.target_fps);
        if led.is_available() {
            Some(
                status_led::spawn_heartbeat(
                    led,
                    config.status_led.heartbeat_interval_ms,
                    store.clone(),
                    running.clone(),
                )
                .context("failed to spawn status LED heartbeat")?,
            )
        } else {
            None
        }
    } else {
        None
    };

    let result = pipeline::run(
        &config,
        rig,
        layout,
        store,
        publisher.clone(),
        &running,
    );

    // ordered teardown; every step is safe to repeat
    running.store(false, Ordering::SeqCst);
    if let Some(server) = data_server.as_mut() {
        server.stop();
    }
    if let Some(server) = stream_server {
        server.stop();
    }
    if let Some(handle) = led_heartbeat {
        let _ = handle.join();
    }
    // the publisher's reconnect thread joins when the last handle drops
    drop(publisher);

    result
}

fn config_path_from_args(args: &[String]) -> Result<PathBuf> {
    let mut path = PathBuf::from("vision.json");
    let mut idx = 1;
    while idx < args.len() {
        match args[idx].as_str() {
            "--config" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| anyhow!("--config requires a value\n\n{USAGE}"))?;
                path = PathBuf::from(value);
                idx += 1;
            }
            arg if arg.starts_with('-') => {
                bail!("Unrecognised flag: {arg}\n\n{USAGE}");
            }
            other => {
                path = PathBuf::from(other);
                idx += 1;
            }
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("vision-server")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn defaults_to_local_config_file() {
        let path = config_path_from_args(&args(&[])).expect("path");
        assert_eq!(path, PathBuf::from("vision.json"));
    }

    #[test]
    fn accepts_flag_and_positional_forms() {
        let flagged = config_path_from_args(&args(&["--config", "/etc/vision.json"])).expect("path");
        assert_eq!(flagged, PathBuf::from("/etc/vision.json"));

        let positional = config_path_from_args(&args(&["custom.json"])).expect("path");
        assert_eq!(positional, PathBuf::from("custom.json"));
    }

    #[test]
    fn rejects_unknown_flags() {
        assert!(config_path_from_args(&args(&["--nope"])).is_err());
        assert!(config_path_from_args(&args(&["--config"])).is_err());
    }
}
