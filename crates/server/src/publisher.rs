//! Reconnecting push client for the robot controller.
//!
//! The pipeline hands it every snapshot; delivery is fire-and-forget. A
//! background timer retries the connection every 10 seconds, and any write
//! failure just drops the connection until the next retry. The pipeline
//! never observes a publish error.

use std::{
    io::Write,
    net::{TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info};

use crate::{config::RobotPublisherConfig, data::TargetSnapshot, telemetry};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct RobotPublisher {
    connection: Arc<Mutex<Option<TcpStream>>>,
    handle: Option<thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl RobotPublisher {
    /// Start the reconnect loop. The first connection attempt happens
    /// immediately; failures are logged at debug and retried.
    pub fn spawn(config: &RobotPublisherConfig, running: Arc<AtomicBool>) -> Result<Self> {
        let connection: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));
        let target = format!("{}:{}", config.server_addr, config.tcp_port);

        let loop_connection = connection.clone();
        let loop_running = running.clone();
        let handle = telemetry::spawn_thread("vision-robot-publisher", move || {
            let ticker = crossbeam_channel::tick(RECONNECT_INTERVAL);
            try_connect(&target, &loop_connection);
            while loop_running.load(Ordering::Relaxed) {
                if ticker.recv_timeout(SHUTDOWN_POLL_INTERVAL).is_ok() {
                    try_connect(&target, &loop_connection);
                }
            }
        })
        .context("failed to spawn robot publisher thread")?;

        Ok(Self {
            connection,
            handle: Some(handle),
            running,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Push one snapshot as a newline-delimited JSON object. Failures drop
    /// the connection and are otherwise swallowed.
    pub fn publish(&self, snapshot: &TargetSnapshot) {
        let mut guard = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(stream) = guard.as_mut() else {
            return;
        };

        let payload = json!({
            "IsTargetInFOV": snapshot.in_view,
            "DeltaX": snapshot.delta_x,
            "DeltaY": snapshot.delta_y,
            "EstDistInches": snapshot.distance_inches,
            "FPS": snapshot.fps,
            "FrameCtr": snapshot.frame_counter,
            "FrameMSec": snapshot.frame_msec,
            "CPU": snapshot.cpu_pct,
        });
        let mut line = payload.to_string();
        line.push('\n');

        if stream.write_all(line.as_bytes()).is_err() {
            debug!("robot publisher connection lost; will retry");
            *guard = None;
            metrics::counter!("vision_publish_drops_total").increment(1);
        }
    }

    /// Stop the reconnect loop and close the connection. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let mut guard = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }
}

impl Drop for RobotPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn try_connect(target: &str, connection: &Arc<Mutex<Option<TcpStream>>>) {
    {
        let guard = connection.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return;
        }
    }

    let addr = match target.to_socket_addrs().ok().and_then(|mut it| it.next()) {
        Some(addr) => addr,
        None => {
            debug!("robot publisher target {target} did not resolve");
            return;
        }
    };

    match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            info!("robot publisher connected to {target}");
            let mut guard = connection.lock().unwrap_or_else(PoisonError::into_inner);
            *guard = Some(stream);
        }
        Err(err) => {
            debug!("robot publisher connect to {target} failed: {err}");
        }
    }
}
