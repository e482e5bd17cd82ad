//! TCP telemetry query server.
//!
//! One reply per inbound request. The reply layout (V1 or V2) is fixed by
//! configuration, not negotiated per request, and the store is read just
//! before each reply so clients always see the most recent completed cycle.
//! Each connection runs on its own named thread; the registry lock covers
//! membership changes only, never the request/reply path.

use std::{
    collections::HashMap,
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::{
    config::{DataServerConfig, MessageFormat},
    data::{SharedStore, TargetSnapshot},
    telemetry,
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Frame geometry measured from the startup probe frame; V1 replies embed it.
#[derive(Debug, Clone, Copy)]
pub struct ScreenSize {
    pub width: i32,
    pub height: i32,
}

/// Render one reply for the configured schema.
pub fn render_reply(format: MessageFormat, snapshot: &TargetSnapshot, screen: ScreenSize) -> String {
    match format {
        MessageFormat::V1 => format!(
            "<response>\
             <SW_X>{}</SW_X><SW_Y>{}</SW_Y><SE_X>{}</SE_X><SE_Y>{}</SE_Y>\
             <HI_MID_Y>{}</HI_MID_Y>\
             <SCREEN_WIDTH>{}</SCREEN_WIDTH><SCREEN_HEIGHT>{}</SCREEN_HEIGHT>\
             <BLOB_COUNT>1</BLOB_COUNT><CamType>BOILER</CamType>\
             </response>",
            snapshot.sw_x,
            snapshot.sw_y,
            snapshot.se_x,
            snapshot.se_y,
            snapshot.high_mid_y,
            screen.width,
            screen.height,
        ),
        MessageFormat::V2 => format!(
            "<response>\
             <IS_VALID>{}</IS_VALID>\
             <SW_X>{}</SW_X><SW_Y>{}</SW_Y><SE_X>{}</SE_X><SE_Y>{}</SE_Y>\
             <HI_MID_Y>{}</HI_MID_Y>\
             <FPS>{}</FPS><FRAMECTR>{}</FRAMECTR><FRAMEMS>{}</FRAMEMS>\
             <CPU>{}</CPU><BATTERY>{}</BATTERY>\
             </response>",
            snapshot.in_view,
            snapshot.sw_x,
            snapshot.sw_y,
            snapshot.se_x,
            snapshot.se_y,
            snapshot.high_mid_y,
            snapshot.fps,
            snapshot.frame_counter,
            snapshot.frame_msec,
            snapshot.cpu_pct,
            snapshot.battery_pct,
        ),
    }
}

#[derive(Default)]
struct ConnectionRegistry {
    streams: Mutex<HashMap<u64, TcpStream>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    fn add(&self, stream: &TcpStream) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(clone) = stream.try_clone() {
            let mut guard = self
                .streams
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.insert(id, clone);
            metrics::gauge!("vision_query_clients").set(guard.len() as f64);
        }
        id
    }

    fn remove(&self, id: u64) {
        let mut guard = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.remove(&id);
        metrics::gauge!("vision_query_clients").set(guard.len() as f64);
    }

    fn shutdown_all(&self) {
        let guard = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for stream in guard.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Handle to the running query server.
pub struct DataServer {
    accept_handle: Option<thread::JoinHandle<()>>,
    connections: Arc<ConnectionRegistry>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
}

impl DataServer {
    /// Bind the listening socket and start the accept loop. A bind failure is
    /// a configuration error and fatal to startup.
    pub fn spawn(
        config: &DataServerConfig,
        screen: ScreenSize,
        store: SharedStore,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.tcp_port))
            .with_context(|| format!("failed to bind query server on port {}", config.tcp_port))?;
        listener
            .set_nonblocking(true)
            .context("failed to set query listener nonblocking")?;
        let local_addr = listener
            .local_addr()
            .context("query listener has no local address")?;

        let connections = Arc::new(ConnectionRegistry::default());
        let format = config.message_format;

        let accept_connections = connections.clone();
        let accept_running = running.clone();
        let accept_handle = telemetry::spawn_thread("vision-query-accept", move || {
            while accept_running.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("query client connected from {peer}");
                        spawn_connection(
                            stream,
                            format,
                            screen,
                            store.clone(),
                            accept_connections.clone(),
                            accept_running.clone(),
                        );
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                    Err(err) => {
                        warn!("query server accept failed: {err}");
                        thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                }
            }
        })
        .context("failed to spawn query accept thread")?;

        debug!("query server listening on {local_addr} ({format:?} replies)");
        Ok(Self {
            accept_handle: Some(accept_handle),
            connections,
            local_addr,
            running,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close every live connection, and join all threads.
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.connections.shutdown_all();
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        let handles: Vec<_> = {
            let mut guard = self
                .connections
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for DataServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_connection(
    stream: TcpStream,
    format: MessageFormat,
    screen: ScreenSize,
    store: SharedStore,
    connections: Arc<ConnectionRegistry>,
    running: Arc<AtomicBool>,
) {
    let id = connections.add(&stream);
    let registry = connections.clone();
    let spawned = telemetry::spawn_thread(format!("vision-query-conn-{id}"), move || {
        serve_connection(stream, format, screen, store, running);
        registry.remove(id);
    });
    match spawned {
        Ok(handle) => {
            let mut guard = connections
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.push(handle);
        }
        Err(err) => {
            warn!("failed to spawn query connection thread: {err}");
            connections.remove(id);
        }
    }
}

fn serve_connection(
    mut stream: TcpStream,
    format: MessageFormat,
    screen: ScreenSize,
    store: SharedStore,
    running: Arc<AtomicBool>,
) {
    if stream.set_read_timeout(Some(READ_POLL_INTERVAL)).is_err() {
        return;
    }

    let mut request = [0u8; 512];
    while running.load(Ordering::Relaxed) {
        match stream.read(&mut request) {
            Ok(0) => break,
            Ok(_) => {
                // any request payload gets the current snapshot back
                let snapshot = store.snapshot();
                let reply = render_reply(format, &snapshot, screen);
                if stream
                    .write_all(reply.as_bytes())
                    .and_then(|_| stream.write_all(b"\n"))
                    .is_err()
                {
                    break;
                }
                metrics::counter!("vision_query_replies_total").increment(1);
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CycleStats, TargetGeometry};

    fn sighted_snapshot() -> TargetSnapshot {
        TargetSnapshot::sighted(
            TargetGeometry {
                sw_x: 100,
                sw_y: 120,
                se_x: 140,
                se_y: 180,
                high_mid_y: 150,
                delta_x: -220,
                delta_y: 90,
                distance_inches: 96,
            },
            CycleStats {
                fps: 19,
                frame_counter: 42,
                frame_msec: 12,
                battery_pct: 88,
                cpu_pct: 37,
            },
        )
    }

    const SCREEN: ScreenSize = ScreenSize {
        width: 640,
        height: 480,
    };

    #[test]
    fn v1_reply_carries_screen_and_cam_type() {
        let reply = render_reply(MessageFormat::V1, &sighted_snapshot(), SCREEN);
        assert!(reply.starts_with("<response>"));
        assert!(reply.ends_with("</response>"));
        assert!(reply.contains("<SCREEN_WIDTH>640</SCREEN_WIDTH>"));
        assert!(reply.contains("<SCREEN_HEIGHT>480</SCREEN_HEIGHT>"));
        assert!(reply.contains("<CamType>BOILER</CamType>"));
        assert!(reply.contains("<BLOB_COUNT>1</BLOB_COUNT>"));
        assert!(!reply.contains("<IS_VALID>"));
    }

    #[test]
    fn v2_reply_carries_validity_and_stats() {
        let reply = render_reply(MessageFormat::V2, &sighted_snapshot(), SCREEN);
        assert!(reply.contains("<IS_VALID>true</IS_VALID>"));
        assert!(reply.contains("<SW_X>100</SW_X>"));
        assert!(reply.contains("<HI_MID_Y>150</HI_MID_Y>"));
        assert!(reply.contains("<FPS>19</FPS>"));
        assert!(reply.contains("<FRAMECTR>42</FRAMECTR>"));
        assert!(reply.contains("<FRAMEMS>12</FRAMEMS>"));
        assert!(reply.contains("<CPU>37</CPU>"));
        assert!(reply.contains("<BATTERY>88</BATTERY>"));
        assert!(!reply.contains("<SCREEN_WIDTH>"));
        assert!(!reply.contains("<CamType>"));
    }

    #[test]
    fn v2_reply_renders_sentinels_when_invalid() {
        let snapshot = TargetSnapshot::missed(CycleStats {
            fps: 20,
            frame_counter: 7,
            frame_msec: 3,
            battery_pct: 0,
            cpu_pct: 5,
        });
        let reply = render_reply(MessageFormat::V2, &snapshot, SCREEN);
        assert!(reply.contains("<IS_VALID>false</IS_VALID>"));
        assert!(reply.contains("<SW_X>-1</SW_X>"));
        assert!(reply.contains("<HI_MID_Y>-1</HI_MID_Y>"));
    }
}
