//! MJPEG streaming server for the driver dashboard.
//!
//! Runs actix on a dedicated thread so the pipeline hot path never touches
//! the async runtime. Every connected client gets its own multipart stream
//! that re-reads the latest annotated frame on each push: delivery is
//! latest-wins, a slow client silently skips frames, and a disconnect only
//! tears down that client's stream.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use actix_web::{
    web::{self, Bytes},
    App, HttpResponse, HttpServer,
};
use anyhow::{bail, Context, Result};
use async_stream::stream;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::{config::StreamServerConfig, data::SharedStore, telemetry};

const MULTIPART_BOUNDARY: &str = "frame";

/// Shared state backing the HTTP handlers.
#[derive(Clone)]
struct ServerState {
    store: SharedStore,
    push_interval: Duration,
    clients: Arc<AtomicUsize>,
    prometheus: Option<PrometheusHandle>,
}

/// Counts a streaming client for as long as its response stream is alive.
/// Dropping the guard (client gone, write failed) deregisters it.
struct ClientGuard {
    clients: Arc<AtomicUsize>,
}

impl ClientGuard {
    fn register(clients: Arc<AtomicUsize>) -> Self {
        let now = clients.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("vision_stream_clients").set(now as f64);
        debug!("stream client connected ({now} active)");
        Self { clients }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let now = self.clients.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("vision_stream_clients").set(now as f64);
        debug!("stream client disconnected ({now} active)");
    }
}

/// One boundary-delimited part of the multipart stream.
fn multipart_chunk(jpeg: &[u8], frame_number: u64) -> Vec<u8> {
    let header = format!(
        "--{MULTIPART_BOUNDARY}\r\n\
         X-Sequence: {frame_number}\r\n\
         Content-Type: image/jpeg\r\n\
         Content-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut payload = Vec::with_capacity(header.len() + jpeg.len() + 2);
    payload.extend_from_slice(header.as_bytes());
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    payload
}

/// Handle for the streaming server thread.
pub struct StreamServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StreamServer {
    /// Signal the server to stop, close client connections, and block until
    /// the thread exits.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the streaming server thread. Binding the port happens before this
/// returns, so a bad port fails startup instead of logging from a thread.
pub fn spawn_stream_server(
    config: &StreamServerConfig,
    store: SharedStore,
    prometheus: Option<PrometheusHandle>,
) -> Result<StreamServer> {
    let port = config.tcp_port;
    let push_interval = Duration::from_millis(config.push_interval_ms);
    let clients = Arc::new(AtomicUsize::new(0));
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let handle = telemetry::spawn_thread("vision-stream-server", move || {
        let outcome = actix_web::rt::System::new().block_on(async move {
            let state = ServerState {
                store,
                push_interval,
                clients,
                prometheus,
            };
            let bound = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(state.clone()))
                    .route("/stream.mjpg", web::get().to(stream_handler))
                    .route("/frame.jpg", web::get().to(frame_handler))
                    .route("/telemetry", web::get().to(telemetry_handler))
                    .route("/metrics", web::get().to(metrics_handler))
            })
            .workers(2)
            .shutdown_timeout(1)
            .bind(("0.0.0.0", port));

            let server = match bound {
                Ok(server) => server.run(),
                Err(err) => {
                    let _ = ready_tx.send(Err(err.to_string()));
                    return Ok(());
                }
            };
            let _ = ready_tx.send(Ok(()));

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = outcome {
            error!("stream server error: {err}");
        }
    })
    .context("failed to spawn stream server thread")?;

    match ready_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Ok(())) => {
            debug!("stream server listening on port {port}");
            Ok(StreamServer {
                shutdown: Some(shutdown_tx),
                handle: Some(handle),
            })
        }
        Ok(Err(err)) => {
            let _ = handle.join();
            bail!("failed to bind stream server on port {port}: {err}");
        }
        Err(_) => {
            bail!("stream server did not report startup on port {port}");
        }
    }
}

/// Push the latest frame at the configured interval until the client goes
/// away. No per-client queue: each push reads whatever is newest.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let body = stream! {
        let _guard = ClientGuard::register(state.clients.clone());
        let mut interval = actix_web::rt::time::interval(state.push_interval);
        loop {
            interval.tick().await;
            if let Some(frame) = state.store.frame() {
                let chunk = multipart_chunk(&frame.jpeg, frame.frame_number);
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
            }
        }
    };

    HttpResponse::Ok()
        .append_header(("Cache-Control", "no-cache"))
        .append_header((
            "Content-Type",
            format!("multipart/x-mixed-replace; boundary={MULTIPART_BOUNDARY}"),
        ))
        .streaming(body)
}

/// Single latest JPEG, or 204 before the first published frame.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.store.frame() {
        Some(frame) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .body(frame.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Latest snapshot as JSON.
async fn telemetry_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.store.snapshot())
}

/// Prometheus exposition of the process metrics.
async fn metrics_handler(state: web::Data<ServerState>) -> HttpResponse {
    match &state.prometheus {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

#[cfg(test)]
mod tests {
    use actix_web::test::{call_service, init_service, read_body, TestRequest};

    use super::*;
    use crate::data::{AnnotatedFrame, CycleStats, StateStore, TargetSnapshot};

    #[test]
    fn chunk_framing_wraps_jpeg_bytes() {
        let jpeg = [0xffu8, 0xd8, 0x00, 0xff, 0xd9];
        let chunk = multipart_chunk(&jpeg, 7);
        let text = String::from_utf8_lossy(&chunk[..chunk.len() - jpeg.len() - 2]);
        assert!(text.starts_with("--frame\r\n"));
        assert!(text.contains("X-Sequence: 7\r\n"));
        assert!(text.contains("Content-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-Length: 5\r\n\r\n"));
        assert!(chunk.ends_with(b"\xff\xd9\r\n"));
    }

    #[test]
    fn client_guard_tracks_registrations() {
        let clients = Arc::new(AtomicUsize::new(0));
        let first = ClientGuard::register(clients.clone());
        let second = ClientGuard::register(clients.clone());
        assert_eq!(clients.load(Ordering::SeqCst), 2);

        // dropping one client must not affect the other
        drop(first);
        assert_eq!(clients.load(Ordering::SeqCst), 1);
        drop(second);
        assert_eq!(clients.load(Ordering::SeqCst), 0);
    }

    fn test_state() -> (SharedStore, ServerState) {
        let store: SharedStore = Arc::new(StateStore::new());
        let state = ServerState {
            store: store.clone(),
            push_interval: Duration::from_millis(20),
            clients: Arc::new(AtomicUsize::new(0)),
            prometheus: None,
        };
        (store, state)
    }

    #[actix_web::test]
    async fn frame_route_serves_the_latest_jpeg() {
        let (store, state) = test_state();
        let app = init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/frame.jpg", web::get().to(frame_handler)),
        )
        .await;

        // nothing published yet
        let response = call_service(&app, TestRequest::get().uri("/frame.jpg").to_request()).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::NO_CONTENT);

        store.publish(
            TargetSnapshot::missed(CycleStats {
                fps: 20,
                frame_counter: 1,
                frame_msec: 4,
                battery_pct: 0,
                cpu_pct: 2,
            }),
            Some(AnnotatedFrame {
                jpeg: vec![0xff, 0xd8, 0xff, 0xd9],
                width: 640,
                height: 480,
                frame_number: 1,
            }),
        );

        let response = call_service(&app, TestRequest::get().uri("/frame.jpg").to_request()).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::OK);
        let body = read_body(response).await;
        assert_eq!(body.as_ref(), &[0xff, 0xd8, 0xff, 0xd9]);
    }

    #[actix_web::test]
    async fn telemetry_route_serves_the_latest_snapshot() {
        let (store, state) = test_state();
        let app = init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/telemetry", web::get().to(telemetry_handler)),
        )
        .await;

        store.publish(
            TargetSnapshot::missed(CycleStats {
                fps: 18,
                frame_counter: 33,
                frame_msec: 6,
                battery_pct: 70,
                cpu_pct: 25,
            }),
            None,
        );

        let response = call_service(&app, TestRequest::get().uri("/telemetry").to_request()).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::OK);
        let body = read_body(response).await;
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["in_view"], false);
        assert_eq!(value["frame_counter"], 33);
        assert_eq!(value["fps"], 18);
    }
}
