//! Real-time retro-reflective target detection for a competitive robot.
//!
//! A periodic pipeline digitizes one or two camera feeds, finds the target's
//! top/bottom band pair by color and geometry, and publishes each cycle's
//! snapshot and annotated frame into a shared store. Two servers consume the
//! store independently: a TCP query server answering the robot controller and
//! an MJPEG streamer feeding the driver dashboard. The module split:
//!
//! - `config`: typed JSON configuration, validated at startup.
//! - `pipeline`: the timer-driven capture → detect → annotate → publish loop.
//! - `detect`: pure candidate-pairing and distance estimation.
//! - `smoothing`: the frame-rate moving average.
//! - `data`: snapshot/frame types and the reader-writer state store.
//! - `annotate`: overlay drawing and JPEG packaging.
//! - `data_server`: TCP request/reply telemetry.
//! - `stream`: actix MJPEG streaming plus JSON/metrics routes.
//! - `publisher`: reconnecting push client for the robot controller.
//! - `status_led`: BlinkStick heartbeat.
//! - `host`: CPU/battery sampling.
//! - `telemetry`: tracing and metrics bootstrap.

pub mod annotate;
pub mod config;
pub mod data;
pub mod data_server;
pub mod detect;
pub mod host;
pub mod pipeline;
pub mod publisher;
pub mod smoothing;
pub mod status_led;
pub mod stream;
pub mod telemetry;
