//! Multi-stream redaction pipeline: ingest, detect, track, anonymize,
//! encode, publish.
//!
//! The module is split into focused submodules:
//! - `config`: YAML configuration surface, validation, replica expansion.
//! - `queue`: the drop-oldest bounded queue connecting stages.
//! - `data`: shared structs passed between stages.
//! - `reorder`: reassembly of out-of-order detector results.
//! - `tracker`: per-stream IoU tracker.
//! - `anonymize`: in-place redaction of tracked regions.
//! - `overlay`: optional debug outlines for tracks.
//! - `encode`: JPEG encoding and metadata publication.
//! - `registry`: latest-frame fan-out to HTTP consumers.
//! - `server`: Actix Web endpoints (health, meta, snapshot, MJPEG).
//! - `runtime`: worker orchestration and lifecycle.
//! - `telemetry`: tracing and Prometheus metrics plumbing.

pub use config::{expand_replicas, load_config, AppConfig, RuntimeOptions, StreamConfig};
pub use data::TrackerFrameOutput;
pub use registry::StreamHub;
pub use runtime::PipelineRuntime;
pub use server::{spawn_server, MjpegServer};

pub mod anonymize;
pub mod config;
pub mod data;
pub mod encode;
pub mod overlay;
pub mod queue;
pub mod registry;
pub mod reorder;
pub mod runtime;
pub mod server;
pub mod telemetry;
pub mod tracker;
