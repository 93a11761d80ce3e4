//! Configuration for the service: YAML surface, validation, and replica
//! expansion.
//!
//! The binary loads the file once; everything downstream consumes validated
//! structs and never re-parses.

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use detect_core::DetectorConfig;
use video_ingest::{
    DualSourceSpec, OutputProfile, ResizeFilter, SourceInput, SourceProfiles,
};

use crate::pipeline::{anonymize::AnonymizerConfig, tracker::TrackerConfig};

/// Profile names the pipeline requires for every stream.
pub const PROFILE_INFERENCE: &str = "inference";
pub const PROFILE_UI: &str = "ui";

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub runtime: RuntimeOptions,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Webcam,
    File,
    Rtsp,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StreamKind,
    #[serde(default)]
    pub file: FileParams,
    #[serde(default)]
    pub webcam: WebcamParams,
    #[serde(default)]
    pub rtsp: RtspParams,
    #[serde(default)]
    pub replicate: ReplicateConfig,
    pub outputs: OutputsConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FileParams {
    pub path: String,
    #[serde(rename = "loop", default = "default_true")]
    pub loop_playback: bool,
}

impl Default for FileParams {
    fn default() -> Self {
        Self {
            path: "assets/test_video.mp4".to_string(),
            loop_playback: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebcamParams {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_cam_width")]
    pub width: u32,
    #[serde(default = "default_cam_height")]
    pub height: u32,
    #[serde(default = "default_cam_fps")]
    pub fps: u32,
    #[serde(default = "default_true")]
    pub mjpg: bool,
}

fn default_device() -> String {
    "/dev/video0".to_string()
}

fn default_cam_width() -> u32 {
    1280
}

fn default_cam_height() -> u32 {
    720
}

fn default_cam_fps() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for WebcamParams {
    fn default() -> Self {
        Self {
            device: default_device(),
            width: default_cam_width(),
            height: default_cam_height(),
            fps: default_cam_fps(),
            mjpg: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct RtspParams {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u32,
    #[serde(default = "default_true")]
    pub tcp: bool,
}

fn default_latency_ms() -> u32 {
    100
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReplicateConfig {
    #[serde(default = "default_replica_count")]
    pub count: u32,
    #[serde(default)]
    pub ids: Vec<String>,
}

fn default_replica_count() -> u32 {
    1
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            count: 1,
            ids: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OutputsConfig {
    pub profiles: BTreeMap<String, ProfileConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProfileConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_cam_fps")]
    pub fps: u32,
    #[serde(default)]
    pub keep_aspect: bool,
    #[serde(default)]
    pub interp: InterpKind,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_format() -> String {
    "rgb".to_string()
}

fn default_jpeg_quality() -> u8 {
    75
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InterpKind {
    Nearest,
    #[default]
    Linear,
    Cubic,
    Area,
}

impl InterpKind {
    fn as_resize_filter(self) -> ResizeFilter {
        match self {
            InterpKind::Nearest => ResizeFilter::Nearest,
            InterpKind::Linear => ResizeFilter::Linear,
            InterpKind::Cubic => ResizeFilter::Cubic,
            InterpKind::Area => ResizeFilter::Area,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeOptions {
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_inf_workers")]
    pub inf_workers: usize,
    #[serde(default)]
    pub draw_tracks: bool,
    #[serde(default)]
    pub queues: QueueCaps,
    #[serde(default)]
    pub ordering: OrderingOptions,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub anonymizer: AnonymizerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

fn default_inf_workers() -> usize {
    1
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
            inf_workers: default_inf_workers(),
            draw_tracks: false,
            queues: QueueCaps::default(),
            ordering: OrderingOptions::default(),
            detector: DetectorConfig::default(),
            anonymizer: AnonymizerConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct QueueCaps {
    #[serde(default = "default_infer_in_cap")]
    pub infer_in: usize,
    #[serde(default = "default_inf_state_in_cap")]
    pub inf_state_in: usize,
    #[serde(default = "default_det_res_cap")]
    pub det_res: usize,
    #[serde(default = "default_anon_in_cap")]
    pub anon_in: usize,
    #[serde(default = "default_enc_in_cap")]
    pub enc_in: usize,
    #[serde(default = "default_analytics_cap")]
    pub analytics: usize,
}

fn default_infer_in_cap() -> usize {
    50
}

fn default_inf_state_in_cap() -> usize {
    5
}

fn default_det_res_cap() -> usize {
    20
}

fn default_anon_in_cap() -> usize {
    5
}

fn default_enc_in_cap() -> usize {
    5
}

fn default_analytics_cap() -> usize {
    256
}

impl Default for QueueCaps {
    fn default() -> Self {
        Self {
            infer_in: default_infer_in_cap(),
            inf_state_in: default_inf_state_in_cap(),
            det_res: default_det_res_cap(),
            anon_in: default_anon_in_cap(),
            enc_in: default_enc_in_cap(),
            analytics: default_analytics_cap(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct OrderingOptions {
    #[serde(default = "default_reorder_window")]
    pub reorder_window: i64,
    #[serde(default = "default_pending_cap")]
    pub pending_cap: usize,
}

fn default_reorder_window() -> i64 {
    crate::pipeline::reorder::DEFAULT_REORDER_WINDOW
}

fn default_pending_cap() -> usize {
    crate::pipeline::reorder::DEFAULT_PENDING_CAP
}

impl Default for OrderingOptions {
    fn default() -> Self {
        Self {
            reorder_window: default_reorder_window(),
            pending_cap: default_pending_cap(),
        }
    }
}

/// Load and validate the YAML configuration file.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let cfg: AppConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Reject configurations the pipeline cannot run. Fatal at load time.
pub fn validate(cfg: &AppConfig) -> Result<()> {
    if cfg.streams.is_empty() {
        bail!("no streams configured");
    }
    for s in &cfg.streams {
        if s.id.is_empty() {
            bail!("stream with empty id");
        }
        for required in [PROFILE_INFERENCE, PROFILE_UI] {
            let Some(profile) = s.outputs.profiles.get(required) else {
                bail!("stream {}: missing required profile {required:?}", s.id);
            };
            if profile.width == 0 || profile.height == 0 {
                bail!(
                    "stream {}: profile {required:?} has zero dimensions",
                    s.id
                );
            }
            if !(1..=100).contains(&profile.jpeg_quality) {
                bail!(
                    "stream {}: profile {required:?} jpeg_quality must be 1..=100",
                    s.id
                );
            }
        }
        if s.kind == StreamKind::Rtsp && s.rtsp.url.is_empty() {
            bail!("stream {}: rtsp stream with empty url", s.id);
        }
        if s.replicate.count < 1 {
            bail!("stream {}: replicate.count must be >= 1", s.id);
        }
    }

    let q = &cfg.runtime.queues;
    for (name, cap) in [
        ("infer_in", q.infer_in),
        ("inf_state_in", q.inf_state_in),
        ("det_res", q.det_res),
        ("anon_in", q.anon_in),
        ("enc_in", q.enc_in),
        ("analytics", q.analytics),
    ] {
        if cap == 0 {
            bail!("runtime.queues.{name} must be >= 1");
        }
    }
    if cfg.runtime.inf_workers == 0 {
        bail!("runtime.inf_workers must be >= 1");
    }
    if !(1..=100).contains(&cfg.runtime.jpeg_quality) {
        bail!("runtime.jpeg_quality must be 1..=100");
    }
    Ok(())
}

/// Expand `replicate.count` logical copies of each stream into distinct
/// stream specs with distinct ids. Explicit ids are honored; the rest are
/// generated as `"{id}_{index}"`.
pub fn expand_replicas(streams: Vec<StreamConfig>) -> Vec<StreamConfig> {
    let mut out = Vec::with_capacity(streams.len());
    for s in streams {
        let n = s.replicate.count.max(1) as usize;
        if n == 1 {
            let mut one = s;
            one.replicate = ReplicateConfig::default();
            out.push(one);
            continue;
        }

        let mut ids = s.replicate.ids.clone();
        for i in ids.len()..n {
            ids.push(format!("{}_{i}", s.id));
        }

        for id in ids.into_iter().take(n) {
            let mut replica = s.clone();
            replica.id = id;
            replica.replicate = ReplicateConfig::default();
            out.push(replica);
        }
    }
    out
}

impl StreamConfig {
    /// Translate the config entry into the ingest crate's source spec.
    pub fn source_spec(&self) -> DualSourceSpec {
        let profile = |cfg: &ProfileConfig| OutputProfile {
            width: cfg.width,
            height: cfg.height,
            fps: cfg.fps,
            keep_aspect: cfg.keep_aspect,
            filter: cfg.interp.as_resize_filter(),
        };
        let inference = profile(
            self.outputs
                .profiles
                .get(PROFILE_INFERENCE)
                .expect("validated at load"),
        );
        let ui = profile(
            self.outputs
                .profiles
                .get(PROFILE_UI)
                .expect("validated at load"),
        );

        let input = match self.kind {
            StreamKind::File => SourceInput::File {
                path: self.file.path.clone(),
                loop_playback: self.file.loop_playback,
            },
            StreamKind::Webcam => SourceInput::Webcam {
                device: self.webcam.device.clone(),
                width: self.webcam.width,
                height: self.webcam.height,
                fps: self.webcam.fps,
                mjpg: self.webcam.mjpg,
            },
            StreamKind::Rtsp => SourceInput::Rtsp {
                url: self.rtsp.url.clone(),
                latency_ms: self.rtsp.latency_ms,
                tcp: self.rtsp.tcp,
            },
        };

        DualSourceSpec {
            stream_id: self.id.clone(),
            input,
            profiles: SourceProfiles { inference, ui },
        }
    }
}
