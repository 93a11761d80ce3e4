//! Shared data types exposed by the video ingest layer.

use std::time::Duration;

use anyhow::Error;
use image::RgbImage;
use thiserror::Error;

/// Affine mapping from inference-frame coordinates into UI-frame coordinates:
/// `ui_x = inf_x * sx + tx`, `ui_y = inf_y * sy + ty`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoordMap {
    pub sx: f32,
    pub sy: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Default for CoordMap {
    fn default() -> Self {
        Self {
            sx: 1.0,
            sy: 1.0,
            tx: 0.0,
            ty: 0.0,
        }
    }
}

/// One ingest tick: a time-aligned pair of images decoded from the same
/// source instant, plus the fixed coordinate mapping between them.
pub struct FrameBundle {
    pub stream_id: String,
    /// Strictly increasing per stream, starting at 0.
    pub frame_id: i64,
    /// Presentation timestamp in nanoseconds.
    pub pts_ns: i64,
    /// Low-resolution copy fed to the detector.
    pub inf_image: RgbImage,
    /// High-resolution copy mutated downstream and shown to users.
    pub ui_image: RgbImage,
    pub map: CoordMap,
}

/// Capability consumed by the pipeline's ingest workers.
///
/// `start` must be idempotent once it has succeeded, and `stop` must be safe
/// to call even after a failed `start`.
pub trait FrameSource: Send {
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Block up to `timeout` for the next bundle. `None` is a soft timeout,
    /// not an error; callers are expected to keep polling.
    fn read(&mut self, timeout: Duration) -> Option<FrameBundle>;

    fn stop(&mut self);
}

#[derive(Debug, Error)]
/// Errors that can arise while configuring or driving capture pipelines.
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("failed to spawn decoder process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] Error),
}

/// Coordinate map latched on a source's first successful tick, together
/// with the geometry it was derived from.
///
/// The map is fixed for the lifetime of a stream: a later tick whose
/// decoded dimensions differ from the latched geometry is rejected rather
/// than silently re-latched.
#[derive(Clone, Copy, Debug)]
pub struct MapLatch {
    ui_w: u32,
    ui_h: u32,
    inf_w: u32,
    inf_h: u32,
    map: CoordMap,
}

impl MapLatch {
    pub fn new(ui: &RgbImage, inf: &RgbImage, map: CoordMap) -> Self {
        let (ui_w, ui_h) = ui.dimensions();
        let (inf_w, inf_h) = inf.dimensions();
        Self {
            ui_w,
            ui_h,
            inf_w,
            inf_h,
            map,
        }
    }

    /// The latched map, or `None` for a tick whose resolution no longer
    /// matches the latch.
    pub fn accept(&self, ui: &RgbImage, inf: &RgbImage) -> Option<CoordMap> {
        if ui.dimensions() != (self.ui_w, self.ui_h)
            || inf.dimensions() != (self.inf_w, self.inf_h)
        {
            return None;
        }
        Some(self.map)
    }
}

/// Maximum presentation-time skew tolerated between the two profile images
/// of one tick before the tick is discarded.
pub const PAIR_TOLERANCE_NS: i64 = 1_000_000;

/// Whether two profile timestamps belong to the same source instant.
pub fn paired_within_tolerance(ui_pts_ns: i64, inf_pts_ns: i64) -> bool {
    (ui_pts_ns - inf_pts_ns).abs() <= PAIR_TOLERANCE_NS
}

/// Join the two profile images of one tick into a bundle.
///
/// Returns `None` when the profile timestamps diverge beyond
/// [`PAIR_TOLERANCE_NS`]; the caller is expected to discard the tick.
pub fn join_profiles(
    stream_id: &str,
    frame_id: i64,
    ui: (RgbImage, i64),
    inf: (RgbImage, i64),
    map: CoordMap,
) -> Option<FrameBundle> {
    let (ui_image, ui_pts_ns) = ui;
    let (inf_image, inf_pts_ns) = inf;
    if !paired_within_tolerance(ui_pts_ns, inf_pts_ns) {
        return None;
    }
    Some(FrameBundle {
        stream_id: stream_id.to_string(),
        frame_id,
        pts_ns: ui_pts_ns,
        inf_image,
        ui_image,
        map,
    })
}
