//! Shared structs passed between pipeline stages.

use std::sync::{Arc, Mutex, PoisonError};

use detect_core::BBox;
use image::RgbImage;
use video_ingest::{CoordMap, FrameBundle};

/// One frame travelling through a stream's pipeline.
///
/// The context is shared by at most two stages at a time; the mutex-wrapped
/// fields encode the phase discipline: the detector worker takes the
/// inference image, the ordering stage writes the tracks, the anonymizer
/// mutates the UI image, and the encoder finally takes it.
pub struct FrameCtx {
    pub stream_id: String,
    pub frame_id: i64,
    pub pts_ns: i64,
    pub map: CoordMap,
    pub inf_w: u32,
    pub inf_h: u32,
    pub ui_w: u32,
    pub ui_h: u32,
    inf_image: Mutex<Option<RgbImage>>,
    ui_image: Mutex<Option<RgbImage>>,
    tracked_boxes: Mutex<Vec<BBox>>,
}

pub type FrameHandle = Arc<FrameCtx>;

impl FrameCtx {
    pub fn from_bundle(bundle: FrameBundle) -> FrameHandle {
        let (inf_w, inf_h) = bundle.inf_image.dimensions();
        let (ui_w, ui_h) = bundle.ui_image.dimensions();
        Arc::new(Self {
            stream_id: bundle.stream_id,
            frame_id: bundle.frame_id,
            pts_ns: bundle.pts_ns,
            map: bundle.map,
            inf_w,
            inf_h,
            ui_w,
            ui_h,
            inf_image: Mutex::new(Some(bundle.inf_image)),
            ui_image: Mutex::new(Some(bundle.ui_image)),
            tracked_boxes: Mutex::new(Vec::new()),
        })
    }

    /// Take the inference image out of the context, releasing its memory as
    /// soon as detection has consumed it.
    pub fn take_inf_image(&self) -> Option<RgbImage> {
        self.inf_image
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Run `f` over the UI image in place. Returns `None` once the image has
    /// been handed to the encoder.
    pub fn with_ui_image<R>(&self, f: impl FnOnce(&mut RgbImage) -> R) -> Option<R> {
        self.ui_image
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .map(f)
    }

    pub fn take_ui_image(&self) -> Option<RgbImage> {
        self.ui_image
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn set_tracks(&self, tracks: Vec<BBox>) {
        *self
            .tracked_boxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = tracks;
    }

    pub fn tracks(&self) -> Vec<BBox> {
        self.tracked_boxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Minimal context for tests that only exercise bookkeeping.
    #[cfg(test)]
    pub(crate) fn synthetic(stream_id: &str, frame_id: i64) -> FrameHandle {
        Arc::new(Self {
            stream_id: stream_id.to_string(),
            frame_id,
            pts_ns: frame_id * 1_000_000,
            map: CoordMap::default(),
            inf_w: 32,
            inf_h: 32,
            ui_w: 64,
            ui_h: 64,
            inf_image: Mutex::new(Some(RgbImage::new(32, 32))),
            ui_image: Mutex::new(Some(RgbImage::new(64, 64))),
            tracked_boxes: Mutex::new(Vec::new()),
        })
    }
}

/// Detector output for one frame, routed back to its stream.
#[derive(Clone, Debug)]
pub struct InferResults {
    pub stream_id: String,
    pub frame_id: i64,
    pub boxes: Vec<BBox>,
}

/// Per-frame tracker output published on the analytics queue.
#[derive(Clone, Debug)]
pub struct TrackerFrameOutput {
    pub stream_id: String,
    pub frame_id: i64,
    pub pts_ns: i64,
    pub tracks: Vec<BBox>,
}
