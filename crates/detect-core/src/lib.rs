//! Face detection capability for the streamscrub pipeline.
//!
//! The pipeline consumes detectors through the [`Detector`] trait; the one
//! production implementation is the ONNX [`YuNetDetector`]. Detections and
//! tracks share the [`BBox`] type.

use anyhow::Result;
use image::RgbImage;
use serde::Deserialize;

mod yunet;

pub use yunet::YuNetDetector;

/// A detection or track: an axis-aligned rectangle in inference-frame
/// coordinates plus score and tracking state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    /// `-1` on raw detections; `>= 1` once a tracker has assigned identity.
    pub id: i64,
    pub score: f32,
    /// Set by the tracker for coasted (predicted-only) tracks.
    pub occluded: bool,
}

impl Default for BBox {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            w: 0.0,
            h: 0.0,
            id: -1,
            score: 0.0,
            occluded: false,
        }
    }
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32, score: f32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            score,
            ..Self::default()
        }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }
}

/// Intersection over union of two boxes; 0 when either is degenerate.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let xx1 = a.x.max(b.x);
    let yy1 = a.y.max(b.y);
    let xx2 = (a.x + a.w).min(b.x + b.w);
    let yy2 = (a.y + a.h).min(b.y + b.h);

    let inter = (xx2 - xx1).max(0.0) * (yy2 - yy1).max(0.0);
    if inter <= 0.0 {
        return 0.0;
    }
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

/// Stateless detection capability.
///
/// Implementations must tolerate concurrent `detect` calls from the shared
/// worker pool; the runtime keeps no per-call state on their behalf.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BBox>>;
}

fn default_model_path() -> String {
    "models/face_detection_yunet_2023mar.onnx".to_string()
}

fn default_input_side() -> u32 {
    640
}

fn default_score_threshold() -> f32 {
    0.6
}

fn default_nms_threshold() -> f32 {
    0.3
}

fn default_top_k() -> usize {
    750
}

fn default_intra_threads() -> usize {
    1
}

#[derive(Clone, Debug, Deserialize)]
/// Construction parameters for the production detector.
pub struct DetectorConfig {
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_input_side")]
    pub input_w: u32,
    #[serde(default = "default_input_side")]
    pub input_h: u32,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            input_w: default_input_side(),
            input_h: default_input_side(),
            score_threshold: default_score_threshold(),
            nms_threshold: default_nms_threshold(),
            top_k: default_top_k(),
            intra_threads: default_intra_threads(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = BBox::new(10.0, 10.0, 8.0, 8.0, 0.9);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BBox::new(0.0, 0.0, 4.0, 4.0, 0.9);
        let b = BBox::new(100.0, 100.0, 4.0, 4.0, 0.9);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = BBox::new(0.0, 0.0, 4.0, 4.0, 0.9);
        let b = BBox::new(2.0, 0.0, 4.0, 4.0, 0.9);
        // intersection 8, union 24
        assert!((iou(&a, &b) - 8.0 / 24.0).abs() < 1e-6);
    }

    #[test]
    fn raw_detections_carry_no_identity() {
        let b = BBox::new(1.0, 2.0, 3.0, 4.0, 0.5);
        assert_eq!(b.id, -1);
        assert!(!b.occluded);
    }
}
