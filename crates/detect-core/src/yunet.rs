//! ONNX Runtime YuNet face detector.
//!
//! The model emits per-stride classification, objectness and box-delta
//! planes for strides 8/16/32. Decoding follows the reference
//! post-processing: score is `sqrt(cls * obj)`, centers are anchor cell plus
//! delta times stride, sizes are `exp(delta) * stride`, and the surviving
//! candidates go through score-ordered greedy NMS.

use anyhow::{anyhow, Context, Result};
use image::{imageops, imageops::FilterType, RgbImage};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::sync::Mutex;
use tracing::debug;

use crate::{iou, BBox, Detector, DetectorConfig};

const STRIDES: [u32; 3] = [8, 16, 32];

pub struct YuNetDetector {
    cfg: DetectorConfig,
    // ort's Session::run needs &mut; the lock keeps `detect` shareable
    // across the worker pool.
    session: Mutex<Session>,
}

impl YuNetDetector {
    pub fn new(cfg: DetectorConfig) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(cfg.intra_threads.max(1))?
            .commit_from_file(&cfg.model_path)
            .with_context(|| format!("loading detector model {}", cfg.model_path))?;
        debug!(
            "detector model {} loaded ({}x{} input)",
            cfg.model_path, cfg.input_w, cfg.input_h
        );
        Ok(Self {
            cfg,
            session: Mutex::new(session),
        })
    }

    /// Resize to the network input and lay pixels out as planar BGR floats,
    /// the channel order the model was exported with.
    fn preprocess(&self, image: &RgbImage) -> Vec<f32> {
        let (w, h) = (self.cfg.input_w, self.cfg.input_h);
        let resized = if image.dimensions() == (w, h) {
            image.clone()
        } else {
            imageops::resize(image, w, h, FilterType::Triangle)
        };

        let plane = (w * h) as usize;
        let mut data = vec![0f32; 3 * plane];
        for (i, px) in resized.pixels().enumerate() {
            let [r, g, b] = px.0;
            data[i] = f32::from(b);
            data[plane + i] = f32::from(g);
            data[2 * plane + i] = f32::from(r);
        }
        data
    }
}

impl Detector for YuNetDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BBox>> {
        let (src_w, src_h) = image.dimensions();
        if src_w == 0 || src_h == 0 {
            return Ok(Vec::new());
        }

        let input = self.preprocess(image);
        let shape = [
            1usize,
            3,
            self.cfg.input_h as usize,
            self.cfg.input_w as usize,
        ];
        let value = ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("detector session poisoned"))?;
        let outputs = session.run(ort::inputs!["input" => value])?;

        let sx = src_w as f32 / self.cfg.input_w as f32;
        let sy = src_h as f32 / self.cfg.input_h as f32;

        let mut candidates = Vec::with_capacity(512);
        for stride in STRIDES {
            let (_, cls) = outputs[format!("cls_{stride}").as_str()].try_extract_tensor::<f32>()?;
            let (_, obj) = outputs[format!("obj_{stride}").as_str()].try_extract_tensor::<f32>()?;
            let (_, bbox) =
                outputs[format!("bbox_{stride}").as_str()].try_extract_tensor::<f32>()?;
            decode_level(
                &LevelView {
                    stride,
                    cls,
                    obj,
                    bbox,
                },
                self.cfg.input_w,
                self.cfg.input_h,
                (sx, sy),
                (src_w as f32, src_h as f32),
                self.cfg.score_threshold,
                &mut candidates,
            );
        }

        Ok(greedy_nms(
            candidates,
            self.cfg.nms_threshold,
            self.cfg.top_k,
        ))
    }
}

/// One stride level's raw output planes.
pub(crate) struct LevelView<'a> {
    pub stride: u32,
    pub cls: &'a [f32],
    pub obj: &'a [f32],
    pub bbox: &'a [f32],
}

/// Decode one stride level into box candidates in source coordinates.
pub(crate) fn decode_level(
    level: &LevelView<'_>,
    input_w: u32,
    input_h: u32,
    (sx, sy): (f32, f32),
    (src_w, src_h): (f32, f32),
    score_threshold: f32,
    out: &mut Vec<BBox>,
) {
    let stride = level.stride;
    let cols = (input_w / stride) as usize;
    let rows = (input_h / stride) as usize;
    let num = cols * rows;
    if level.cls.len() < num || level.obj.len() < num || level.bbox.len() < num * 4 {
        return;
    }

    for idx in 0..num {
        let score = (level.cls[idx] * level.obj[idx]).max(0.0).sqrt();
        if score < score_threshold {
            continue;
        }

        let y = idx / cols;
        let x = idx - y * cols;

        let dx = level.bbox[idx * 4];
        let dy = level.bbox[idx * 4 + 1];
        let dw = level.bbox[idx * 4 + 2];
        let dh = level.bbox[idx * 4 + 3];

        let cx = (x as f32 + dx) * stride as f32;
        let cy = (y as f32 + dy) * stride as f32;
        let w = dw.exp() * stride as f32;
        let h = dh.exp() * stride as f32;

        let x1 = ((cx - w * 0.5) * sx).max(0.0);
        let y1 = ((cy - h * 0.5) * sy).max(0.0);
        let x2 = ((cx + w * 0.5) * sx).min(src_w);
        let y2 = ((cy + h * 0.5) * sy).min(src_h);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        out.push(BBox::new(x1, y1, x2 - x1, y2 - y1, score));
    }
}

/// Score-descending greedy non-maximum suppression with a top-k cut.
pub(crate) fn greedy_nms(mut candidates: Vec<BBox>, nms_threshold: f32, top_k: usize) -> Vec<BBox> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if top_k > 0 && candidates.len() > top_k {
        candidates.truncate(top_k);
    }

    let mut kept: Vec<BBox> = Vec::with_capacity(candidates.len());
    for cand in candidates {
        if kept.iter().all(|k| iou(&cand, k) <= nms_threshold) {
            kept.push(cand);
        }
    }
    kept
}
