//! Per-stream multi-object tracking.
//!
//! The production tracker is a detection-driven IoU tracker: constant
//! velocity prediction, a two-pass greedy association (high-confidence
//! detections first, leftovers against low-confidence ones), and simple
//! hit/miss lifecycle counters deciding birth, confirmation and death.

use detect_core::{iou, BBox};
use serde::Deserialize;
use tracing::trace;

fn default_high_thresh() -> f32 {
    0.6
}

fn default_low_thresh() -> f32 {
    0.2
}

fn default_match_iou_thresh() -> f32 {
    0.3
}

fn default_low_match_iou_thresh() -> f32 {
    0.2
}

fn default_min_hits() -> u32 {
    2
}

fn default_max_missed() -> u32 {
    20
}

#[derive(Clone, Debug, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_high_thresh")]
    pub high_thresh: f32,
    #[serde(default = "default_low_thresh")]
    pub low_thresh: f32,
    #[serde(default = "default_match_iou_thresh")]
    pub match_iou_thresh: f32,
    #[serde(default = "default_low_match_iou_thresh")]
    pub low_match_iou_thresh: f32,
    #[serde(default = "default_min_hits")]
    pub min_hits: u32,
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            high_thresh: default_high_thresh(),
            low_thresh: default_low_thresh(),
            match_iou_thresh: default_match_iou_thresh(),
            low_match_iou_thresh: default_low_match_iou_thresh(),
            min_hits: default_min_hits(),
            max_missed: default_max_missed(),
        }
    }
}

/// Stateful tracking capability, one instance per stream.
pub trait Tracker: Send {
    fn update(&mut self, detections: &[BBox]) -> Vec<BBox>;
}

pub fn create_tracker(cfg: TrackerConfig) -> Box<dyn Tracker> {
    Box::new(IouTracker::new(cfg))
}

struct TrackState {
    id: i64,
    bbox: BBox,
    age: u32,
    hits: u32,
    missed: u32,
    vx: f32,
    vy: f32,
    vw: f32,
    vh: f32,
}

pub struct IouTracker {
    cfg: TrackerConfig,
    next_id: i64,
    tracks: Vec<TrackState>,
}

const VELOCITY_ALPHA: f32 = 0.5;

impl IouTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            next_id: 1,
            tracks: Vec::new(),
        }
    }

    fn apply_match(track: &mut TrackState, det: &BBox) {
        let new_vx = det.x - track.bbox.x;
        let new_vy = det.y - track.bbox.y;
        let new_vw = det.w - track.bbox.w;
        let new_vh = det.h - track.bbox.h;

        track.vx = VELOCITY_ALPHA * new_vx + (1.0 - VELOCITY_ALPHA) * track.vx;
        track.vy = VELOCITY_ALPHA * new_vy + (1.0 - VELOCITY_ALPHA) * track.vy;
        track.vw = VELOCITY_ALPHA * new_vw + (1.0 - VELOCITY_ALPHA) * track.vw;
        track.vh = VELOCITY_ALPHA * new_vh + (1.0 - VELOCITY_ALPHA) * track.vh;

        track.bbox = *det;
        track.hits += 1;
        track.missed = 0;
    }

    /// Greedy IoU matching over the candidate pairs, best overlap first.
    /// Ties keep the (track, detection) generation order because the sort is
    /// stable.
    fn match_greedy(
        &mut self,
        track_candidates: &[usize],
        det_candidates: &[usize],
        detections: &[BBox],
        iou_thresh: f32,
    ) -> (Vec<usize>, Vec<usize>) {
        struct PairScore {
            ti: usize,
            di: usize,
            iou: f32,
        }

        let mut candidates = Vec::with_capacity(track_candidates.len() * det_candidates.len());
        for &ti in track_candidates {
            for &di in det_candidates {
                let overlap = iou(&self.tracks[ti].bbox, &detections[di]);
                if overlap >= iou_thresh {
                    candidates.push(PairScore {
                        ti,
                        di,
                        iou: overlap,
                    });
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.iou
                .partial_cmp(&a.iou)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut track_taken = vec![false; self.tracks.len()];
        let mut det_taken = vec![false; detections.len()];
        for c in &candidates {
            if track_taken[c.ti] || det_taken[c.di] {
                continue;
            }
            track_taken[c.ti] = true;
            det_taken[c.di] = true;
            Self::apply_match(&mut self.tracks[c.ti], &detections[c.di]);
        }

        let unmatched_tracks = track_candidates
            .iter()
            .copied()
            .filter(|&ti| !track_taken[ti])
            .collect();
        let unmatched_dets = det_candidates
            .iter()
            .copied()
            .filter(|&di| !det_taken[di])
            .collect();
        (unmatched_tracks, unmatched_dets)
    }
}

impl Tracker for IouTracker {
    fn update(&mut self, detections: &[BBox]) -> Vec<BBox> {
        for t in &mut self.tracks {
            t.age += 1;
            t.missed += 1;
            // Constant-velocity prediction keeps boxes alive across short
            // occlusions.
            t.bbox.x += t.vx;
            t.bbox.y += t.vy;
            t.bbox.w = (t.bbox.w + t.vw).max(1.0);
            t.bbox.h = (t.bbox.h + t.vh).max(1.0);
        }

        let track_indices: Vec<usize> = (0..self.tracks.len()).collect();
        let mut high = Vec::with_capacity(detections.len());
        let mut low = Vec::with_capacity(detections.len());
        for (i, det) in detections.iter().enumerate() {
            if det.score >= self.cfg.high_thresh {
                high.push(i);
            } else if det.score >= self.cfg.low_thresh {
                low.push(i);
            }
        }

        let (unmatched_tracks, unmatched_high) =
            self.match_greedy(&track_indices, &high, detections, self.cfg.match_iou_thresh);
        let (_, _) = self.match_greedy(
            &unmatched_tracks,
            &low,
            detections,
            self.cfg.low_match_iou_thresh,
        );

        for di in unmatched_high {
            let mut bbox = detections[di];
            bbox.id = self.next_id;
            bbox.occluded = false;
            self.tracks.push(TrackState {
                id: self.next_id,
                bbox,
                age: 1,
                hits: 1,
                missed: 0,
                vx: 0.0,
                vy: 0.0,
                vw: 0.0,
                vh: 0.0,
            });
            self.next_id += 1;
        }

        let max_missed = self.cfg.max_missed;
        self.tracks.retain(|t| {
            let keep = t.missed <= max_missed;
            if !keep {
                trace!(id = t.id, age = t.age, "track expired");
            }
            keep
        });

        let mut out = Vec::with_capacity(self.tracks.len());
        for t in &self.tracks {
            // Tentative tracks are suppressed only while coasting.
            if t.hits < self.cfg.min_hits && t.missed > 0 {
                continue;
            }
            let mut b = t.bbox;
            b.id = t.id;
            b.occluded = t.missed > 0;
            out.push(b);
        }
        out
    }
}
