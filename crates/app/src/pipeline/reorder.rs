//! Reassembly of out-of-order detector results with their frames.
//!
//! The detector pool finishes frames in arbitrary order while the tracker
//! needs strictly ordered updates. The buffer holds frames and detections
//! keyed by frame id and releases them in order, advancing without a
//! detection once the reorder window is exceeded.

use std::collections::BTreeMap;

use detect_core::BBox;

use crate::pipeline::data::{FrameHandle, InferResults};

pub const DEFAULT_REORDER_WINDOW: i64 = 5;
pub const DEFAULT_PENDING_CAP: usize = 500;

/// A frame released by the buffer, ready for a tracker update.
pub struct Ready {
    pub ctx: FrameHandle,
    pub dets: Vec<BBox>,
    /// True when the reorder window expired and the frame advances with
    /// empty detections.
    pub predicted: bool,
}

pub struct ReorderBuffer {
    pending_frames: BTreeMap<i64, FrameHandle>,
    pending_dets: BTreeMap<i64, InferResults>,
    next_frame_id: i64,
    reorder_window: i64,
    pending_cap: usize,
}

impl ReorderBuffer {
    pub fn new(reorder_window: i64, pending_cap: usize) -> Self {
        Self {
            pending_frames: BTreeMap::new(),
            pending_dets: BTreeMap::new(),
            next_frame_id: -1,
            reorder_window: reorder_window.max(0),
            pending_cap: pending_cap.max(1),
        }
    }

    pub fn insert_frame(&mut self, ctx: FrameHandle) {
        self.pending_frames.insert(ctx.frame_id, ctx);
    }

    pub fn insert_dets(&mut self, det: InferResults) {
        self.pending_dets.insert(det.frame_id, det);
    }

    /// Release the next in-order frame, if one is currently releasable.
    ///
    /// A frame is releasable when its detections have arrived, or when the
    /// gap between it and the newest id seen exceeds the reorder window (the
    /// predict-only fallback). A missing frame id is skipped over entirely.
    pub fn pop_ready(&mut self) -> Option<Ready> {
        loop {
            if self.next_frame_id < 0 {
                self.next_frame_id = *self.pending_frames.keys().next()?;
            }

            let next = self.next_frame_id;
            let frame_present = self.pending_frames.contains_key(&next);

            if frame_present && self.pending_dets.contains_key(&next) {
                let ctx = self.pending_frames.remove(&next).expect("checked above");
                let det = self.pending_dets.remove(&next).expect("checked above");
                self.next_frame_id += 1;
                return Some(Ready {
                    ctx,
                    dets: det.boxes,
                    predicted: false,
                });
            }

            if !frame_present {
                match self.pending_frames.keys().next() {
                    Some(&first) if first > next => {
                        self.next_frame_id = first;
                        continue;
                    }
                    _ => return None,
                }
            }

            let latest_frame = self
                .pending_frames
                .keys()
                .next_back()
                .copied()
                .unwrap_or(next);
            let latest_det = self
                .pending_dets
                .keys()
                .next_back()
                .copied()
                .unwrap_or(next);
            let latest_seen = latest_frame.max(latest_det);
            if latest_seen - next > self.reorder_window {
                let ctx = self.pending_frames.remove(&next).expect("checked above");
                self.next_frame_id += 1;
                return Some(Ready {
                    ctx,
                    dets: Vec::new(),
                    predicted: true,
                });
            }
            return None;
        }
    }

    /// Drop the oldest pending entries once either map outgrows the cap.
    pub fn enforce_caps(&mut self) {
        while self.pending_frames.len() > self.pending_cap {
            self.pending_frames.pop_first();
        }
        while self.pending_dets.len() > self.pending_cap {
            self.pending_dets.pop_first();
        }
    }

    #[cfg(test)]
    fn pending_counts(&self) -> (usize, usize) {
        (self.pending_frames.len(), self.pending_dets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::data::FrameCtx;

    fn dets(frame_id: i64, boxes: Vec<BBox>) -> InferResults {
        InferResults {
            stream_id: "cam0".to_string(),
            frame_id,
            boxes,
        }
    }

    fn marker_box(frame_id: i64) -> BBox {
        BBox::new(frame_id as f32, 0.0, 4.0, 4.0, 0.9)
    }

    #[test]
    fn releases_in_order_when_everything_arrives() {
        let mut buf = ReorderBuffer::new(DEFAULT_REORDER_WINDOW, DEFAULT_PENDING_CAP);
        for id in 0..3 {
            buf.insert_frame(FrameCtx::synthetic("cam0", id));
        }
        // Detections arrive out of order.
        for id in [2, 0, 1] {
            buf.insert_dets(dets(id, vec![marker_box(id)]));
        }

        let mut released = Vec::new();
        while let Some(ready) = buf.pop_ready() {
            assert!(!ready.predicted);
            assert_eq!(ready.dets[0].x, ready.ctx.frame_id as f32);
            released.push(ready.ctx.frame_id);
        }
        assert_eq!(released, vec![0, 1, 2]);
    }

    #[test]
    fn detections_are_exact_match_or_empty() {
        let mut buf = ReorderBuffer::new(2, DEFAULT_PENDING_CAP);
        for id in 0..6 {
            buf.insert_frame(FrameCtx::synthetic("cam0", id));
            if id != 1 {
                buf.insert_dets(dets(id, vec![marker_box(id)]));
            }
        }

        let mut seen = Vec::new();
        while let Some(ready) = buf.pop_ready() {
            if ready.ctx.frame_id == 1 {
                assert!(ready.predicted);
                assert!(ready.dets.is_empty());
            } else {
                // Never another frame's detections.
                assert_eq!(ready.dets[0].x, ready.ctx.frame_id as f32);
            }
            seen.push(ready.ctx.frame_id);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn lost_detection_is_skipped_after_the_window_closes() {
        // Frames 0..=6 present; the detection for frame 2 never arrives.
        let mut buf = ReorderBuffer::new(DEFAULT_REORDER_WINDOW, DEFAULT_PENDING_CAP);
        for id in 0..=6 {
            buf.insert_frame(FrameCtx::synthetic("cam0", id));
        }
        for id in [0, 1, 3, 4, 5, 6] {
            buf.insert_dets(dets(id, vec![marker_box(id)]));
        }

        // 0 and 1 release normally, then the buffer holds at 2: the newest
        // id seen (6) is not yet past the window (6 - 2 <= 5).
        assert_eq!(buf.pop_ready().map(|r| r.ctx.frame_id), Some(0));
        assert_eq!(buf.pop_ready().map(|r| r.ctx.frame_id), Some(1));
        assert!(buf.pop_ready().is_none());

        // Frames 7 and 8 push the horizon past the window for frame 2.
        for id in 7..=8 {
            buf.insert_frame(FrameCtx::synthetic("cam0", id));
            buf.insert_dets(dets(id, vec![marker_box(id)]));
        }

        let ready = buf.pop_ready().expect("window expired, frame 2 releases");
        assert_eq!(ready.ctx.frame_id, 2);
        assert!(ready.predicted);
        assert!(ready.dets.is_empty());

        let mut rest = Vec::new();
        while let Some(ready) = buf.pop_ready() {
            assert!(!ready.predicted);
            rest.push(ready.ctx.frame_id);
        }
        assert_eq!(rest, vec![3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn predict_only_happens_exactly_once_per_frame() {
        let mut buf = ReorderBuffer::new(1, DEFAULT_PENDING_CAP);
        for id in 0..=3 {
            buf.insert_frame(FrameCtx::synthetic("cam0", id));
            if id != 0 {
                buf.insert_dets(dets(id, vec![marker_box(id)]));
            }
        }

        let mut predicted = 0;
        let mut total = 0;
        while let Some(ready) = buf.pop_ready() {
            if ready.predicted {
                predicted += 1;
                assert_eq!(ready.ctx.frame_id, 0);
            }
            total += 1;
        }
        assert_eq!(predicted, 1);
        assert_eq!(total, 4);
    }

    #[test]
    fn missing_frame_id_is_jumped_over() {
        let mut buf = ReorderBuffer::new(DEFAULT_REORDER_WINDOW, DEFAULT_PENDING_CAP);
        // Frame 0 released, then frame 1 lost to ingest drop-oldest: the
        // stream resumes at 3.
        buf.insert_frame(FrameCtx::synthetic("cam0", 0));
        buf.insert_dets(dets(0, vec![marker_box(0)]));
        assert_eq!(buf.pop_ready().map(|r| r.ctx.frame_id), Some(0));

        for id in 3..=4 {
            buf.insert_frame(FrameCtx::synthetic("cam0", id));
            buf.insert_dets(dets(id, vec![marker_box(id)]));
        }
        assert_eq!(buf.pop_ready().map(|r| r.ctx.frame_id), Some(3));
        assert_eq!(buf.pop_ready().map(|r| r.ctx.frame_id), Some(4));
    }

    #[test]
    fn caps_evict_the_oldest_entries() {
        let mut buf = ReorderBuffer::new(DEFAULT_REORDER_WINDOW, 10);
        for id in 0..25 {
            buf.insert_dets(dets(id, Vec::new()));
        }
        buf.enforce_caps();
        let (frames, dets_len) = buf.pending_counts();
        assert_eq!(frames, 0);
        assert_eq!(dets_len, 10);
    }
}
