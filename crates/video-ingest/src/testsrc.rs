//! Deterministic synthetic source for tests and demos.

use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use crate::{
    resize::derive_inference,
    types::{join_profiles, CaptureError, FrameBundle, FrameSource, MapLatch},
    OutputProfile, ResizeFilter,
};

/// Emits a moving bright square over a dark background at a fixed rate.
///
/// The pattern is a pure function of the frame index, so tests can predict
/// pixel content for any frame.
pub struct SyntheticSource {
    stream_id: String,
    ui: OutputProfile,
    inf: OutputProfile,
    frame_id: i64,
    next_due: Option<Instant>,
    latch: Option<MapLatch>,
}

impl SyntheticSource {
    pub fn new(stream_id: impl Into<String>, ui_w: u32, ui_h: u32, inf_w: u32, inf_h: u32, fps: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            ui: OutputProfile {
                width: ui_w.max(8),
                height: ui_h.max(8),
                fps: fps.max(1),
                keep_aspect: false,
                filter: ResizeFilter::Linear,
            },
            inf: OutputProfile {
                width: inf_w.max(4),
                height: inf_h.max(4),
                fps: fps.max(1),
                keep_aspect: false,
                filter: ResizeFilter::Area,
            },
            frame_id: 0,
            next_due: None,
            latch: None,
        }
    }

    fn render_ui(&self) -> RgbImage {
        let (w, h) = (self.ui.width, self.ui.height);
        let mut img = RgbImage::from_pixel(w, h, Rgb([32, 32, 32]));
        let side = (w.min(h) / 4).max(2);
        let span = w - side;
        let x0 = ((self.frame_id as u32) * 4) % span.max(1);
        let y0 = (h - side) / 2;
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                img.put_pixel(x, y, Rgb([235, 235, 235]));
            }
        }
        img
    }
}

impl FrameSource for SyntheticSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Option<FrameBundle> {
        let interval = Duration::from_nanos(1_000_000_000 / u64::from(self.ui.fps));
        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return None;
            }
            std::thread::sleep(wait);
        }
        self.next_due = Some(due.max(now) + interval);

        let ui_image = self.render_ui();
        let (inf_image, derived_map) = derive_inference(&ui_image, &self.inf);
        let latch = *self
            .latch
            .get_or_insert_with(|| MapLatch::new(&ui_image, &inf_image, derived_map));
        let map = latch.accept(&ui_image, &inf_image)?;

        let pts_ns = self.frame_id * (1_000_000_000 / i64::from(self.ui.fps));
        let bundle = join_profiles(
            &self.stream_id,
            self.frame_id,
            (ui_image, pts_ns),
            (inf_image, pts_ns),
            map,
        )?;
        self.frame_id += 1;
        Some(bundle)
    }

    fn stop(&mut self) {}
}
