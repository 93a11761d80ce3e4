//! Debug overlay drawing track outlines on the UI frame.

use image::{Rgb, RgbImage};

use detect_core::BBox;
use video_ingest::CoordMap;

use crate::pipeline::anonymize::map_box_to_ui;

const LIVE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const COASTING_COLOR: Rgb<u8> = Rgb([255, 165, 0]);
const BORDER: u32 = 2;

/// Outline every mapped track box. Coasting tracks are drawn in orange.
pub fn draw_tracks(ui: &mut RgbImage, boxes: &[BBox], map: CoordMap) {
    let (ui_w, ui_h) = ui.dimensions();
    if ui_w == 0 || ui_h == 0 {
        return;
    }

    for b in boxes {
        let Some(rect) = map_box_to_ui(b, map, ui_w, ui_h) else {
            continue;
        };
        let color = if b.occluded {
            COASTING_COLOR
        } else {
            LIVE_COLOR
        };

        let border = BORDER.min(rect.w / 2).min(rect.h / 2).max(1);
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                let on_edge = x < rect.x + border
                    || x >= rect.x + rect.w - border
                    || y < rect.y + border
                    || y >= rect.y + rect.h - border;
                if on_edge {
                    ui.put_pixel(x, y, color);
                }
            }
        }
    }
}
