//! In-place redaction of tracked regions on the UI frame.

use image::{imageops, imageops::FilterType, RgbImage};
use serde::Deserialize;

use detect_core::BBox;
use video_ingest::CoordMap;

fn default_method() -> String {
    "pixelate".to_string()
}

fn default_pixelation_divisor() -> u32 {
    10
}

fn default_blur_kernel() -> u32 {
    31
}

#[derive(Clone, Debug, Deserialize)]
pub struct AnonymizerConfig {
    /// Supported methods: "pixelate", "blur".
    #[serde(default = "default_method")]
    pub method: String,
    /// Pixelate: downscale the region by this factor, then upsample with
    /// nearest-neighbor.
    #[serde(default = "default_pixelation_divisor")]
    pub pixelation_divisor: u32,
    /// Blur: gaussian kernel size (forced odd and >= 3).
    #[serde(default = "default_blur_kernel")]
    pub blur_kernel: u32,
}

impl Default for AnonymizerConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            pixelation_divisor: default_pixelation_divisor(),
            blur_kernel: default_blur_kernel(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Method {
    Pixelate,
    Blur,
}

pub struct Anonymizer {
    method: Method,
    pixelation_divisor: u32,
    blur_kernel: u32,
}

/// An axis-aligned pixel rectangle on the UI frame, already clipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct UiRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Anonymizer {
    pub fn new(cfg: AnonymizerConfig) -> Self {
        let method = if cfg.method.eq_ignore_ascii_case("blur") {
            Method::Blur
        } else {
            Method::Pixelate
        };
        let mut blur_kernel = cfg.blur_kernel.max(3);
        if blur_kernel % 2 == 0 {
            blur_kernel += 1;
        }
        Self {
            method,
            pixelation_divisor: cfg.pixelation_divisor.max(2),
            blur_kernel,
        }
    }

    /// Redact every mapped box on `ui`, clipped to the image rectangle.
    /// Pixels outside the mapped boxes are left untouched.
    pub fn apply(&self, ui: &mut RgbImage, boxes_inf_space: &[BBox], map: CoordMap) {
        let (ui_w, ui_h) = ui.dimensions();
        if ui_w == 0 || ui_h == 0 {
            return;
        }

        for b in boxes_inf_space {
            if b.w <= 1.0 || b.h <= 1.0 {
                continue;
            }
            let Some(rect) = map_box_to_ui(b, map, ui_w, ui_h) else {
                continue;
            };

            let roi = imageops::crop_imm(ui, rect.x, rect.y, rect.w, rect.h).to_image();
            let redacted = match self.method {
                Method::Pixelate => self.pixelate(&roi),
                Method::Blur => self.blur(&roi),
            };
            imageops::replace(ui, &redacted, i64::from(rect.x), i64::from(rect.y));
        }
    }

    fn pixelate(&self, roi: &RgbImage) -> RgbImage {
        let (w, h) = roi.dimensions();
        let tw = (w / self.pixelation_divisor).max(2);
        let th = (h / self.pixelation_divisor).max(2);
        let tiny = imageops::resize(roi, tw, th, FilterType::Triangle);
        imageops::resize(&tiny, w, h, FilterType::Nearest)
    }

    fn blur(&self, roi: &RgbImage) -> RgbImage {
        // OpenCV's automatic sigma for a given kernel size.
        let k = self.blur_kernel as f32;
        let sigma = 0.3 * ((k - 1.0) * 0.5 - 1.0) + 0.8;
        imageops::blur(roi, sigma)
    }
}

/// Map an inference-space box into a clipped UI pixel rectangle.
///
/// Returns `None` for rectangles that end up smaller than 2x2 after
/// rounding and clipping.
pub(crate) fn map_box_to_ui(b: &BBox, map: CoordMap, ui_w: u32, ui_h: u32) -> Option<UiRect> {
    let x = (b.x * map.sx + map.tx).round() as i64;
    let y = (b.y * map.sy + map.ty).round() as i64;
    let w = (b.w * map.sx).round() as i64;
    let h = (b.h * map.sy).round() as i64;

    let x0 = x.clamp(0, i64::from(ui_w));
    let y0 = y.clamp(0, i64::from(ui_h));
    let x1 = (x + w).clamp(0, i64::from(ui_w));
    let y1 = (y + h).clamp(0, i64::from(ui_h));

    let cw = x1 - x0;
    let ch = y1 - y0;
    if cw < 2 || ch < 2 {
        return None;
    }
    Some(UiRect {
        x: x0 as u32,
        y: y0 as u32,
        w: cw as u32,
        h: ch as u32,
    })
}
