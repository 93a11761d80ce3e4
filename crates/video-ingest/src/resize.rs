//! Derivation of the inference profile from a decoded UI frame.

use image::{imageops, Rgb, RgbImage};

use crate::{types::CoordMap, OutputProfile};

/// Produce the inference-profile image for a UI frame and the coordinate map
/// taking inference coordinates back into UI coordinates.
///
/// With `keep_aspect` the source is fitted inside the profile rectangle and
/// centred on black padding; the returned map then carries the translation
/// that skips the padding bands.
pub(crate) fn derive_inference(ui: &RgbImage, profile: &OutputProfile) -> (RgbImage, CoordMap) {
    let (ui_w, ui_h) = ui.dimensions();
    let (inf_w, inf_h) = (profile.width.max(1), profile.height.max(1));
    let filter = profile.filter.as_filter_type();

    if !profile.keep_aspect || exact_aspect(ui_w, ui_h, inf_w, inf_h) {
        let inf = imageops::resize(ui, inf_w, inf_h, filter);
        let map = CoordMap {
            sx: ui_w as f32 / inf_w as f32,
            sy: ui_h as f32 / inf_h as f32,
            tx: 0.0,
            ty: 0.0,
        };
        return (inf, map);
    }

    let scale = (inf_w as f32 / ui_w as f32).min(inf_h as f32 / ui_h as f32);
    let fit_w = ((ui_w as f32 * scale).round() as u32).clamp(1, inf_w);
    let fit_h = ((ui_h as f32 * scale).round() as u32).clamp(1, inf_h);
    let pad_x = (inf_w - fit_w) / 2;
    let pad_y = (inf_h - fit_h) / 2;

    let fitted = imageops::resize(ui, fit_w, fit_h, filter);
    let mut inf = RgbImage::from_pixel(inf_w, inf_h, Rgb([0, 0, 0]));
    imageops::replace(&mut inf, &fitted, i64::from(pad_x), i64::from(pad_y));

    let sx = ui_w as f32 / fit_w as f32;
    let sy = ui_h as f32 / fit_h as f32;
    let map = CoordMap {
        sx,
        sy,
        tx: -(pad_x as f32) * sx,
        ty: -(pad_y as f32) * sy,
    };
    (inf, map)
}

fn exact_aspect(ui_w: u32, ui_h: u32, inf_w: u32, inf_h: u32) -> bool {
    u64::from(ui_w) * u64::from(inf_h) == u64::from(ui_h) * u64::from(inf_w)
}
