//! JPEG encoding and publication of finished frames.

use anyhow::{anyhow, Context, Result};
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use serde::Serialize;

use crate::pipeline::{data::FrameCtx, registry::StreamHub};

// Field order matters: serde serialises struct fields in declaration order
// and the metadata objects are documented byte-for-byte.
#[derive(Serialize)]
struct UiMeta<'a> {
    stream_id: &'a str,
    profile: &'static str,
    frame_id: i64,
    pts_ns: i64,
    w: u32,
    h: u32,
    tracks: usize,
}

#[derive(Serialize)]
struct InfMeta<'a> {
    stream_id: &'a str,
    profile: &'static str,
    frame_id: i64,
    pts_ns: i64,
    w: u32,
    h: u32,
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// Encode the redacted UI image and publish it under the frame's stream
/// keys: `"{id}/ui"` carries the JPEG plus metadata, `"{id}/inf"` metadata
/// only (with the inference dimensions recorded at ingest).
pub fn publish_frame(hub: &StreamHub, ctx: &FrameCtx, ui: &RgbImage, quality: u8) -> Result<()> {
    let tracks = ctx.tracks().len();
    let (w, h) = ui.dimensions();

    let ui_key = format!("{}/ui", ctx.stream_id);
    let inf_key = format!("{}/inf", ctx.stream_id);

    let jpeg = encode_jpeg(ui, quality)?;
    hub.push_jpeg(&ui_key, jpeg);

    let ui_meta = serde_json::to_string(&UiMeta {
        stream_id: &ctx.stream_id,
        profile: "ui",
        frame_id: ctx.frame_id,
        pts_ns: ctx.pts_ns,
        w,
        h,
        tracks,
    })
    .context("serialising ui metadata")?;
    hub.push_meta(&ui_key, ui_meta);

    let inf_meta = serde_json::to_string(&InfMeta {
        stream_id: &ctx.stream_id,
        profile: "inf",
        frame_id: ctx.frame_id,
        pts_ns: ctx.pts_ns,
        w: ctx.inf_w,
        h: ctx.inf_h,
    })
    .context("serialising inf metadata")?;
    hub.push_meta(&inf_key, inf_meta);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ui_metadata_matches_the_documented_object() {
        let meta = serde_json::to_string(&UiMeta {
            stream_id: "cam0",
            profile: "ui",
            frame_id: 0,
            pts_ns: 1_000_000,
            w: 64,
            h: 64,
            tracks: 0,
        })
        .unwrap();
        assert_eq!(
            meta,
            r#"{"stream_id":"cam0","profile":"ui","frame_id":0,"pts_ns":1000000,"w":64,"h":64,"tracks":0}"#
        );
    }

    #[test]
    fn inf_metadata_matches_the_documented_object() {
        let meta = serde_json::to_string(&InfMeta {
            stream_id: "cam0",
            profile: "inf",
            frame_id: 3,
            pts_ns: 99,
            w: 32,
            h: 32,
        })
        .unwrap();
        assert_eq!(
            meta,
            r#"{"stream_id":"cam0","profile":"inf","frame_id":3,"pts_ns":99,"w":32,"h":32}"#
        );
    }

    #[test]
    fn stream_ids_are_json_escaped() {
        let meta = serde_json::to_string(&InfMeta {
            stream_id: "cam\"0\\",
            profile: "inf",
            frame_id: 0,
            pts_ns: 0,
            w: 1,
            h: 1,
        })
        .unwrap();
        assert!(meta.contains(r#""stream_id":"cam\"0\\""#));
    }

    #[test]
    fn encoded_jpeg_round_trips_through_a_decoder() {
        let image = RgbImage::from_pixel(16, 16, image::Rgb([255, 255, 255]));
        let jpeg = encode_jpeg(&image, 75).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (16, 16));
        // White stays white through JPEG.
        assert_eq!(decoded.get_pixel(8, 8), &image::Rgb([255, 255, 255]));
    }
}
