//! End-to-end pipeline tests driving the runtime with scripted sources and
//! detectors: frames in, redacted JPEGs and metadata out.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use image::{Rgb, RgbImage};

use detect_core::{BBox, Detector};
use streamscrub::pipeline::{AppConfig, PipelineRuntime, StreamHub};
use video_ingest::{CaptureError, CoordMap, FrameBundle, FrameSource};

const TEST_CONFIG: &str = r#"
streams:
  - id: cam0
    type: file
    file: { path: "unused.mp4" }
    outputs:
      profiles:
        inference: { width: 32, height: 32 }
        ui: { width: 64, height: 64 }
runtime:
  jpeg_quality: 75
  queues: { infer_in: 64, inf_state_in: 64, det_res: 64, anon_in: 64, enc_in: 64 }
"#;

fn test_config() -> AppConfig {
    serde_yaml::from_str(TEST_CONFIG).expect("test config parses")
}

/// Builds one ingest tick. The inference copy carries the frame id in its
/// top-left pixel so the scripted detector can look up its response.
fn bundle(frame_id: i64) -> FrameBundle {
    let mut inf = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
    inf.put_pixel(0, 0, Rgb([frame_id as u8, 0, 0]));
    FrameBundle {
        stream_id: "cam0".to_string(),
        frame_id,
        pts_ns: frame_id * 1_000_000 + 1_000_000,
        inf_image: inf,
        ui_image: RgbImage::from_pixel(64, 64, Rgb([255, 255, 255])),
        map: CoordMap {
            sx: 2.0,
            sy: 2.0,
            tx: 0.0,
            ty: 0.0,
        },
    }
}

struct ScriptedSource {
    frames: VecDeque<FrameBundle>,
}

impl ScriptedSource {
    fn new(frames: Vec<FrameBundle>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Option<FrameBundle> {
        match self.frames.pop_front() {
            Some(frame) => {
                // Pace the script so downstream stages keep up.
                thread::sleep(Duration::from_millis(3));
                Some(frame)
            }
            None => {
                thread::sleep(timeout.min(Duration::from_millis(10)));
                None
            }
        }
    }

    fn stop(&mut self) {}
}

/// Returns the boxes scripted for the frame id encoded in the image.
struct ScriptedDetector {
    by_frame: HashMap<u8, Vec<BBox>>,
}

impl Detector for ScriptedDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BBox>> {
        let frame_marker = image.get_pixel(0, 0)[0];
        Ok(self.by_frame.get(&frame_marker).cloned().unwrap_or_default())
    }
}

fn build_runtime(
    frames: Vec<FrameBundle>,
    by_frame: HashMap<u8, Vec<BBox>>,
) -> (Arc<StreamHub>, PipelineRuntime) {
    let config = test_config();
    let hub = Arc::new(StreamHub::default());
    hub.register_stream("cam0/ui");
    hub.register_stream("cam0/inf");

    let frames = std::sync::Mutex::new(Some(frames));
    let runtime = PipelineRuntime::new(hub.clone(), config.streams, config.runtime)
        .with_detector(Arc::new(ScriptedDetector { by_frame }))
        .with_source_factory(move |_cfg| {
            let frames = frames.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(ScriptedSource::new(frames)) as Box<dyn FrameSource>)
        });
    (hub, runtime)
}

fn wait_for_jpeg(hub: &StreamHub, key: &str, deadline: Duration) -> Option<Arc<Vec<u8>>> {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if let Some(jpeg) = hub.get(key).and_then(|s| s.snapshot()) {
            return Some(jpeg);
        }
        thread::sleep(Duration::from_millis(10));
    }
    None
}

#[test]
fn single_frame_passes_through_unmodified() {
    let (hub, mut runtime) = build_runtime(vec![bundle(0)], HashMap::new());
    runtime.start().expect("runtime starts");

    let jpeg = wait_for_jpeg(&hub, "cam0/ui", Duration::from_secs(5))
        .expect("a frame reaches the registry");
    let decoded = image::load_from_memory(&jpeg).expect("valid JPEG").to_rgb8();
    assert_eq!(decoded.dimensions(), (64, 64));
    // No detections, so the white UI frame is published untouched.
    for &(x, y) in &[(0u32, 0u32), (31, 31), (63, 63)] {
        assert_eq!(decoded.get_pixel(x, y), &Rgb([255, 255, 255]), "({x},{y})");
    }

    // Metadata is published right after the JPEG; give it the same window.
    let wait_for_meta = |key: &str| -> String {
        let start = Instant::now();
        loop {
            let meta = hub.get(key).expect("key registered").meta();
            if meta != "{}" || start.elapsed() > Duration::from_secs(5) {
                return meta;
            }
            thread::sleep(Duration::from_millis(10));
        }
    };
    assert_eq!(
        wait_for_meta("cam0/ui"),
        r#"{"stream_id":"cam0","profile":"ui","frame_id":0,"pts_ns":1000000,"w":64,"h":64,"tracks":0}"#
    );
    assert_eq!(
        wait_for_meta("cam0/inf"),
        r#"{"stream_id":"cam0","profile":"inf","frame_id":0,"pts_ns":1000000,"w":32,"h":32}"#
    );

    runtime.stop();
}

#[test]
fn track_lifecycle_and_ordering_on_the_analytics_output() {
    // Frames 0..=2 carry one strong detection, frames 3..=6 none: the track
    // is born and emitted immediately, then coasts occluded.
    let det = BBox::new(10.0, 10.0, 8.0, 8.0, 0.9);
    let mut by_frame = HashMap::new();
    for frame in 0..=2u8 {
        by_frame.insert(frame, vec![det]);
    }

    let frames: Vec<FrameBundle> = (0..=6).map(bundle).collect();
    let (_hub, mut runtime) = build_runtime(frames, by_frame);
    runtime.start().expect("runtime starts");

    let mut outputs = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while outputs.len() < 7 && Instant::now() < deadline {
        if let Some(out) = runtime.pop_tracker_output(Duration::from_millis(200)) {
            outputs.push(out);
        }
    }
    runtime.stop();

    assert_eq!(outputs.len(), 7, "all frames must produce tracker output");

    // Strictly increasing frame ids (the ordering stage's guarantee).
    for pair in outputs.windows(2) {
        assert!(pair[0].frame_id < pair[1].frame_id);
    }

    for out in &outputs[0..=2] {
        assert_eq!(out.tracks.len(), 1);
        assert_eq!(out.tracks[0].id, 1);
        assert!(!out.tracks[0].occluded);
        assert!((out.tracks[0].x - 10.0).abs() < 1.5);
    }
    for out in &outputs[3..=6] {
        assert_eq!(out.tracks.len(), 1, "frame {}: track must coast", out.frame_id);
        assert_eq!(out.tracks[0].id, 1);
        assert!(out.tracks[0].occluded);
    }
}

#[test]
fn redaction_modifies_only_the_tracked_region() {
    // The first detection already yields a track; published JPEGs must be
    // redacted inside the mapped box and untouched elsewhere.
    let det = BBox::new(8.0, 8.0, 8.0, 8.0, 0.9);
    let mut by_frame = HashMap::new();
    for frame in 0..=5u8 {
        by_frame.insert(frame, vec![det]);
    }

    // Patterned UI frame so pixelation is observable.
    let mut frames: Vec<FrameBundle> = (0..=5).map(bundle).collect();
    for frame in &mut frames {
        frame.ui_image = RgbImage::from_fn(64, 64, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
    }

    let (hub, mut runtime) = build_runtime(frames, by_frame);
    runtime.start().expect("runtime starts");

    // Wait until a frame with a confirmed track is published.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut redacted = None;
    while Instant::now() < deadline && redacted.is_none() {
        if let Some(state) = hub.get("cam0/ui") {
            if state.meta().contains(r#""tracks":1"#) {
                redacted = state.snapshot();
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    runtime.stop();

    let jpeg = redacted.expect("a redacted frame reaches the registry");
    let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();

    // The box maps to (16,16)..(32,32). JPEG is lossy, so compare region
    // variance instead of exact bytes: pixelation flattens the checkerboard.
    let contrast = |x0: u32, y0: u32, w: u32, h: u32| -> i32 {
        let mut min = 255i32;
        let mut max = 0i32;
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                let lum = i32::from(decoded.get_pixel(x, y)[0]);
                min = min.min(lum);
                max = max.max(lum);
            }
        }
        max - min
    };
    let inside = contrast(18, 18, 12, 12);
    let outside = contrast(40, 40, 12, 12);
    assert!(
        inside < outside / 2,
        "redacted region must lose its contrast (inside {inside}, outside {outside})"
    );
}

#[test]
fn shutdown_joins_every_worker_promptly() {
    let (_hub, mut runtime) = build_runtime(Vec::new(), HashMap::new());
    runtime.start().expect("runtime starts");
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    runtime.stop();
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "stop must join all workers within a couple of pop timeouts"
    );
}
