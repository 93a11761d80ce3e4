//! Pipeline runtime: builds per-stream pipes, spawns the shared detector
//! pool and the per-stream workers, and coordinates shutdown.
//!
//! Every inter-stage edge is a drop-oldest bounded queue, so no producer
//! ever blocks; every consumer blocks at most 200 ms at a time, which bounds
//! how long `stop` can take to drain the thread set.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use tracing::{debug, error, warn};

use detect_core::{Detector, YuNetDetector};
use video_ingest::{make_dual_source, CaptureError, FrameSource};

use crate::pipeline::{
    anonymize::Anonymizer,
    config::{OrderingOptions, RuntimeOptions, StreamConfig},
    data::{FrameCtx, FrameHandle, InferResults, TrackerFrameOutput},
    encode::publish_frame,
    overlay,
    queue::BoundedQueue,
    registry::StreamHub,
    reorder::ReorderBuffer,
    telemetry,
    tracker::{create_tracker, TrackerConfig},
};

const POP_TIMEOUT: Duration = Duration::from_millis(200);
const INGEST_READ_TIMEOUT: Duration = Duration::from_millis(100);
const DRAIN_FIRST_POP: Duration = Duration::from_millis(2);

/// Builds a frame source for one expanded stream spec.
pub type SourceFactory =
    Box<dyn Fn(&StreamConfig) -> Result<Box<dyn FrameSource>, CaptureError> + Send + Sync>;

/// Queues owned by one stream's pipeline.
pub(crate) struct StreamPipe {
    pub(crate) stream_id: String,
    pub(crate) inf_state_in: BoundedQueue<FrameHandle>,
    pub(crate) det_res: BoundedQueue<InferResults>,
    pub(crate) anon_in: BoundedQueue<FrameHandle>,
    pub(crate) enc_in: BoundedQueue<FrameHandle>,
}

impl StreamPipe {
    fn new(stream_id: String, opt: &RuntimeOptions) -> Self {
        let caps = &opt.queues;
        Self {
            stream_id,
            inf_state_in: BoundedQueue::new(caps.inf_state_in),
            det_res: BoundedQueue::new(caps.det_res),
            anon_in: BoundedQueue::new(caps.anon_in),
            enc_in: BoundedQueue::new(caps.enc_in),
        }
    }

    fn stop(&self) {
        self.inf_state_in.stop();
        self.det_res.stop();
        self.anon_in.stop();
        self.enc_in.stop();
    }
}

pub struct PipelineRuntime {
    hub: Arc<StreamHub>,
    streams: Vec<StreamConfig>,
    opt: RuntimeOptions,
    running: Arc<AtomicBool>,
    infer_in: Arc<BoundedQueue<FrameHandle>>,
    analytics_out: Arc<BoundedQueue<TrackerFrameOutput>>,
    pipes: Vec<Arc<StreamPipe>>,
    workers: Vec<JoinHandle<()>>,
    detector_override: Option<Arc<dyn Detector>>,
    source_factory: SourceFactory,
    detector: Option<Arc<dyn Detector>>,
    anonymizer: Option<Arc<Anonymizer>>,
}

impl PipelineRuntime {
    pub fn new(hub: Arc<StreamHub>, streams: Vec<StreamConfig>, opt: RuntimeOptions) -> Self {
        let infer_in = Arc::new(BoundedQueue::new(opt.queues.infer_in));
        let analytics_out = Arc::new(BoundedQueue::new(opt.queues.analytics));
        Self {
            hub,
            streams,
            opt,
            running: Arc::new(AtomicBool::new(false)),
            infer_in,
            analytics_out,
            pipes: Vec::new(),
            workers: Vec::new(),
            detector_override: None,
            source_factory: Box::new(|cfg| make_dual_source(cfg.source_spec())),
            detector: None,
            anonymizer: None,
        }
    }

    /// Use a pre-built detector instead of constructing one from the config.
    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector_override = Some(detector);
        self
    }

    /// Use a custom source factory (tests inject scripted sources here).
    pub fn with_source_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&StreamConfig) -> Result<Box<dyn FrameSource>, CaptureError> + Send + Sync + 'static,
    {
        self.source_factory = Box::new(factory);
        self
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let detector: Arc<dyn Detector> = match self.detector_override.clone() {
            Some(detector) => detector,
            None => match YuNetDetector::new(self.opt.detector.clone()) {
                Ok(detector) => Arc::new(detector),
                Err(err) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(err.context("constructing detector"));
                }
            },
        };
        let anonymizer = Arc::new(Anonymizer::new(self.opt.anonymizer.clone()));
        self.detector = Some(detector.clone());
        self.anonymizer = Some(anonymizer.clone());

        self.pipes = self
            .streams
            .iter()
            .map(|s| Arc::new(StreamPipe::new(s.id.clone(), &self.opt)))
            .collect();
        let pipes_by_id: Arc<HashMap<String, Arc<StreamPipe>>> = Arc::new(
            self.pipes
                .iter()
                .map(|p| (p.stream_id.clone(), p.clone()))
                .collect(),
        );

        for i in 0..self.opt.inf_workers.max(1) {
            let running = self.running.clone();
            let infer_in = self.infer_in.clone();
            let pipes = pipes_by_id.clone();
            let detector = detector.clone();
            let handle = telemetry::spawn_thread(format!("infer-{i}"), move || {
                infer_loop(running, infer_in, pipes, detector)
            })
            .context("spawning detector worker")?;
            self.workers.push(handle);
        }

        let mut started_streams = 0usize;
        for (cfg, pipe) in self.streams.iter().zip(self.pipes.clone()) {
            let source = match (self.source_factory)(cfg) {
                Ok(source) => source,
                Err(err) => {
                    warn!("stream {}: source construction failed: {err}", cfg.id);
                    continue;
                }
            };

            let id = &cfg.id;
            let spawn = |name: String, f: Box<dyn FnOnce() + Send>| {
                telemetry::spawn_thread(name, f).context("spawning stream worker")
            };

            {
                let running = self.running.clone();
                let infer_in = self.infer_in.clone();
                let pipe = pipe.clone();
                self.workers.push(spawn(
                    format!("ingest-{id}"),
                    Box::new(move || ingest_loop(running, source, pipe, infer_in)),
                )?);
            }
            {
                let running = self.running.clone();
                let pipe = pipe.clone();
                let analytics = self.analytics_out.clone();
                let tracker_cfg = self.opt.tracker.clone();
                let ordering = self.opt.ordering;
                self.workers.push(spawn(
                    format!("track-{id}"),
                    Box::new(move || order_track_loop(running, pipe, analytics, tracker_cfg, ordering)),
                )?);
            }
            {
                let running = self.running.clone();
                let pipe = pipe.clone();
                let anonymizer = anonymizer.clone();
                let draw_tracks = self.opt.draw_tracks;
                self.workers.push(spawn(
                    format!("anon-{id}"),
                    Box::new(move || anonymize_loop(running, pipe, anonymizer, draw_tracks)),
                )?);
            }
            {
                let running = self.running.clone();
                let pipe = pipe.clone();
                let hub = self.hub.clone();
                let quality = self.opt.jpeg_quality;
                self.workers.push(spawn(
                    format!("enc-{id}"),
                    Box::new(move || encode_loop(running, pipe, hub, quality)),
                )?);
            }
            started_streams += 1;
        }

        if started_streams == 0 {
            self.stop();
            bail!("no streams were started");
        }
        debug!(
            "pipeline running: {} stream(s), {} detector worker(s)",
            started_streams,
            self.opt.inf_workers.max(1)
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) && self.workers.is_empty() {
            return;
        }

        self.infer_in.stop();
        self.analytics_out.stop();
        for pipe in &self.pipes {
            pipe.stop();
        }

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.pipes.clear();

        // Modules go last, after every worker that could touch them is done.
        self.detector = None;
        self.anonymizer = None;
    }

    /// Drain one tracker output from the analytics queue.
    pub fn pop_tracker_output(&self, timeout: Duration) -> Option<TrackerFrameOutput> {
        self.analytics_out.pop_for(timeout)
    }
}

impl Drop for PipelineRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ingest_loop(
    running: Arc<AtomicBool>,
    mut source: Box<dyn FrameSource>,
    pipe: Arc<StreamPipe>,
    infer_in: Arc<BoundedQueue<FrameHandle>>,
) {
    if let Err(err) = source.start() {
        error!("stream {}: source start failed: {err}", pipe.stream_id);
        return;
    }

    while running.load(Ordering::Relaxed) {
        let Some(bundle) = source.read(INGEST_READ_TIMEOUT) else {
            continue;
        };
        let ctx = FrameCtx::from_bundle(bundle);
        metrics::counter!("pipeline_frames_ingested_total", "stream" => pipe.stream_id.clone())
            .increment(1);

        infer_in.push_drop_oldest(ctx.clone());
        pipe.inf_state_in.push_drop_oldest(ctx);
        metrics::gauge!("pipeline_queue_depth", "queue" => "infer_in")
            .set(infer_in.len() as f64);
    }
    source.stop();
}

fn infer_loop(
    running: Arc<AtomicBool>,
    infer_in: Arc<BoundedQueue<FrameHandle>>,
    pipes_by_id: Arc<HashMap<String, Arc<StreamPipe>>>,
    detector: Arc<dyn Detector>,
) {
    let mut logged_failure = false;
    while running.load(Ordering::Relaxed) {
        let Some(ctx) = infer_in.pop_for(POP_TIMEOUT) else {
            continue;
        };

        // Taking the image both feeds the detector and releases the buffer
        // as soon as inference is done with it.
        let boxes = match ctx.take_inf_image() {
            Some(image) => match detector.detect(&image) {
                Ok(boxes) => boxes,
                Err(err) => {
                    if !logged_failure {
                        error!("detector failed: {err:#}");
                        logged_failure = true;
                    }
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if let Some(pipe) = pipes_by_id.get(&ctx.stream_id) {
            pipe.det_res.push_drop_oldest(InferResults {
                stream_id: ctx.stream_id.clone(),
                frame_id: ctx.frame_id,
                boxes,
            });
        }
    }
}

fn order_track_loop(
    running: Arc<AtomicBool>,
    pipe: Arc<StreamPipe>,
    analytics_out: Arc<BoundedQueue<TrackerFrameOutput>>,
    tracker_cfg: TrackerConfig,
    ordering: OrderingOptions,
) {
    let mut tracker = create_tracker(tracker_cfg);
    let mut buf = ReorderBuffer::new(ordering.reorder_window, ordering.pending_cap);

    while running.load(Ordering::Relaxed) {
        if let Some(ctx) = pipe.inf_state_in.pop_for(DRAIN_FIRST_POP) {
            buf.insert_frame(ctx);
        }
        while let Some(ctx) = pipe.inf_state_in.try_pop() {
            buf.insert_frame(ctx);
        }
        while let Some(det) = pipe.det_res.try_pop() {
            buf.insert_dets(det);
        }

        while let Some(ready) = buf.pop_ready() {
            if ready.predicted {
                metrics::counter!(
                    "pipeline_predict_only_frames_total",
                    "stream" => pipe.stream_id.clone()
                )
                .increment(1);
            }
            let tracks = tracker.update(&ready.dets);
            ready.ctx.set_tracks(tracks.clone());
            analytics_out.push_drop_oldest(TrackerFrameOutput {
                stream_id: ready.ctx.stream_id.clone(),
                frame_id: ready.ctx.frame_id,
                pts_ns: ready.ctx.pts_ns,
                tracks,
            });
            pipe.anon_in.push_drop_oldest(ready.ctx);
        }

        buf.enforce_caps();
    }
}

fn anonymize_loop(
    running: Arc<AtomicBool>,
    pipe: Arc<StreamPipe>,
    anonymizer: Arc<Anonymizer>,
    draw_tracks: bool,
) {
    while running.load(Ordering::Relaxed) {
        let Some(ctx) = pipe.anon_in.pop_for(POP_TIMEOUT) else {
            continue;
        };
        let tracks = ctx.tracks();
        let map = ctx.map;
        ctx.with_ui_image(|ui| {
            anonymizer.apply(ui, &tracks, map);
            if draw_tracks {
                overlay::draw_tracks(ui, &tracks, map);
            }
        });
        pipe.enc_in.push_drop_oldest(ctx);
    }
}

fn encode_loop(
    running: Arc<AtomicBool>,
    pipe: Arc<StreamPipe>,
    hub: Arc<StreamHub>,
    quality: u8,
) {
    while running.load(Ordering::Relaxed) {
        let Some(ctx) = pipe.enc_in.pop_for(POP_TIMEOUT) else {
            continue;
        };
        let Some(ui) = ctx.take_ui_image() else {
            continue;
        };
        if ui.width() == 0 || ui.height() == 0 {
            continue;
        }

        let started = Instant::now();
        if let Err(err) = publish_frame(&hub, &ctx, &ui, quality) {
            error!("stream {}: publish failed: {err:#}", pipe.stream_id);
            continue;
        }
        metrics::histogram!("pipeline_encode_seconds").record(started.elapsed().as_secs_f64());
    }
}
