//! FFmpeg-backed dual-profile source.
//!
//! One FFmpeg subprocess decodes the configured input to raw `rgb24` frames
//! at the UI profile resolution; a background thread drains its stdout into
//! a small bounded channel. `read` pairs each decoded UI frame with the
//! derived inference copy and latches the coordinate map on the first
//! successful tick.

use std::{
    io::Read,
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use image::RgbImage;
use tracing::{debug, warn};

use crate::{
    resize::derive_inference,
    types::{join_profiles, CaptureError, FrameBundle, FrameSource, MapLatch},
    DualSourceSpec, SourceInput,
};

const READER_QUEUE: usize = 4;

/// Raw decoded frame handed from the reader thread to `read`.
struct RawFrame {
    data: Vec<u8>,
    /// Dimensions the decoder produced this buffer at.
    dims: (u32, u32),
    pts_ns: i64,
}

enum PtsMode {
    /// Live inputs: wall-clock capture time.
    WallClock,
    /// File inputs: synthesised from the frame index and the profile rate.
    FrameIndex { interval_ns: i64 },
}

pub struct FfmpegDualSource {
    spec: DualSourceSpec,
    rx: Option<Receiver<RawFrame>>,
    child: Arc<Mutex<Option<Child>>>,
    reader: Option<thread::JoinHandle<()>>,
    latch: Option<MapLatch>,
    frame_id: i64,
    warned_bad_frame: bool,
    warned_resolution_change: bool,
}

impl FfmpegDualSource {
    pub fn new(spec: DualSourceSpec) -> Self {
        Self {
            spec,
            rx: None,
            child: Arc::new(Mutex::new(None)),
            reader: None,
            latch: None,
            frame_id: 0,
            warned_bad_frame: false,
            warned_resolution_change: false,
        }
    }

    fn build_command(&self) -> Command {
        let ui = &self.spec.profiles.ui;
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        match &self.spec.input {
            SourceInput::File {
                path,
                loop_playback,
            } => {
                if *loop_playback {
                    cmd.arg("-stream_loop").arg("-1");
                }
                // Pace file playback at its native rate.
                cmd.arg("-re").arg("-i").arg(path);
            }
            SourceInput::Webcam {
                device,
                width,
                height,
                fps,
                mjpg,
            } => {
                cmd.arg("-f").arg("video4linux2");
                if *mjpg {
                    cmd.arg("-input_format").arg("mjpeg");
                }
                cmd.arg("-video_size")
                    .arg(format!("{width}x{height}"))
                    .arg("-framerate")
                    .arg(fps.to_string())
                    .arg("-i")
                    .arg(device);
            }
            SourceInput::Rtsp {
                url,
                latency_ms,
                tcp,
            } => {
                if *tcp {
                    cmd.arg("-rtsp_transport").arg("tcp");
                }
                cmd.arg("-fflags")
                    .arg("nobuffer")
                    .arg("-flags")
                    .arg("low_delay")
                    .arg("-max_delay")
                    .arg((u64::from(*latency_ms) * 1_000).to_string())
                    .arg("-i")
                    .arg(url);
            }
        }

        let scale = if ui.keep_aspect {
            format!(
                "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
                w = ui.width,
                h = ui.height
            )
        } else {
            format!("scale={}:{}", ui.width, ui.height)
        };

        cmd.arg("-an")
            .arg("-vf")
            .arg(scale)
            .arg("-r")
            .arg(ui.fps.to_string())
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd
    }

    fn pts_mode(&self) -> PtsMode {
        match self.spec.input {
            SourceInput::File { .. } => PtsMode::FrameIndex {
                interval_ns: 1_000_000_000 / i64::from(self.spec.profiles.ui.fps.max(1)),
            },
            _ => PtsMode::WallClock,
        }
    }
}

impl FrameSource for FfmpegDualSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.rx.is_some() {
            return Ok(());
        }

        let mut cmd = self.build_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| CaptureError::Open {
            uri: self.spec.stream_id.clone(),
        })?;

        let (tx, rx) = bounded(READER_QUEUE);
        *self.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);

        let ui = &self.spec.profiles.ui;
        let dims = (ui.width, ui.height);
        let pts_mode = self.pts_mode();
        let child_handle = self.child.clone();
        let stream_id = self.spec.stream_id.clone();
        let reader = thread::Builder::new()
            .name(format!("ingest-dec-{stream_id}"))
            .spawn(move || {
                decode_loop(stdout, dims, pts_mode, tx);
                if let Some(mut child) = child_handle
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                debug!("decoder thread for {stream_id} exited");
            })
            .map_err(CaptureError::Spawn)?;

        self.rx = Some(rx);
        self.reader = Some(reader);
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Option<FrameBundle> {
        let rx = self.rx.as_ref()?;
        let raw = match rx.recv_timeout(timeout) {
            Ok(raw) => raw,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
        };

        let (ui_w, ui_h) = raw.dims;
        let Some(ui_image) = RgbImage::from_raw(ui_w, ui_h, raw.data) else {
            if !self.warned_bad_frame {
                warn!(
                    "stream {}: decoded buffer does not fill a {ui_w}x{ui_h} frame, dropping",
                    self.spec.stream_id
                );
                self.warned_bad_frame = true;
            }
            return None;
        };

        let (inf_image, derived_map) = derive_inference(&ui_image, &self.spec.profiles.inference);
        let latch = *self
            .latch
            .get_or_insert_with(|| MapLatch::new(&ui_image, &inf_image, derived_map));
        let Some(map) = latch.accept(&ui_image, &inf_image) else {
            if !self.warned_resolution_change {
                warn!(
                    "stream {}: resolution changed after the first tick, dropping frames",
                    self.spec.stream_id
                );
                self.warned_resolution_change = true;
            }
            return None;
        };

        // Both profiles come from the same decode tick and share its pts.
        let bundle = join_profiles(
            &self.spec.stream_id,
            self.frame_id,
            (ui_image, raw.pts_ns),
            (inf_image, raw.pts_ns),
            map,
        )?;
        self.frame_id += 1;
        Some(bundle)
    }

    fn stop(&mut self) {
        if let Some(mut child) = self
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.rx = None;
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for FfmpegDualSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_loop(
    mut stdout: impl Read,
    dims: (u32, u32),
    pts_mode: PtsMode,
    tx: Sender<RawFrame>,
) {
    let frame_bytes = dims.0 as usize * dims.1 as usize * 3;
    let mut index: i64 = 0;
    loop {
        let mut buffer = vec![0u8; frame_bytes];
        if stdout.read_exact(&mut buffer).is_err() {
            break;
        }
        let pts_ns = match pts_mode {
            PtsMode::WallClock => Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            PtsMode::FrameIndex { interval_ns } => index * interval_ns,
        };
        index += 1;
        if tx.send(RawFrame {
            data: buffer,
            dims,
            pts_ns,
        })
        .is_err()
        {
            break;
        }
    }
}
