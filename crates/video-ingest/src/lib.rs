//! Dual-profile video sources for the streamscrub pipeline.
//!
//! Every source emits [`FrameBundle`]s: a low-resolution inference copy and a
//! high-resolution UI copy decoded from the same source instant, together
//! with the affine mapping between the two coordinate spaces. Production
//! decoding runs through an FFmpeg subprocess ([`FfmpegDualSource`]); the
//! deterministic [`SyntheticSource`] exists for tests and demos.

use image::imageops::FilterType;

mod ffmpeg;
mod resize;
mod testsrc;
mod types;

pub use ffmpeg::FfmpegDualSource;
pub use testsrc::SyntheticSource;
pub use types::{
    join_profiles, paired_within_tolerance, CaptureError, CoordMap, FrameBundle, FrameSource,
    MapLatch, PAIR_TOLERANCE_NS,
};

/// Interpolation used when producing an output profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeFilter {
    Nearest,
    Linear,
    Cubic,
    Area,
}

impl ResizeFilter {
    /// The `image` crate has no dedicated area filter; triangle is the
    /// closest match for downscaling.
    pub(crate) fn as_filter_type(self) -> FilterType {
        match self {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Linear | ResizeFilter::Area => FilterType::Triangle,
            ResizeFilter::Cubic => FilterType::CatmullRom,
        }
    }
}

/// One decoded output profile of a stream.
#[derive(Clone, Debug)]
pub struct OutputProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub keep_aspect: bool,
    pub filter: ResizeFilter,
}

/// The two profiles every stream must produce.
#[derive(Clone, Debug)]
pub struct SourceProfiles {
    pub inference: OutputProfile,
    pub ui: OutputProfile,
}

/// Transport-specific input parameters.
#[derive(Clone, Debug)]
pub enum SourceInput {
    File {
        path: String,
        loop_playback: bool,
    },
    Webcam {
        device: String,
        width: u32,
        height: u32,
        fps: u32,
        mjpg: bool,
    },
    Rtsp {
        url: String,
        latency_ms: u32,
        tcp: bool,
    },
}

/// Everything needed to construct one stream's dual-profile source.
#[derive(Clone, Debug)]
pub struct DualSourceSpec {
    pub stream_id: String,
    pub input: SourceInput,
    pub profiles: SourceProfiles,
}

/// Construct the production source for a stream spec.
pub fn make_dual_source(spec: DualSourceSpec) -> Result<Box<dyn FrameSource>, CaptureError> {
    if let SourceInput::Rtsp { url, .. } = &spec.input {
        if url.is_empty() {
            return Err(CaptureError::Open {
                uri: format!("{} (empty RTSP url)", spec.stream_id),
            });
        }
    }
    Ok(Box::new(FfmpegDualSource::new(spec)))
}
