//! FFmpeg CLI wrapper for render pipelines.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - Progress parsing from `-progress pipe:2` with cooperative pause/cancel
//! - Filter builders for audio enhancement, visual filters, watermarks and subtitles
//! - The [`StageRunner`] seam driven by the rendering pipeline

pub mod audio;
pub mod command;
pub mod error;
pub mod filters;
pub mod fs_utils;
pub mod probe;
pub mod progress;
pub mod stage;
pub mod subtitles;
pub mod watermark;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use probe::{probe_media, MediaInfo};
pub use progress::{FfmpegProgress, NoopProgress, ProgressSink};
pub use stage::{FfmpegStageRunner, StageRequest, StageRunner};
