//! FFmpeg command builder and runner.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use render_models::EncodingProfile;

use crate::error::{MediaError, MediaResult};
use crate::progress::{is_progress_line, parse_progress_line, FfmpegProgress, ProgressSink};

/// Number of non-progress stderr lines kept for error reporting.
const STDERR_TAIL_LINES: usize = 20;

/// One `ffmpeg` invocation: inputs, trailing output options and the target.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    inputs: Vec<PathBuf>,
    output: PathBuf,
    options: Vec<String>,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            inputs: vec![input.as_ref().to_path_buf()],
            output: output.as_ref().to_path_buf(),
            options: Vec::new(),
        }
    }

    /// Add another input; it is addressed as `[N:v]` with N starting at 1.
    pub fn add_input(mut self, input: impl AsRef<Path>) -> Self {
        self.inputs.push(input.as_ref().to_path_buf());
        self
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.options.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(args.into_iter().map(Into::into));
        self
    }

    fn option(self, flag: &str, value: impl Into<String>) -> Self {
        self.output_arg(flag).output_arg(value)
    }

    pub fn video_filter(self, graph: impl Into<String>) -> Self {
        self.option("-vf", graph)
    }

    pub fn audio_filter(self, graph: impl Into<String>) -> Self {
        self.option("-af", graph)
    }

    pub fn filter_complex(self, graph: impl Into<String>) -> Self {
        self.option("-filter_complex", graph)
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.option("-c:v", codec)
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.option("-c:a", codec)
    }

    /// Video encoder options for a quality tier and container.
    pub fn encode_video(self, profile: &EncodingProfile) -> Self {
        let cmd = self.video_codec(&profile.video_codec);
        let cmd = if profile.video_codec == "libvpx-vp9" {
            // constant quality mode needs an explicit zero bitrate
            cmd.option("-crf", profile.crf.saturating_add(8).to_string())
                .option("-b:v", "0")
        } else {
            cmd.option("-preset", &profile.preset)
                .option("-crf", profile.crf.to_string())
                .option("-maxrate", &profile.video_bitrate)
                .option("-bufsize", double_bitrate(&profile.video_bitrate))
        };
        cmd.option("-pix_fmt", "yuv420p")
    }

    pub fn encode_audio(self, profile: &EncodingProfile) -> Self {
        self.audio_codec(&profile.audio_codec)
            .option("-b:a", &profile.audio_bitrate)
    }

    /// Full argument list. Progress blocks go to stderr as `key=value` lines.
    pub fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-v", "error", "-nostats", "-progress", "pipe:2"]
            .into_iter()
            .map(String::from)
            .collect();

        for input in &self.inputs {
            args.push("-i".to_string());
            args.push(input.to_string_lossy().into_owned());
        }
        args.extend(self.options.iter().cloned());
        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

/// "3000k" -> "6000k"; unparseable values pass through unchanged.
fn double_bitrate(bitrate: &str) -> String {
    match bitrate.strip_suffix('k').and_then(|n| n.parse::<u64>().ok()) {
        Some(n) => format!("{}k", n * 2),
        None => bitrate.to_string(),
    }
}

/// Spawns `ffmpeg`, streams its progress into a sink and kills it on cancel.
#[derive(Debug, Clone, Default)]
pub struct FfmpegRunner {
    timeout: Option<Duration>,
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    /// Run `cmd`, reporting fractional progress against `total_duration_ms`.
    ///
    /// A sink error (a pause wait interrupted by cancellation) kills the
    /// process.
    pub async fn run_with_progress(
        &self,
        cmd: &FfmpegCommand,
        total_duration_ms: i64,
        sink: &dyn ProgressSink,
    ) -> MediaResult<()> {
        let binary = check_ffmpeg()?;
        let args = cmd.build_args();
        debug!(args = %args.join(" "), "Spawning ffmpeg");

        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let lines = child
            .stderr
            .take()
            .map(|stderr| BufReader::new(stderr).lines())
            .ok_or_else(|| MediaError::internal("ffmpeg stderr was not piped"))?;
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

        let driven = drive(&mut child, lines, total_duration_ms, sink, &mut tail);
        let outcome = match self.timeout {
            None => driven.await,
            Some(limit) => tokio::time::timeout(limit, driven)
                .await
                .unwrap_or_else(|_| {
                    warn!(timeout_secs = limit.as_secs(), "ffmpeg exceeded its time limit");
                    Err(MediaError::Timeout(limit.as_secs()))
                }),
        };

        let status = match outcome {
            Ok(status) => status,
            Err(e) => {
                if e.is_cancelled() {
                    info!("Killing ffmpeg after cancellation");
                }
                let _ = child.kill().await;
                return Err(e);
            }
        };

        if status.success() {
            return Ok(());
        }
        Err(MediaError::ffmpeg_failed(
            "ffmpeg exited unsuccessfully",
            Some(Vec::from(tail).join("\n")),
            status.code(),
        ))
    }
}

/// Pump stderr until EOF, then reap the process.
async fn drive(
    child: &mut Child,
    mut lines: Lines<BufReader<ChildStderr>>,
    total_duration_ms: i64,
    sink: &dyn ProgressSink,
    tail: &mut VecDeque<String>,
) -> MediaResult<ExitStatus> {
    let mut current = FfmpegProgress::default();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = sink.cancelled() => return Err(MediaError::Cancelled),
        };

        let Some(line) = line else { break };

        if let Some(progress) = parse_progress_line(&line, &mut current) {
            sink.report(progress.percentage(total_duration_ms)).await?;
        } else if !is_progress_line(&line) && !line.trim().is_empty() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    Ok(child.wait().await?)
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

/// Check if FFprobe is available.
pub fn check_ffprobe() -> MediaResult<PathBuf> {
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)
}
