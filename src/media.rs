#![forbid(unsafe_code)]

//! External media tooling: stream inspection (ffprobe) and fast-start
//! remuxing (ffmpeg).
//!
//! The pipeline talks to the tools through `MediaTools` so tests can swap in
//! a double. `FfmpegTools` is the real thing: every invocation is a child
//! process bounded by a timeout and killed if the request future is dropped.

use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::{ExitStatus, Output, Stdio},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::error::{IngestError, IngestResult};
use crate::staging::ScratchFile;

pub const LANDSCAPE_LABEL: &str = "16:9";
pub const PORTRAIT_LABEL: &str = "9:16";
pub const ASPECT_TOLERANCE: f64 = 0.01;
pub const PROCESSING_SUFFIX: &str = ".processing";

/// Storage-path partition derived from an aspect label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectClass {
    Landscape,
    Portrait,
    Other,
}

impl AspectClass {
    pub fn from_label(label: &str) -> Self {
        match label {
            LANDSCAPE_LABEL => Self::Landscape,
            PORTRAIT_LABEL => Self::Portrait,
            _ => Self::Other,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Landscape => "landscape",
            Self::Portrait => "portrait",
            Self::Other => "other",
        }
    }
}

/// Width and height of the first video stream in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    pub width: u64,
    pub height: u64,
}

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Relative closeness: `|r1 - r2| <= tolerance * max(r1, r2)`.
pub fn ratios_close(ratio1: f64, ratio2: f64, tolerance: f64) -> bool {
    (ratio1 - ratio2).abs() <= tolerance * ratio1.max(ratio2)
}

/// Labels a frame size as `16:9`, `9:16`, or its reduced `w:h` ratio.
pub fn classify(width: u64, height: u64) -> String {
    if height > 0 {
        let ratio = width as f64 / height as f64;
        if ratios_close(ratio, 16.0 / 9.0, ASPECT_TOLERANCE) {
            return LANDSCAPE_LABEL.to_string();
        }
        if ratios_close(ratio, 9.0 / 16.0, ASPECT_TOLERANCE) {
            return PORTRAIT_LABEL.to_string();
        }
    }
    match gcd(width, height) {
        0 => "0:0".to_string(),
        divisor => format!("{}:{}", width / divisor, height / divisor),
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u64>,
    height: Option<u64>,
}

/// Picks the first video stream out of `ffprobe -print_format json -show_streams`.
pub fn parse_probe_output(stdout: &[u8]) -> IngestResult<StreamGeometry> {
    let output: ProbeOutput = serde_json::from_slice(stdout).map_err(|err| {
        tracing::warn!(error = %err, "ffprobe output is not valid JSON");
        IngestError::ProbeError(format!("parsing ffprobe output: {err}"))
    })?;

    let stream = output
        .streams
        .iter()
        .find(|stream| {
            stream
                .codec_type
                .as_deref()
                .is_none_or(|kind| kind == "video")
                && stream.width.is_some()
                && stream.height.is_some()
        })
        .ok_or_else(|| IngestError::ProbeError("no video streams found".into()))?;

    match (stream.width, stream.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => {
            Ok(StreamGeometry { width, height })
        }
        (width, height) => Err(IngestError::ProbeError(format!(
            "video stream has no usable geometry ({width:?}x{height:?})"
        ))),
    }
}

#[async_trait]
pub trait MediaTools: Send + Sync {
    /// Reports the geometry of the first video stream in `path`.
    async fn probe(&self, path: &Path) -> IngestResult<StreamGeometry>;

    /// Copies every stream of `input` into `output` with the index moved to
    /// the front. Never re-encodes and never touches `input`.
    async fn remux(&self, input: &Path, output: &Path) -> IngestResult<()>;
}

/// Runs the probe tool against `path` and classifies the first video stream.
pub async fn inspect_aspect_ratio(tools: &dyn MediaTools, path: &Path) -> IngestResult<String> {
    let geometry = tools.probe(path).await?;
    let label = classify(geometry.width, geometry.height);
    tracing::debug!(
        path = %path.display(),
        width = geometry.width,
        height = geometry.height,
        label = %label,
        "classified aspect ratio"
    );
    Ok(label)
}

/// Sibling output path used for the fast-start copy of `path`.
pub fn processing_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(PROCESSING_SUFFIX);
    PathBuf::from(raw)
}

/// Writes a fast-start copy of `path` next to it. The returned guard owns the
/// output and removes it on drop; it is armed before the tool runs so partial
/// output from a failed remux is reclaimed too.
pub async fn normalize_for_streaming(
    tools: &dyn MediaTools,
    path: &Path,
) -> IngestResult<ScratchFile> {
    let output = ScratchFile::new(processing_path(path));
    tools.remux(path, output.path()).await?;

    match tokio::fs::metadata(output.path()).await {
        Ok(meta) if meta.is_file() => Ok(output),
        _ => {
            tracing::warn!(
                output = %output.path().display(),
                "remux reported success but wrote no output"
            );
            Err(IngestError::ProcessingError(format!(
                "remux produced no output at {}",
                output.path().display()
            )))
        }
    }
}

/// Why a tool invocation failed. Logged distinctly, then collapsed into
/// `ProbeError` / `ProcessingError` by the caller.
#[derive(Debug, Error)]
pub enum ToolFailure {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Runs `program` to completion with captured output, null stdin, and a hard
/// deadline. The child is killed if the deadline passes.
pub async fn run_tool<I, S>(program: &Path, args: I, timeout: Duration) -> Result<Output, ToolFailure>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let name = program.display().to_string();
    let started = Instant::now();
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            tracing::error!(program = %name, error = %source, "failed to launch tool");
            return Err(ToolFailure::Spawn {
                program: name,
                source,
            });
        }
        Err(_) => {
            tracing::error!(program = %name, timeout_ms = timeout.as_millis() as u64, "tool timed out");
            return Err(ToolFailure::TimedOut {
                program: name,
                timeout,
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::error!(
            program = %name,
            status = %output.status,
            stderr = %stderr,
            "tool exited unsuccessfully"
        );
        return Err(ToolFailure::Exit {
            program: name,
            status: output.status,
            stderr,
        });
    }

    tracing::debug!(
        program = %name,
        duration_ms = started.elapsed().as_secs_f64() * 1000.0,
        "tool finished"
    );
    Ok(output)
}

/// `MediaTools` backed by the ffprobe/ffmpeg binaries.
#[derive(Debug, Clone)]
pub struct FfmpegTools {
    ffprobe: PathBuf,
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl FfmpegTools {
    pub fn new(ffprobe: impl Into<PathBuf>, ffmpeg: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            ffmpeg: ffmpeg.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MediaTools for FfmpegTools {
    async fn probe(&self, path: &Path) -> IngestResult<StreamGeometry> {
        let args: [&OsStr; 6] = [
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-print_format"),
            OsStr::new("json"),
            OsStr::new("-show_streams"),
            path.as_os_str(),
        ];
        let output = run_tool(&self.ffprobe, args, self.timeout)
            .await
            .map_err(|err| IngestError::ProbeError(err.to_string()))?;
        parse_probe_output(&output.stdout)
    }

    async fn remux(&self, input: &Path, output: &Path) -> IngestResult<()> {
        let args: Vec<OsString> = vec![
            "-v".into(),
            "error".into(),
            "-i".into(),
            input.as_os_str().to_owned(),
            "-c".into(),
            "copy".into(),
            "-movflags".into(),
            "faststart".into(),
            "-f".into(),
            "mp4".into(),
            output.as_os_str().to_owned(),
        ];
        run_tool(&self.ffmpeg, args, self.timeout)
            .await
            .map_err(|err| IngestError::ProcessingError(err.to_string()))?;
        Ok(())
    }
}
