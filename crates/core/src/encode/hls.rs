//! FFmpeg HLS transcoder
//!
//! Builds and runs the ffmpeg invocation that re-encodes the source, cuts it
//! into fixed-length segments, encrypts them with AES-128 using the job's
//! key-info file and writes a closed (VOD) playlist.

use super::playlist::{verify_output, PlaylistError, SegmentedOutput};
use async_trait::async_trait;
use hls_packager_config::Config;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Error type for transcoding
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// Transcoder binary could not be started
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },

    /// Output directory could not be created
    #[error("failed to create output directory {path}: {source}")]
    OutputDir { path: PathBuf, source: io::Error },

    /// Transcoder exited with non-zero status
    #[error("transcoder exited with code {exit_code}: {stderr}")]
    Failed { exit_code: i32, stderr: String },

    /// Transcoder was killed by a signal
    #[error("transcoder was terminated by a signal: {stderr}")]
    Terminated { stderr: String },

    /// The job was cancelled while the transcoder was running
    #[error("transcode cancelled")]
    Cancelled,

    /// Transcoder reported success but its output is not usable
    #[error("incomplete transcoder output: {0}")]
    IncompleteOutput(#[from] PlaylistError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TranscodeError {
    /// Exit code of the transcoder, when it exited on its own
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TranscodeError::Failed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Encoder and segmenter settings
#[derive(Debug, Clone, PartialEq)]
pub struct HlsEncodeSettings {
    /// Target segment length in seconds
    pub segment_seconds: u32,
    pub video_codec: String,
    pub audio_codec: String,
    /// Encoder threads; 0 leaves the choice to ffmpeg
    pub threads: u32,
}

impl Default for HlsEncodeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl HlsEncodeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            segment_seconds: config.hls.segment_seconds,
            video_codec: config.hls.video_codec.clone(),
            audio_codec: config.hls.audio_codec.clone(),
            threads: config.hls.threads,
        }
    }
}

/// Paths for one transcode
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    /// Absolute path of the source video
    pub input_path: PathBuf,
    /// Directory receiving playlist and segments
    pub output_dir: PathBuf,
    /// Playlist and segment name prefix
    pub asset_name: String,
    /// Key-info file handed to the segmenter
    pub key_info_path: PathBuf,
    /// Working directory of the transcoder; the relative key file name in the
    /// key-info file resolves against it
    pub working_dir: PathBuf,
}

impl TranscodeRequest {
    /// `<output_dir>/<asset_name>.m3u8`
    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.m3u8", self.asset_name))
    }

    /// `<output_dir>/<asset_name>_%03d.ts`
    pub fn segment_pattern(&self) -> PathBuf {
        self.output_dir.join(format!("{}_%03d.ts", self.asset_name))
    }
}

/// Build the ffmpeg HLS command
///
/// Creates a Command configured with:
/// - Overwrite, no stdin interaction
/// - Video/audio re-encoding with the configured codecs
/// - Fixed segment length, AES-128 via the key-info file, VOD playlist
/// - Predictable segment names (`<asset>_000.ts`, `<asset>_001.ts`, ...)
/// - Machine-readable progress on stdout
pub fn build_hls_command(
    program: &Path,
    settings: &HlsEncodeSettings,
    request: &TranscodeRequest,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.current_dir(&request.working_dir);

    cmd.arg("-y").arg("-nostdin");
    cmd.arg("-i").arg(&request.input_path);

    cmd.arg("-c:v").arg(&settings.video_codec);
    cmd.arg("-c:a").arg(&settings.audio_codec);
    if settings.threads > 0 {
        cmd.arg("-threads").arg(settings.threads.to_string());
    }

    cmd.arg("-hls_time").arg(settings.segment_seconds.to_string());
    cmd.arg("-hls_key_info_file").arg(&request.key_info_path);
    cmd.arg("-hls_playlist_type").arg("vod");
    cmd.arg("-hls_segment_filename").arg(request.segment_pattern());

    cmd.arg("-progress").arg("pipe:1");
    cmd.arg("-nostats");
    cmd.arg("-loglevel").arg("error");

    cmd.arg(request.playlist_path());
    cmd
}

/// Parse one `-progress` line into encoded seconds.
///
/// Both `out_time_us` and the misnamed `out_time_ms` carry microseconds.
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|us| *us >= 0)
            .map(|us| us as f64 / 1_000_000.0),
        _ => None,
    }
}

/// Produces an encrypted segmented playlist from a source video
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Transcode, reporting encoded seconds through `on_progress`.
    ///
    /// Must stop and return [`TranscodeError::Cancelled`] once `cancel` fires.
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<SegmentedOutput, TranscodeError>;
}

/// Transcoder backed by the ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    settings: HlsEncodeSettings,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>, settings: HlsEncodeSettings) -> Self {
        Self {
            program: program.into(),
            settings,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.tools.ffmpeg, HlsEncodeSettings::from_config(config))
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<SegmentedOutput, TranscodeError> {
        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|source| TranscodeError::OutputDir {
                path: request.output_dir.clone(),
                source,
            })?;

        let mut cmd = build_hls_command(&self.program, &self.settings, request);
        debug!(command = ?cmd.as_std(), "Starting transcoder");

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "transcoder stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "transcoder stderr not captured"))?;

        let stderr_task = tokio::spawn(collect_tail(stderr, STDERR_TAIL_LINES));
        let mut progress_lines = BufReader::new(stdout).lines();
        let mut stdout_open = true;

        let status = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Err(TranscodeError::Cancelled);
                }
                line = progress_lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if let Some(secs) = parse_progress_line(&line) {
                            on_progress(secs);
                        }
                    }
                    _ => stdout_open = false,
                },
                status = child.wait(), if !stdout_open => break status?,
            }
        };

        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(exit_error(status.code(), stderr_tail));
        }

        Ok(verify_output(&request.output_dir, &request.playlist_path())?)
    }
}

/// Map a failed exit status to the matching error
fn exit_error(code: Option<i32>, stderr: String) -> TranscodeError {
    match code {
        Some(exit_code) => TranscodeError::Failed { exit_code, stderr },
        None => TranscodeError::Terminated { stderr },
    }
}

async fn collect_tail<R: AsyncRead + Unpin>(reader: R, keep: usize) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(keep);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}
