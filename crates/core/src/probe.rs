//! Media probing via ffprobe.
//!
//! Duration is best-effort metadata: every failure here degrades to "no
//! duration" and the job carries on.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Why a duration could not be determined
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("unparseable duration '{0}'")]
    Parse(String),

    #[error("failed to write duration record: {0}")]
    Write(io::Error),
}

/// Source duration, rounded to two decimals
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaMetadata {
    pub duration_secs: f64,
}

/// Reads the container duration of a media file
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Duration in seconds, unrounded
    async fn probe_duration(&self, input: &Path) -> Result<f64, ProbeError>;
}

/// `ffprobe -v error -show_entries format=duration -of csv=p=0 <input>`
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    program: PathBuf,
}

impl FfprobeProber {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn build_command(&self, input: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-v", "error"])
            .args(["-show_entries", "format=duration"])
            .args(["-of", "csv=p=0"])
            .arg(input);
        cmd
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe_duration(&self, input: &Path) -> Result<f64, ProbeError> {
        let program = self.program.display().to_string();
        let output = self
            .build_command(input)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ProbeError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_duration(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse ffprobe's plain-decimal duration output.
///
/// Rejects empty, non-numeric (`N/A`), negative and non-finite values.
pub fn parse_duration(stdout: &str) -> Result<f64, ProbeError> {
    let text = stdout.trim();
    match text.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(secs),
        _ => Err(ProbeError::Parse(text.to_string())),
    }
}

/// Round to two decimal places.
///
/// Rounds the exact binary value, ties to even: `0.125` becomes `0.12` and
/// `2.675` (stored as 2.67499...) becomes `2.67`.
pub fn round_duration(secs: f64) -> f64 {
    format!("{:.2}", secs).parse().unwrap_or(secs)
}

/// Render a rounded duration the way the archive records it:
/// `30.5`, `30.0`, `12.35`.
pub fn format_duration(secs: f64) -> String {
    let rendered = round_duration(secs).to_string();
    if rendered.contains('.') {
        rendered
    } else {
        format!("{}.0", rendered)
    }
}

/// Probe `input` and, on success, write the duration record to `record_path`.
///
/// Returns `None` on any failure; the reason is logged, never propagated.
pub async fn probe_and_record(
    prober: &dyn MediaProber,
    input: &Path,
    record_path: &Path,
) -> Option<MediaMetadata> {
    let result = match prober.probe_duration(input).await {
        Ok(secs) => tokio::fs::write(record_path, format_duration(secs))
            .await
            .map(|()| secs)
            .map_err(ProbeError::Write),
        Err(e) => Err(e),
    };

    match result {
        Ok(secs) => {
            let duration_secs = round_duration(secs);
            debug!(input = %input.display(), duration_secs, "Probed duration");
            Some(MediaMetadata { duration_secs })
        }
        Err(e) => {
            warn!(input = %input.display(), error = %e, "Duration unavailable, continuing without it");
            None
        }
    }
}
