//! Startup checks
//!
//! Preflight verification of the external tools a conversion needs:
//! - ffmpeg (always required)
//! - ffprobe (optional; without it archives carry no duration)
//! - openssl (required only when it is the key source)

use hls_packager_config::{Config, KeySourceKind};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },
}

/// Result of checking one tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolReport {
    pub tool: &'static str,
    pub path: PathBuf,
    pub required: bool,
    /// Version token from the tool's own banner, e.g. `6.1.1` or `n7.0-12-g1a2b`
    pub version: Option<String>,
    /// Why the tool could not be used
    pub error: Option<String>,
}

impl ToolReport {
    pub fn is_available(&self) -> bool {
        self.error.is_none()
    }
}

/// Extract the version token following `marker` in a tool banner.
///
/// Handles:
/// - `ffmpeg version 6.1.1-3ubuntu5 Copyright ...`
/// - `ffprobe version n7.0-12-g1a2b ...`
/// - `OpenSSL 3.0.13 30 Jan 2024 (Library: ...)`
pub fn parse_tool_version(output: &str, marker: &str) -> Option<String> {
    let marker = marker.to_lowercase();
    let line = output
        .lines()
        .find(|line| line.to_lowercase().contains(&marker))?;

    let lower = line.to_lowercase();
    let start = lower.find(&marker)? + marker.len();
    line.get(start..)?
        .split_whitespace()
        .next()
        .map(String::from)
}

/// Run `<program> <args>` and pull the version token out of its stdout
pub fn tool_version(
    tool: &str,
    program: &Path,
    args: &[&str],
    marker: &str,
) -> Result<Option<String>, StartupError> {
    let unavailable = |reason: String| StartupError::ToolUnavailable {
        tool: tool.to_string(),
        reason,
    };

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            unavailable(format!(
                "failed to run {}; is it installed and in PATH? Error: {}",
                program.display(),
                e
            ))
        })?;

    if !output.status.success() {
        return Err(unavailable(format!(
            "{} {} exited with {}",
            program.display(),
            args.join(" "),
            output.status
        )));
    }

    let version = parse_tool_version(&String::from_utf8_lossy(&output.stdout), marker);
    debug!(tool, version = ?version, "Tool available");
    Ok(version)
}

fn report(tool: &'static str, program: &Path, required: bool, args: &[&str], marker: &str) -> ToolReport {
    let (version, error) = match tool_version(tool, program, args, marker) {
        Ok(version) => (version, None),
        Err(e) => (None, Some(e.to_string())),
    };
    ToolReport {
        tool,
        path: program.to_path_buf(),
        required,
        version,
        error,
    }
}

/// Check every tool the configuration uses, without failing
pub fn check_tools(cfg: &Config) -> Vec<ToolReport> {
    let openssl_required = cfg.key.source == KeySourceKind::Openssl;
    vec![
        report("ffmpeg", &cfg.tools.ffmpeg, true, &["-version"], "ffmpeg version"),
        report("ffprobe", &cfg.tools.ffprobe, false, &["-version"], "ffprobe version"),
        report("openssl", &cfg.tools.openssl, openssl_required, &["version"], "openssl"),
    ]
}

/// Run all startup checks.
///
/// Fails on the first unavailable required tool; optional tools only warn.
pub fn run_startup_checks(cfg: &Config) -> Result<Vec<ToolReport>, StartupError> {
    let reports = check_tools(cfg);
    for r in &reports {
        match (&r.error, r.required) {
            (Some(reason), true) => {
                return Err(StartupError::ToolUnavailable {
                    tool: r.tool.to_string(),
                    reason: reason.clone(),
                })
            }
            (Some(reason), false) => warn!(tool = r.tool, %reason, "Optional tool unavailable"),
            (None, _) => {}
        }
    }
    Ok(reports)
}
