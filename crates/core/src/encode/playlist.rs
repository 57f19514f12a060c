//! Playlist inspection for transcoder output.
//!
//! The playlist is the source of truth for segment order; a transcode only
//! counts as complete when every segment it lists is on disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("playlist {path} unreadable: {source}")]
    Unreadable { path: PathBuf, source: io::Error },

    #[error("playlist lists no segments")]
    NoSegments,

    #[error("segment '{0}' listed in the playlist is missing")]
    MissingSegment(String),

    #[error("playlist has no AES-128 key directive")]
    Unencrypted,
}

/// A verified transcoder output directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentedOutput {
    pub output_dir: PathBuf,
    pub playlist_path: PathBuf,
    /// Segment file names in playlist order
    pub segments: Vec<String>,
}

/// Segment URIs in playlist order (every non-blank, non-tag line).
pub fn parse_segments(playlist: &str) -> Vec<String> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// True if the playlist carries an `#EXT-X-KEY` with `METHOD=AES-128`.
pub fn is_encrypted(playlist: &str) -> bool {
    playlist
        .lines()
        .map(str::trim)
        .any(|line| line.starts_with("#EXT-X-KEY:") && line.contains("METHOD=AES-128"))
}

/// Check that the playlist exists, is encrypted, lists at least one segment,
/// and that every listed segment is present in `output_dir`.
pub fn verify_output(output_dir: &Path, playlist_path: &Path) -> Result<SegmentedOutput, PlaylistError> {
    let text = fs::read_to_string(playlist_path).map_err(|source| PlaylistError::Unreadable {
        path: playlist_path.to_path_buf(),
        source,
    })?;

    if !is_encrypted(&text) {
        return Err(PlaylistError::Unencrypted);
    }

    let mut segments = Vec::new();
    for uri in parse_segments(&text) {
        // Segments are written next to the playlist; only the file name matters
        let name = Path::new(&uri)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PlaylistError::MissingSegment(uri.clone()))?;
        if !output_dir.join(&name).is_file() {
            return Err(PlaylistError::MissingSegment(name));
        }
        segments.push(name);
    }

    if segments.is_empty() {
        return Err(PlaylistError::NoSegments);
    }

    Ok(SegmentedOutput {
        output_dir: output_dir.to_path_buf(),
        playlist_path: playlist_path.to_path_buf(),
        segments,
    })
}
