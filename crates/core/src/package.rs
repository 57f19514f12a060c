//! Archive packaging for finished HLS output.
//!
//! Bundles the playlist, segments, key, key-info and optional duration record
//! into one flat deflate zip. The archive is written under a temporary name in
//! the destination directory and renamed into place, so a caller never sees a
//! partially written file.

use crate::keygen::EncryptionKeyMaterial;
use crate::workspace::{JobWorkspace, DURATION_FILE_NAME, KEY_FILE_NAME, KEY_INFO_FILE_NAME};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Errors that can occur while building the archive.
#[derive(Debug, Error)]
pub enum PackagingError {
    /// A file that must go into the archive does not exist.
    #[error("expected file missing: {0}")]
    MissingFile(PathBuf),

    /// The output directory could not be walked.
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },

    /// Two files would land on the same flattened entry name.
    #[error("duplicate archive entry '{0}'")]
    DuplicateEntry(String),

    /// The output directory has no usable name to derive the archive name from.
    #[error("cannot derive archive name from {0}")]
    ArchiveName(PathBuf),

    /// Creating, writing or renaming the archive failed.
    #[error("failed to write archive {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    /// The zip encoder rejected an entry.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// A finished archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveBundle {
    /// Final archive location
    pub path: PathBuf,
    /// Entry names in archive order
    pub entries: Vec<String>,
    /// Number of `.ts` segment entries
    pub segment_count: usize,
    /// Source duration recorded in `duration.txt`, if any
    pub duration_secs: Option<f64>,
}

/// A transient file or directory that could not be removed after archiving.
///
/// Never fails a job; the archive is already complete when this happens.
#[derive(Debug)]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub source: io::Error,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to remove {}: {}", self.path.display(), self.source)
    }
}

/// Archive file name for an output directory: `<dir name>.zip`
pub fn archive_file_name(output_dir: &Path) -> Result<String, PackagingError> {
    output_dir
        .file_name()
        .map(|name| format!("{}.zip", name.to_string_lossy()))
        .ok_or_else(|| PackagingError::ArchiveName(output_dir.to_path_buf()))
}

/// Builds archives from transcoder output and key material
#[derive(Debug, Clone, Default)]
pub struct ArtifactPackager;

impl ArtifactPackager {
    pub fn new() -> Self {
        Self
    }

    /// Bundle `output_dir`, the key files and the optional duration record into
    /// `<destination_dir>/<output_dir name>.zip`.
    ///
    /// Every file under `output_dir` is added under its base name, sorted by
    /// name, followed by `enc.key`, `enc.keyinfo` and `duration.txt`. An
    /// existing archive at the target path is replaced.
    pub fn package(
        &self,
        output_dir: &Path,
        key_material: &EncryptionKeyMaterial,
        duration_file: Option<&Path>,
        destination_dir: &Path,
    ) -> Result<ArchiveBundle, PackagingError> {
        let files = collect_entries(output_dir, key_material, duration_file)?;

        let archive_name = archive_file_name(output_dir)?;
        let final_path = destination_dir.join(&archive_name);
        let partial_path = destination_dir.join(format!(".{}.partial", archive_name));

        fs::create_dir_all(destination_dir).map_err(|source| PackagingError::Io {
            path: destination_dir.to_path_buf(),
            source,
        })?;

        let written = write_archive(&partial_path, &files).and_then(|()| {
            fs::rename(&partial_path, &final_path).map_err(|source| PackagingError::Io {
                path: final_path.clone(),
                source,
            })
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&partial_path);
            return Err(e);
        }

        let entries: Vec<String> = files.into_iter().map(|(name, _)| name).collect();
        let segment_count = entries.iter().filter(|name| name.ends_with(".ts")).count();
        debug!(archive = %final_path.display(), entries = entries.len(), "Archive written");

        Ok(ArchiveBundle {
            path: final_path,
            entries,
            segment_count,
            duration_secs: None,
        })
    }

    /// Remove the job workspace (key, key-info, duration record and transcoder
    /// output). Failures are logged and returned, never escalated.
    pub fn cleanup(&self, workspace: &JobWorkspace) -> Option<CleanupWarning> {
        match workspace.remove() {
            Ok(()) => None,
            Err(source) => {
                let warning = CleanupWarning {
                    path: workspace.root().to_path_buf(),
                    source,
                };
                warn!(%warning, "Cleanup failed; archive is unaffected");
                Some(warning)
            }
        }
    }
}

/// Resolve `(entry name, source path)` pairs in archive order
fn collect_entries(
    output_dir: &Path,
    key_material: &EncryptionKeyMaterial,
    duration_file: Option<&Path>,
) -> Result<Vec<(String, PathBuf)>, PackagingError> {
    if !output_dir.is_dir() {
        return Err(PackagingError::MissingFile(output_dir.to_path_buf()));
    }

    let mut names = HashSet::new();
    let mut files = Vec::new();
    let mut push = |name: String, path: PathBuf| -> Result<(), PackagingError> {
        if !names.insert(name.clone()) {
            return Err(PackagingError::DuplicateEntry(name));
        }
        files.push((name, path));
        Ok(())
    };

    for entry in WalkDir::new(output_dir).sort_by_file_name() {
        let entry = entry.map_err(|source| PackagingError::Walk {
            path: output_dir.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        push(name, entry.into_path())?;
    }

    let mut extras = vec![
        (KEY_FILE_NAME, key_material.key_path.as_path()),
        (KEY_INFO_FILE_NAME, key_material.key_info_path.as_path()),
    ];
    if let Some(duration) = duration_file {
        extras.push((DURATION_FILE_NAME, duration));
    }
    for (name, path) in extras {
        if !path.is_file() {
            return Err(PackagingError::MissingFile(path.to_path_buf()));
        }
        push(name.to_string(), path.to_path_buf())?;
    }

    Ok(files)
}

fn write_archive(archive_path: &Path, files: &[(String, PathBuf)]) -> Result<(), PackagingError> {
    let io_err = |source: io::Error| PackagingError::Io {
        path: archive_path.to_path_buf(),
        source,
    };

    let file = File::create(archive_path).map_err(io_err)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, path) in files {
        zip.start_file(name.as_str(), options)?;
        let mut source = File::open(path).map_err(|source| PackagingError::Io {
            path: path.clone(),
            source,
        })?;
        io::copy(&mut source, &mut zip).map_err(io_err)?;
    }

    let mut writer = zip.finish()?;
    writer.flush().map_err(io_err)?;
    let file = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
    file.sync_all().map_err(io_err)
}
