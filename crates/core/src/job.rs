//! Conversion job definition
//!
//! A job names one input video, the identifiers that place it under the origin,
//! and the base URL the encryption key will be served from.

use crate::workspace::{DURATION_FILE_NAME, KEY_FILE_NAME, KEY_INFO_FILE_NAME};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Reasons a job is rejected before any stage runs
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidJob {
    #[error("lesson id must not be empty")]
    EmptyLessonId,

    #[error("asset name must not be empty")]
    EmptyAssetName,

    #[error("{field} '{value}' must not contain path separators")]
    PathSeparator { field: &'static str, value: String },

    #[error("asset name '{0}' must not contain '%'")]
    TemplateCharacter(String),

    #[error("asset name '{0}' collides with a workspace file")]
    ReservedAssetName(String),

    #[error("base URL '{0}' is not an http(s) URL")]
    BaseUrl(String),

    #[error("input file not found: {0}")]
    InputNotFound(PathBuf),

    #[error("input path is not a regular file: {0}")]
    InputNotFile(PathBuf),
}

/// Logical identifiers of the packaged asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetIdentifiers {
    /// Lesson (or asset group) id, first URL path segment under the base URL
    pub lesson_id: String,
    /// Asset name: playlist/segment prefix and second URL path segment
    pub asset_name: String,
}

/// A request to convert one video into an encrypted HLS archive.
///
/// Immutable once handed to the pipeline.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    /// Unique job identifier, also names the job workspace
    pub id: String,
    /// Source video file
    pub input_path: PathBuf,
    pub identifiers: AssetIdentifiers,
    /// Origin the key URL is built from
    pub base_url: String,
}

impl ConversionJob {
    /// Create a job whose asset name is the input file stem
    /// (`/videos/lecture.mp4` -> `lecture`).
    pub fn new(
        input_path: impl Into<PathBuf>,
        lesson_id: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let input_path = input_path.into();
        let asset_name = asset_name_from_path(&input_path);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            input_path,
            identifiers: AssetIdentifiers {
                lesson_id: lesson_id.into().trim().to_string(),
                asset_name,
            },
            base_url: base_url.into().trim().to_string(),
        }
    }

    /// Override the asset name derived from the input file
    pub fn with_asset_name(mut self, asset_name: impl Into<String>) -> Self {
        self.identifiers.asset_name = asset_name.into().trim().to_string();
        self
    }

    pub fn asset_name(&self) -> &str {
        &self.identifiers.asset_name
    }

    pub fn lesson_id(&self) -> &str {
        &self.identifiers.lesson_id
    }

    /// URL a player fetches the key from:
    /// `<base_url>/<lesson_id>/<asset_name>/enc.key`
    pub fn key_url(&self) -> String {
        build_key_url(
            &self.base_url,
            &self.identifiers.lesson_id,
            &self.identifiers.asset_name,
        )
    }

    /// Check identifiers, base URL and input file.
    pub fn validate(&self) -> Result<(), InvalidJob> {
        validate_identifier("lesson id", &self.identifiers.lesson_id)
            .map_err(|e| e.unwrap_or(InvalidJob::EmptyLessonId))?;
        validate_identifier("asset name", &self.identifiers.asset_name)
            .map_err(|e| e.unwrap_or(InvalidJob::EmptyAssetName))?;
        validate_asset_name(&self.identifiers.asset_name)?;

        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(InvalidJob::BaseUrl(self.base_url.clone()));
        }

        match std::fs::metadata(&self.input_path) {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(InvalidJob::InputNotFile(self.input_path.clone())),
            Err(_) => Err(InvalidJob::InputNotFound(self.input_path.clone())),
        }
    }
}

/// Derive the asset name from a video path (file stem, lossy).
pub fn asset_name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Compose the key URL, ignoring trailing slashes on the base URL.
pub fn build_key_url(base_url: &str, lesson_id: &str, asset_name: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        base_url.trim_end_matches('/'),
        lesson_id,
        asset_name,
        KEY_FILE_NAME
    )
}

// Err(None) means empty; the caller picks the field-specific variant.
fn validate_identifier(field: &'static str, value: &str) -> Result<(), Option<InvalidJob>> {
    if value.is_empty() {
        return Err(None);
    }
    if value.contains('/') || value.contains('\\') || value == "." || value == ".." {
        return Err(Some(InvalidJob::PathSeparator {
            field,
            value: value.to_string(),
        }));
    }
    Ok(())
}

// The asset name prefixes the segment template and names a directory next to
// the key material.
fn validate_asset_name(value: &str) -> Result<(), InvalidJob> {
    if value.contains('%') {
        return Err(InvalidJob::TemplateCharacter(value.to_string()));
    }
    if [KEY_FILE_NAME, KEY_INFO_FILE_NAME, DURATION_FILE_NAME].contains(&value) {
        return Err(InvalidJob::ReservedAssetName(value.to_string()));
    }
    Ok(())
}
