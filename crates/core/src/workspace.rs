//! Per-job scratch directory.
//!
//! Every job gets its own `<scratch>/job-<id>/` holding the key, key-info,
//! duration record and transcoder output, so concurrent jobs never share a path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Key file name, inside the workspace and inside the archive
pub const KEY_FILE_NAME: &str = "enc.key";
/// Key-info descriptor file name
pub const KEY_INFO_FILE_NAME: &str = "enc.keyinfo";
/// Duration record file name
pub const DURATION_FILE_NAME: &str = "duration.txt";

/// Isolated working directory of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWorkspace {
    root: PathBuf,
}

impl JobWorkspace {
    /// Create `<scratch_dir>/job-<job_id>/`.
    ///
    /// Fails if the directory already exists; a workspace is never shared.
    pub fn create(scratch_dir: &Path, job_id: &str) -> io::Result<Self> {
        fs::create_dir_all(scratch_dir)?;
        let root = scratch_dir.join(format!("job-{}", job_id));
        fs::create_dir(&root)?;
        // The transcoder resolves the relative key file name against this
        // directory, so keep it absolute.
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_path(&self) -> PathBuf {
        self.root.join(KEY_FILE_NAME)
    }

    pub fn key_info_path(&self) -> PathBuf {
        self.root.join(KEY_INFO_FILE_NAME)
    }

    pub fn duration_path(&self) -> PathBuf {
        self.root.join(DURATION_FILE_NAME)
    }

    /// Directory the transcoder writes playlist and segments into
    pub fn output_dir(&self, asset_name: &str) -> PathBuf {
        self.root.join(asset_name)
    }

    /// Delete the workspace and everything in it
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_workspace_layout() {
        let scratch = TempDir::new().unwrap();
        let ws = JobWorkspace::create(scratch.path(), "abc").unwrap();

        assert!(ws.root().is_dir());
        assert!(ws.root().is_absolute());
        assert!(ws.root().ends_with("job-abc"));
        assert_eq!(ws.key_path(), ws.root().join("enc.key"));
        assert_eq!(ws.key_info_path(), ws.root().join("enc.keyinfo"));
        assert_eq!(ws.duration_path(), ws.root().join("duration.txt"));
        assert_eq!(ws.output_dir("lecture"), ws.root().join("lecture"));
    }

    #[test]
    fn test_workspace_creates_missing_scratch_dir() {
        let scratch = TempDir::new().unwrap();
        let nested = scratch.path().join("a").join("b");
        let ws = JobWorkspace::create(&nested, "1").unwrap();
        assert!(ws.root().starts_with(nested.canonicalize().unwrap()));
    }

    #[test]
    fn test_workspace_is_never_reused() {
        let scratch = TempDir::new().unwrap();
        let _first = JobWorkspace::create(scratch.path(), "same").unwrap();
        let second = JobWorkspace::create(scratch.path(), "same");
        assert_eq!(
            second.unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let scratch = TempDir::new().unwrap();
        let ws = JobWorkspace::create(scratch.path(), "gone").unwrap();
        fs::write(ws.key_path(), [0u8; 16]).unwrap();
        fs::create_dir_all(ws.output_dir("x")).unwrap();

        ws.remove().unwrap();
        assert!(!ws.root().exists());
        ws.remove().unwrap();
    }
}
