//! Encryption key material for AES-128 segment encryption.
//!
//! Produces the 16-byte key file and the two-line key-info descriptor the
//! transcoder reads: the URL players fetch the key from, then the local key
//! file name.

use crate::workspace::{JobWorkspace, KEY_FILE_NAME};
use hls_packager_config::{Config, KeySourceKind};
use rand::RngCore;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;

/// AES-128 key length in bytes
pub const KEY_LEN: usize = 16;

/// Error type for key generation
#[derive(Debug, Error)]
pub enum KeyGenerationError {
    /// The random-byte tool could not be started
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },

    /// The random-byte tool exited unsuccessfully
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    /// The in-process random source refused to produce bytes
    #[error("random source unavailable: {0}")]
    Unavailable(String),

    /// The key file does not hold exactly the expected number of bytes
    #[error("key file holds {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to read key file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
}

/// Something that can fill a file with random bytes
pub trait RandomSource: Send + Sync {
    /// Write exactly `len` random bytes to `dest`
    fn write_random(&self, dest: &Path, len: usize) -> Result<(), KeyGenerationError>;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// `openssl rand -out <dest> <len>`
#[derive(Debug, Clone)]
pub struct OpensslRandom {
    program: PathBuf,
}

impl OpensslRandom {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Build the `openssl rand` invocation
    pub fn build_command(&self, dest: &Path, len: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("rand").arg("-out").arg(dest).arg(len.to_string());
        cmd
    }
}

impl RandomSource for OpensslRandom {
    fn write_random(&self, dest: &Path, len: usize) -> Result<(), KeyGenerationError> {
        let program = self.program.display().to_string();
        let output = self
            .build_command(dest, len)
            .output()
            .map_err(|source| KeyGenerationError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(KeyGenerationError::Failed {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "openssl"
    }
}

/// Operating system CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRandom;

impl RandomSource for SystemRandom {
    fn write_random(&self, dest: &Path, len: usize) -> Result<(), KeyGenerationError> {
        let mut bytes = vec![0u8; len];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| KeyGenerationError::Unavailable(e.to_string()))?;
        fs::write(dest, &bytes).map_err(|source| KeyGenerationError::Write {
            path: dest.to_path_buf(),
            source,
        })
    }

    fn name(&self) -> &str {
        "system"
    }
}

/// Key bytes plus the files written for them
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKeyMaterial {
    pub key: [u8; KEY_LEN],
    /// `enc.key` inside the job workspace
    pub key_path: PathBuf,
    /// `enc.keyinfo` inside the job workspace
    pub key_info_path: PathBuf,
    /// URL written on the first key-info line
    pub key_url: String,
}

// Keep key bytes out of logs.
impl fmt::Debug for EncryptionKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKeyMaterial")
            .field("key", &"<redacted>")
            .field("key_path", &self.key_path)
            .field("key_info_path", &self.key_info_path)
            .field("key_url", &self.key_url)
            .finish()
    }
}

/// Key-info file body: key URL, then the key file name, one per line.
pub fn key_info_contents(key_url: &str) -> String {
    format!("{}\n{}\n", key_url, KEY_FILE_NAME)
}

/// Generates per-job key material from a pluggable random source
#[derive(Clone)]
pub struct KeyMaterialGenerator {
    source: Arc<dyn RandomSource>,
}

impl KeyMaterialGenerator {
    pub fn new(source: Arc<dyn RandomSource>) -> Self {
        Self { source }
    }

    /// Pick the random source named in the configuration
    pub fn from_config(config: &Config) -> Self {
        let source: Arc<dyn RandomSource> = match config.key.source {
            KeySourceKind::Openssl => Arc::new(OpensslRandom::new(&config.tools.openssl)),
            KeySourceKind::System => Arc::new(SystemRandom),
        };
        Self::new(source)
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Write `enc.key` and `enc.keyinfo` into the workspace.
    ///
    /// # Errors
    /// Returns an error if the random source fails, the key file is not exactly
    /// 16 bytes, or either file cannot be written.
    pub fn generate(
        &self,
        workspace: &JobWorkspace,
        key_url: &str,
    ) -> Result<EncryptionKeyMaterial, KeyGenerationError> {
        let key_path = workspace.key_path();
        self.source.write_random(&key_path, KEY_LEN)?;

        let bytes = fs::read(&key_path).map_err(|source| KeyGenerationError::Read {
            path: key_path.clone(),
            source,
        })?;
        let key: [u8; KEY_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyGenerationError::WrongLength {
                    expected: KEY_LEN,
                    actual: bytes.len(),
                })?;

        let key_info_path = workspace.key_info_path();
        fs::write(&key_info_path, key_info_contents(key_url)).map_err(|source| {
            KeyGenerationError::Write {
                path: key_info_path.clone(),
                source,
            }
        })?;

        Ok(EncryptionKeyMaterial {
            key,
            key_path,
            key_info_path,
            key_url: key_url.to_string(),
        })
    }
}
