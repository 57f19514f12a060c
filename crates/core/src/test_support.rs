//! Fakes for pipeline and worker tests.

use crate::encode::{verify_output, SegmentedOutput, TranscodeError, TranscodeRequest, Transcoder};
use crate::keygen::{KeyMaterialGenerator, SystemRandom};
use crate::package::ArtifactPackager;
use crate::pipeline::{ConversionPipeline, PipelineSettings};
use crate::probe::{MediaProber, ProbeError};
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use zip::ZipArchive;

/// Answers every probe with a fixed duration, or fails when `None`
pub struct FakeProber(pub Option<f64>);

#[async_trait]
impl MediaProber for FakeProber {
    async fn probe_duration(&self, _input: &Path) -> Result<f64, ProbeError> {
        self.0.ok_or_else(|| ProbeError::Parse("N/A".to_string()))
    }
}

/// How a [`FakeTranscoder`] behaves
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Write an encrypted playlist with this many segments
    Succeed { segments: usize },
    /// Exit as if the transcoder returned this code
    Fail { exit_code: i32 },
    /// Keep running until cancelled
    Hang,
}

/// Transcoder that writes plausible HLS output without running anything
pub struct FakeTranscoder {
    pub behavior: FakeBehavior,
    /// Encoded-seconds values reported before finishing
    pub progress: Vec<f64>,
}

impl FakeTranscoder {
    pub fn succeed(segments: usize) -> Self {
        Self {
            behavior: FakeBehavior::Succeed { segments },
            progress: Vec::new(),
        }
    }

    pub fn fail(exit_code: i32) -> Self {
        Self {
            behavior: FakeBehavior::Fail { exit_code },
            progress: Vec::new(),
        }
    }

    pub fn hang() -> Self {
        Self {
            behavior: FakeBehavior::Hang,
            progress: Vec::new(),
        }
    }

    pub fn with_progress(mut self, progress: Vec<f64>) -> Self {
        self.progress = progress;
        self
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<SegmentedOutput, TranscodeError> {
        fs::create_dir_all(&request.output_dir)?;

        // ffmpeg resolves the key file named in the key-info against its cwd
        let key_info = fs::read_to_string(&request.key_info_path)?;
        let key_name = key_info.lines().nth(1).unwrap_or_default();
        assert!(request.working_dir.join(key_name).is_file());

        for secs in &self.progress {
            on_progress(*secs);
        }

        match self.behavior {
            FakeBehavior::Fail { exit_code } => Err(TranscodeError::Failed {
                exit_code,
                stderr: "Conversion failed!".to_string(),
            }),
            FakeBehavior::Hang => {
                cancel.cancelled().await;
                Err(TranscodeError::Cancelled)
            }
            FakeBehavior::Succeed { segments } => {
                let key_url = key_info.lines().next().unwrap_or_default();
                let mut playlist = format!(
                    "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:9\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXT-X-KEY:METHOD=AES-128,URI=\"{}\"\n",
                    key_url
                );
                for i in 0..segments {
                    let name = format!("{}_{:03}.ts", request.asset_name, i);
                    fs::write(request.output_dir.join(&name), format!("segment {}", i))?;
                    playlist.push_str(&format!("#EXTINF:9.000000,\n{}\n", name));
                }
                playlist.push_str("#EXT-X-ENDLIST\n");
                fs::write(request.playlist_path(), playlist)?;
                Ok(verify_output(&request.output_dir, &request.playlist_path())?)
            }
        }
    }
}

/// Pipeline wired with the OS random source and the given fakes
pub fn fake_pipeline(
    scratch_dir: &Path,
    output_dir: Option<PathBuf>,
    prober: FakeProber,
    transcoder: FakeTranscoder,
) -> ConversionPipeline {
    ConversionPipeline::with_components(
        KeyMaterialGenerator::new(Arc::new(SystemRandom)),
        Arc::new(prober),
        Arc::new(transcoder),
        ArtifactPackager::new(),
        PipelineSettings {
            scratch_dir: scratch_dir.to_path_buf(),
            output_dir,
            keep_intermediates: false,
        },
    )
}

/// Write a small stand-in video file
pub fn write_input(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"not really a video").unwrap();
    path
}

/// Sorted entry names of a zip archive
pub fn archive_entries(path: &Path) -> Vec<String> {
    let archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut names: Vec<String> = archive.file_names().map(String::from).collect();
    names.sort();
    names
}

pub fn read_entry(path: &Path, name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut contents = Vec::new();
    archive
        .by_name(name)
        .unwrap()
        .read_to_end(&mut contents)
        .unwrap();
    contents
}

/// Entries of a directory, empty if it does not exist
pub fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

/// Cancel `token` after `delay`
pub fn cancel_after(token: CancellationToken, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}
