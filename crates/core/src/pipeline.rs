//! Conversion pipeline
//!
//! Runs one job through its stages strictly in order: prepare the workspace,
//! generate key material, probe the duration, transcode, package. The first
//! failing stage ends the job; nothing is retried.

use crate::encode::{FfmpegTranscoder, TranscodeError, TranscodeRequest, Transcoder};
use crate::job::{ConversionJob, InvalidJob};
use crate::keygen::{KeyGenerationError, KeyMaterialGenerator};
use crate::package::{ArchiveBundle, ArtifactPackager, PackagingError};
use crate::probe::{probe_and_record, FfprobeProber, MediaProber};
use crate::progress::{
    transcode_progress, ProgressReporter, PROGRESS_DONE, PROGRESS_KEY_READY, PROGRESS_PROBED,
    PROGRESS_STARTED, PROGRESS_TRANSCODED,
};
use crate::workspace::JobWorkspace;
use hls_packager_config::Config;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pipeline stage, as reported in errors and failed states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Prepare,
    KeyGeneration,
    Transcode,
    Packaging,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::KeyGeneration => "key generation",
            Stage::Transcode => "transcode",
            Stage::Packaging => "packaging",
        }
    }

    /// Stage a job was in when it had reported `progress`
    pub fn from_progress(progress: u8) -> Self {
        if progress < PROGRESS_STARTED {
            Stage::Prepare
        } else if progress < PROGRESS_KEY_READY {
            Stage::KeyGeneration
        } else if progress < PROGRESS_TRANSCODED {
            Stage::Transcode
        } else {
            Stage::Packaging
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one job
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Idle,
    KeyGenerated,
    DurationProbed,
    Transcoded,
    Packaged,
    Done,
    Failed { stage: Stage, cause: String },
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Idle => "idle",
            JobState::KeyGenerated => "key_generated",
            JobState::DurationProbed => "duration_probed",
            JobState::Transcoded => "transcoded",
            JobState::Packaged => "packaged",
            JobState::Done => "done",
            JobState::Failed { .. } => "failed",
        }
    }
}

/// What went wrong inside a stage
#[derive(Debug, Error)]
pub enum StageError {
    #[error("invalid job: {0}")]
    InvalidJob(#[from] InvalidJob),

    #[error("job workspace unavailable: {0}")]
    Workspace(io::Error),

    #[error(transparent)]
    Key(#[from] KeyGenerationError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error(transparent)]
    Packaging(#[from] PackagingError),

    #[error("cancelled")]
    Cancelled,

    #[error("worker task panicked: {0}")]
    Panicked(String),
}

/// The single terminal error of a failed job
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl PipelineError {
    pub fn new(stage: Stage, source: impl Into<StageError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, StageError::Cancelled)
    }
}

/// Where jobs work and where archives land
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Parent of the per-job workspaces
    pub scratch_dir: PathBuf,
    /// Archive destination; `None` puts the archive next to the input file
    pub output_dir: Option<PathBuf>,
    /// Leave the job workspace on disk after the job ends
    pub keep_intermediates: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scratch_dir: config.workspace.resolved_scratch_dir(),
            output_dir: config.workspace.output_dir.clone(),
            keep_intermediates: config.workspace.keep_intermediates,
        }
    }
}

/// Sequential orchestrator of one conversion
#[derive(Clone)]
pub struct ConversionPipeline {
    keygen: KeyMaterialGenerator,
    prober: Arc<dyn MediaProber>,
    transcoder: Arc<dyn Transcoder>,
    packager: ArtifactPackager,
    settings: PipelineSettings,
}

impl ConversionPipeline {
    /// Pipeline backed by the external tools named in `config`
    pub fn from_config(config: &Config) -> Self {
        Self::with_components(
            KeyMaterialGenerator::from_config(config),
            Arc::new(FfprobeProber::new(&config.tools.ffprobe)),
            Arc::new(FfmpegTranscoder::from_config(config)),
            ArtifactPackager::new(),
            PipelineSettings::from_config(config),
        )
    }

    pub fn with_components(
        keygen: KeyMaterialGenerator,
        prober: Arc<dyn MediaProber>,
        transcoder: Arc<dyn Transcoder>,
        packager: ArtifactPackager,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            keygen,
            prober,
            transcoder,
            packager,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run `job` to completion, reporting progress and state changes.
    ///
    /// The job workspace is removed when the job ends, successfully or not,
    /// unless intermediates are kept.
    pub async fn run(
        &self,
        job: &ConversionJob,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ArchiveBundle, PipelineError> {
        reporter.state(JobState::Idle);
        info!(job = %job.id, input = %job.input_path.display(), "Starting conversion");

        let result = self.run_job(job, reporter, cancel).await;
        match &result {
            Ok(bundle) => {
                info!(job = %job.id, archive = %bundle.path.display(), "Conversion complete");
                reporter.state(JobState::Done);
            }
            Err(e) => {
                error!(job = %job.id, stage = %e.stage, error = %e.source, "Conversion failed");
                reporter.state(JobState::Failed {
                    stage: e.stage,
                    cause: e.source.to_string(),
                });
            }
        }
        result
    }

    async fn run_job(
        &self,
        job: &ConversionJob,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ArchiveBundle, PipelineError> {
        let prepare = |e: StageError| PipelineError::new(Stage::Prepare, e);

        check_cancelled(cancel, Stage::Prepare)?;
        job.validate().map_err(|e| prepare(e.into()))?;
        let input = job
            .input_path
            .canonicalize()
            .map_err(|_| prepare(InvalidJob::InputNotFound(job.input_path.clone()).into()))?;
        let destination = match &self.settings.output_dir {
            Some(dir) => dir.clone(),
            None => input
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| prepare(InvalidJob::InputNotFile(input.clone()).into()))?,
        };
        remove_stale_archive(&destination.join(format!("{}.zip", job.asset_name())))
            .map_err(|e| prepare(StageError::Workspace(e)))?;
        let workspace = JobWorkspace::create(&self.settings.scratch_dir, &job.id)
            .map_err(|e| prepare(StageError::Workspace(e)))?;
        reporter.progress(PROGRESS_STARTED);

        let result = self
            .run_stages(job, &input, &workspace, &destination, reporter, cancel)
            .await;

        if self.settings.keep_intermediates {
            info!(workspace = %workspace.root().display(), "Keeping intermediates");
        } else {
            // Failures only produce a warning
            let _ = self.packager.cleanup(&workspace);
        }
        result
    }

    async fn run_stages(
        &self,
        job: &ConversionJob,
        input: &Path,
        workspace: &JobWorkspace,
        destination: &Path,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ArchiveBundle, PipelineError> {
        // Key generation
        check_cancelled(cancel, Stage::KeyGeneration)?;
        let key = {
            let keygen = self.keygen.clone();
            let ws = workspace.clone();
            let key_url = job.key_url();
            tokio::task::spawn_blocking(move || keygen.generate(&ws, &key_url))
                .await
                .map_err(|e| PipelineError::new(Stage::KeyGeneration, StageError::Panicked(e.to_string())))?
                .map_err(|e| PipelineError::new(Stage::KeyGeneration, e))?
        };
        info!(job = %job.id, key_url = %key.key_url, source = self.keygen.source_name(), "Key material ready");
        reporter.state(JobState::KeyGenerated);
        reporter.progress(PROGRESS_KEY_READY);

        // Duration probe, best effort
        check_cancelled(cancel, Stage::Transcode)?;
        let duration_path = workspace.duration_path();
        let metadata = probe_and_record(self.prober.as_ref(), input, &duration_path).await;
        reporter.state(JobState::DurationProbed);
        reporter.progress(PROGRESS_PROBED);

        // Transcode
        check_cancelled(cancel, Stage::Transcode)?;
        let request = TranscodeRequest {
            input_path: input.to_path_buf(),
            output_dir: workspace.output_dir(job.asset_name()),
            asset_name: job.asset_name().to_string(),
            key_info_path: key.key_info_path.clone(),
            working_dir: workspace.root().to_path_buf(),
        };
        let duration_secs = metadata.map(|m| m.duration_secs);
        let transcode_reporter = reporter.clone();
        let on_progress = move |encoded_secs: f64| {
            if let Some(total) = duration_secs {
                transcode_reporter.progress(transcode_progress(encoded_secs, total));
            }
        };
        let output = self
            .transcoder
            .transcode(&request, &on_progress, cancel)
            .await
            .map_err(|e| match e {
                TranscodeError::Cancelled => PipelineError::new(Stage::Transcode, StageError::Cancelled),
                other => PipelineError::new(Stage::Transcode, other),
            })?;
        info!(job = %job.id, segments = output.segments.len(), "Transcode complete");
        reporter.state(JobState::Transcoded);
        reporter.progress(PROGRESS_TRANSCODED);

        // Packaging
        check_cancelled(cancel, Stage::Packaging)?;
        let mut bundle = {
            let packager = self.packager.clone();
            let output_dir = output.output_dir.clone();
            let duration_file = metadata.map(|_| duration_path.clone());
            let destination = destination.to_path_buf();
            tokio::task::spawn_blocking(move || {
                packager.package(&output_dir, &key, duration_file.as_deref(), &destination)
            })
            .await
            .map_err(|e| PipelineError::new(Stage::Packaging, StageError::Panicked(e.to_string())))?
            .map_err(|e| PipelineError::new(Stage::Packaging, e))?
        };
        bundle.duration_secs = duration_secs;
        if bundle.segment_count != output.segments.len() {
            warn!(
                archived = bundle.segment_count,
                listed = output.segments.len(),
                "Archive segment count differs from playlist"
            );
        }
        reporter.state(JobState::Packaged);
        reporter.progress(PROGRESS_DONE);

        Ok(bundle)
    }
}

fn check_cancelled(cancel: &CancellationToken, stage: Stage) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::new(stage, StageError::Cancelled))
    } else {
        Ok(())
    }
}

// A failed job must not leave an earlier run's archive at its destination.
fn remove_stale_archive(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            warn!(archive = %path.display(), "Removed archive from an earlier run");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::OpensslRandom;
    use crate::progress::JobEvent;
    use crate::test_support::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    const BASE_URL: &str = "https://cdn.example.com/videos/course";

    fn split_events(rx: &mut UnboundedReceiver<JobEvent>) -> (Vec<u8>, Vec<JobState>) {
        let mut progress = Vec::new();
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                JobEvent::Progress(p) => progress.push(p),
                JobEvent::State(s) => states.push(s),
            }
        }
        (progress, states)
    }

    #[tokio::test]
    async fn test_lecture_scenario() {
        let media = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let input = write_input(media.path(), "lecture.mp4");
        let pipeline = fake_pipeline(
            scratch.path(),
            None,
            FakeProber(Some(30.5)),
            FakeTranscoder::succeed(4).with_progress(vec![15.25, 30.5]),
        );
        let job = ConversionJob::new(&input, "101", BASE_URL);
        let (reporter, mut rx) = ProgressReporter::channel();

        let bundle = pipeline
            .run(&job, &reporter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bundle.path, media.path().canonicalize().unwrap().join("lecture.zip"));
        assert_eq!(bundle.segment_count, 4);
        assert_eq!(bundle.duration_secs, Some(30.5));
        assert_eq!(
            archive_entries(&bundle.path),
            vec![
                "duration.txt",
                "enc.key",
                "enc.keyinfo",
                "lecture.m3u8",
                "lecture_000.ts",
                "lecture_001.ts",
                "lecture_002.ts",
                "lecture_003.ts",
            ]
        );
        let key_info = String::from_utf8(read_entry(&bundle.path, "enc.keyinfo")).unwrap();
        assert_eq!(
            key_info.lines().collect::<Vec<_>>(),
            vec!["https://cdn.example.com/videos/course/101/lecture/enc.key", "enc.key"]
        );
        assert_eq!(read_entry(&bundle.path, "duration.txt"), b"30.5");
        assert_eq!(read_entry(&bundle.path, "enc.key").len(), 16);

        let (progress, states) = split_events(&mut rx);
        assert_eq!(progress, vec![10, 30, 40, 54, 69, 70, 100]);
        assert_eq!(
            states,
            vec![
                JobState::Idle,
                JobState::KeyGenerated,
                JobState::DurationProbed,
                JobState::Transcoded,
                JobState::Packaged,
                JobState::Done,
            ]
        );
        assert!(dir_entries(scratch.path()).is_empty());
    }

    #[tokio::test]
    async fn test_probe_failure_still_succeeds() {
        let media = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let input = write_input(media.path(), "intro.mov");
        let pipeline = fake_pipeline(
            scratch.path(),
            None,
            FakeProber(None),
            FakeTranscoder::succeed(1).with_progress(vec![3.0, 6.0]),
        );
        let (reporter, mut rx) = ProgressReporter::channel();

        let bundle = pipeline
            .run(&ConversionJob::new(&input, "7", BASE_URL), &reporter, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!archive_entries(&bundle.path).contains(&"duration.txt".to_string()));
        assert_eq!(bundle.duration_secs, None);
        // No duration, so no intermediate transcode progress
        let (progress, _) = split_events(&mut rx);
        assert_eq!(progress, vec![10, 30, 40, 70, 100]);
    }

    #[tokio::test]
    async fn test_transcoder_failure_is_transcode_stage() {
        let media = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let input = write_input(media.path(), "lecture.mp4");
        let pipeline = fake_pipeline(
            scratch.path(),
            None,
            FakeProber(Some(12.0)),
            FakeTranscoder::fail(1).with_progress(vec![6.0]),
        );
        let (reporter, mut rx) = ProgressReporter::channel();

        let err = pipeline
            .run(&ConversionJob::new(&input, "101", BASE_URL), &reporter, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Transcode);
        assert!(err.to_string().starts_with("transcode failed: "));
        assert!(matches!(
            err.source,
            StageError::Transcode(TranscodeError::Failed { exit_code: 1, .. })
        ));
        assert!(!media.path().join("lecture.zip").exists());
        assert!(dir_entries(scratch.path()).is_empty());

        let (progress, states) = split_events(&mut rx);
        assert!(progress.iter().all(|p| *p < 100));
        assert!(matches!(
            states.last(),
            Some(JobState::Failed { stage: Stage::Transcode, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_run_leaves_no_earlier_archive() {
        let media = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let input = write_input(media.path(), "lecture.mp4");
        let stale = media.path().join("lecture.zip");
        std::fs::write(&stale, "earlier run").unwrap();
        let pipeline = fake_pipeline(scratch.path(), None, FakeProber(Some(12.0)), FakeTranscoder::fail(1));

        let err = pipeline
            .run(
                &ConversionJob::new(&input, "101", BASE_URL),
                &ProgressReporter::disabled(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Transcode);
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_invalid_job_fails_in_prepare() {
        let media = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let input = write_input(media.path(), "lecture.mp4");
        let pipeline = fake_pipeline(scratch.path(), None, FakeProber(None), FakeTranscoder::succeed(1));

        let err = pipeline
            .run(
                &ConversionJob::new(&input, "  ", BASE_URL),
                &ProgressReporter::disabled(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Prepare);
        assert!(matches!(err.source, StageError::InvalidJob(InvalidJob::EmptyLessonId)));

        let err = pipeline
            .run(
                &ConversionJob::new(media.path().join("absent.mp4"), "1", BASE_URL),
                &ProgressReporter::disabled(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.source, StageError::InvalidJob(InvalidJob::InputNotFound(_))));
        assert!(dir_entries(scratch.path()).is_empty());
    }

    #[tokio::test]
    async fn test_key_generation_failure() {
        let media = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let input = write_input(media.path(), "lecture.mp4");
        let pipeline = ConversionPipeline::with_components(
            KeyMaterialGenerator::new(Arc::new(OpensslRandom::new(
                "/nonexistent/bin/openssl-for-tests",
            ))),
            Arc::new(FakeProber(Some(1.0))),
            Arc::new(FakeTranscoder::succeed(1)),
            ArtifactPackager::new(),
            PipelineSettings {
                scratch_dir: scratch.path().to_path_buf(),
                output_dir: None,
                keep_intermediates: false,
            },
        );

        let err = pipeline
            .run(
                &ConversionJob::new(&input, "1", BASE_URL),
                &ProgressReporter::disabled(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::KeyGeneration);
        assert!(err.to_string().starts_with("key generation failed: "));
        assert!(dir_entries(scratch.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let media = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let input = write_input(media.path(), "lecture.mp4");
        let pipeline = fake_pipeline(scratch.path(), None, FakeProber(None), FakeTranscoder::succeed(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline
            .run(&ConversionJob::new(&input, "1", BASE_URL), &ProgressReporter::disabled(), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Prepare);
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_during_transcode() {
        let media = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let input = write_input(media.path(), "lecture.mp4");
        let pipeline = fake_pipeline(scratch.path(), None, FakeProber(Some(60.0)), FakeTranscoder::hang());
        let cancel = CancellationToken::new();
        cancel_after(cancel.clone(), Duration::from_millis(50));

        let err = pipeline
            .run(&ConversionJob::new(&input, "1", BASE_URL), &ProgressReporter::disabled(), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Transcode);
        assert!(err.is_cancelled());
        assert!(!media.path().join("lecture.zip").exists());
        assert!(dir_entries(scratch.path()).is_empty());
    }

    #[tokio::test]
    async fn test_configured_output_dir_and_kept_workspace() {
        let media = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let input = write_input(media.path(), "lecture.mp4");
        let mut pipeline = fake_pipeline(
            scratch.path(),
            Some(out.path().to_path_buf()),
            FakeProber(Some(9.0)),
            FakeTranscoder::succeed(1),
        );
        pipeline.settings.keep_intermediates = true;
        let job = ConversionJob::new(&input, "1", BASE_URL);

        let bundle = pipeline
            .run(&job, &ProgressReporter::disabled(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bundle.path, out.path().join("lecture.zip"));
        let workspace = scratch.path().join(format!("job-{}", job.id));
        assert!(workspace.join("enc.key").is_file());
        assert!(workspace.join("lecture").join("lecture.m3u8").is_file());
    }

    #[tokio::test]
    async fn test_repeat_runs_same_entries_fresh_keys() {
        let media = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let out_a = TempDir::new().unwrap();
        let out_b = TempDir::new().unwrap();
        let input = write_input(media.path(), "lecture.mp4");

        let mut archives = Vec::new();
        for out in [&out_a, &out_b] {
            let pipeline = fake_pipeline(
                scratch.path(),
                Some(out.path().to_path_buf()),
                FakeProber(Some(20.0)),
                FakeTranscoder::succeed(3),
            );
            let bundle = pipeline
                .run(
                    &ConversionJob::new(&input, "101", BASE_URL),
                    &ProgressReporter::disabled(),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            archives.push(bundle.path);
        }

        assert_eq!(archive_entries(&archives[0]), archive_entries(&archives[1]));
        assert_ne!(
            read_entry(&archives[0], "enc.key"),
            read_entry(&archives[1], "enc.key")
        );
    }

    #[test]
    fn test_stage_display_and_lookup() {
        assert_eq!(Stage::KeyGeneration.to_string(), "key generation");
        assert_eq!(Stage::from_progress(0), Stage::Prepare);
        assert_eq!(Stage::from_progress(10), Stage::KeyGeneration);
        assert_eq!(Stage::from_progress(55), Stage::Transcode);
        assert_eq!(Stage::from_progress(70), Stage::Packaging);

        let err = PipelineError::new(Stage::Packaging, StageError::Cancelled);
        assert_eq!(err.to_string(), "packaging failed: cancelled");
    }
}
