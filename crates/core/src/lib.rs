//! HLS Packager
//!
//! Turns a source video into an encrypted HLS package: a fresh AES-128 key,
//! fixed-length segments and a VOD playlist from an external transcoder, all
//! bundled into one zip archive ready for upload.

pub mod encode;
pub mod job;
pub mod keygen;
pub mod package;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod startup;
pub mod worker;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_support;

pub use hls_packager_config as config;
pub use hls_packager_config::{BaseUrlProvider, Config};
pub use encode::{
    build_hls_command, FfmpegTranscoder, HlsEncodeSettings, SegmentedOutput, TranscodeError,
    TranscodeRequest, Transcoder,
};
pub use job::{build_key_url, AssetIdentifiers, ConversionJob, InvalidJob};
pub use keygen::{
    EncryptionKeyMaterial, KeyGenerationError, KeyMaterialGenerator, OpensslRandom, RandomSource,
    SystemRandom,
};
pub use package::{ArchiveBundle, ArtifactPackager, CleanupWarning, PackagingError};
pub use pipeline::{
    ConversionPipeline, JobState, PipelineError, PipelineSettings, Stage, StageError,
};
pub use probe::{FfprobeProber, MediaMetadata, MediaProber, ProbeError};
pub use progress::{JobEvent, ProgressReporter};
pub use startup::{check_tools, parse_tool_version, run_startup_checks, StartupError, ToolReport};
pub use worker::{ConversionWorker, JobHandle, WorkerError};
pub use workspace::JobWorkspace;
