//! HLS segmenting and encryption via an external transcoder

pub mod hls;
pub mod playlist;

pub use hls::{
    build_hls_command, parse_progress_line, FfmpegTranscoder, HlsEncodeSettings,
    TranscodeError, TranscodeRequest, Transcoder,
};
pub use playlist::{parse_segments, verify_output, PlaylistError, SegmentedOutput};
