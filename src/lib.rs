pub mod audio;
pub mod cancel;
pub mod config;
pub mod logger;
pub mod segment;
pub mod srt;
pub mod transcription;

pub use cancel::with_enforced_cancellation;
pub use config::Config;
pub use srt::Cue;
pub use transcription::{
    available_backends, create_backend, AnalyzeError, BackendKind, CueStream,
    TranscriptionBackend,
};
