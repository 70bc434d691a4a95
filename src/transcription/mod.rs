//! Pluggable transcription backends.

mod backend;
mod polling;
mod recognize;
mod streaming;

pub use backend::{AnalyzeError, CueStream, TranscriptionBackend};
pub use polling::{
    content_hash, job_name, result_object_name, source_object_name, HttpObjectStore,
    HttpTranscribeJobs, JobRequest, JobStatus, ObjectStore, PollingBackend, TranscribeJobs,
};
pub use recognize::{
    RecognizeLoopBackend, Recognized, RecognizerFactory, Utterance, UtteranceRecognizer,
    WsRecognizerFactory,
};
pub use streaming::{
    AudioFrameSink, RecognitionAlternative, RecognitionResult, ResultBatch, ResultBatchSource,
    StreamingBackend, StreamingRecognizer, StreamingSession, TimedWord, WsStreamingRecognizer,
};

use crate::config::Config;

/// The closed set of backend shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Polling,
    Streaming,
    RecognizeLoop,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(Self::Polling),
            "streaming" => Ok(Self::Streaming),
            "recognize" => Ok(Self::RecognizeLoop),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Build one backend from configuration.
pub fn create_backend(kind: BackendKind, config: &Config) -> Box<dyn TranscriptionBackend> {
    match kind {
        BackendKind::Polling => Box::new(PollingBackend::from_options(
            &config.polling,
            &config.language,
        )),
        BackendKind::Streaming => Box::new(StreamingBackend::from_options(
            &config.streaming,
            &config.language,
        )),
        BackendKind::RecognizeLoop => Box::new(RecognizeLoopBackend::from_options(
            &config.recognize,
            &config.language,
        )),
    }
}

/// Every configured backend, for selection by the consumer.
pub fn available_backends(config: &Config) -> Vec<Box<dyn TranscriptionBackend>> {
    [
        BackendKind::Polling,
        BackendKind::Streaming,
        BackendKind::RecognizeLoop,
    ]
    .into_iter()
    .map(|kind| create_backend(kind, config))
    .collect()
}
