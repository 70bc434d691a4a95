//! Asynchronous job-polling backend.
//!
//! Uploads the audio to remote object storage once (de-duplicated by
//! content hash), submits a transcription job and polls for its result
//! object, then parses the result envelope into timed tokens.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::backend::{drive, AnalyzeError, CueSink, CueStream, TranscriptionBackend};
use crate::audio::AudioSource;
use crate::config::PollingOptions;
use crate::segment::{segment_timed_tokens, TimedToken};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";
const STATUS_COMPLETED: &str = "COMPLETED";
const STATUS_FAILED: &str = "FAILED";

/// Coarse job state reported by the job service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    fn parse(s: &str) -> Self {
        match s {
            STATUS_COMPLETED => Self::Completed,
            STATUS_FAILED => Self::Failed,
            _ => Self::InProgress,
        }
    }
}

/// Job submission parameters.
#[derive(Debug, Clone, Serialize)]
pub struct JobRequest {
    #[serde(rename = "jobName")]
    pub name: String,
    #[serde(rename = "languageCode")]
    pub language: String,
    #[serde(rename = "mediaKey")]
    pub media_key: String,
    #[serde(rename = "mediaFormat")]
    pub media_format: String,
    #[serde(rename = "sampleRateHertz")]
    pub sample_rate: u32,
    #[serde(rename = "outputKey")]
    pub output_key: String,
}

/// Remote object storage: list by prefix, put, get.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, AnalyzeError>;
    async fn put(&self, key: &str, content_type: &str, body: Vec<u8>) -> Result<(), AnalyzeError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, AnalyzeError>;
}

/// Remote transcription job service: submit and poll.
#[async_trait]
pub trait TranscribeJobs: Send + Sync {
    async fn submit(&self, request: &JobRequest) -> Result<JobStatus, AnalyzeError>;
    async fn status(&self, name: &str) -> Result<JobStatus, AnalyzeError>;
}

/// Lowercase hex SHA-256 of the encoded audio buffer.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Remote name of the uploaded audio: identical content under the same
/// local name always maps to the same object.
pub fn source_object_name(hash: &str, file_stem: &str) -> String {
    format!("{}-{}.wav", hash, file_stem)
}

pub fn job_name(source_object: &str) -> String {
    format!("{}-transcribe", source_object)
}

pub fn result_object_name(job: &str) -> String {
    format!("{}.json", job)
}

/// Job result envelope written to object storage by the service.
/// Field names follow the service's JSON output.
#[derive(Debug, Default, Deserialize)]
#[allow(dead_code)]
pub struct JobResultEnvelope {
    #[serde(rename = "jobName", default)]
    pub job_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "failureReason", default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub results: JobResults,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobResults {
    #[serde(default)]
    pub items: Vec<ResultItem>,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct ResultItem {
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub alternatives: Vec<ResultAlternative>,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct ResultAlternative {
    #[serde(default)]
    pub confidence: String,
    #[serde(default)]
    pub content: String,
}

/// Top alternative of every item as a timed token. Punctuation items carry
/// no timestamps and parse to a zero span, which grouping never reads.
fn tokens_from_envelope(envelope: &JobResultEnvelope) -> Vec<TimedToken> {
    envelope
        .results
        .items
        .iter()
        .filter_map(|item| {
            let alternative = item.alternatives.first()?;
            Some(TimedToken {
                text: alternative.content.clone(),
                start: Duration::from_secs_f64(item.start_time.parse().unwrap_or(0.0)),
                end: Duration::from_secs_f64(item.end_time.parse().unwrap_or(0.0)),
            })
        })
        .collect()
}

pub struct PollingBackend {
    language: String,
    store: Arc<dyn ObjectStore>,
    jobs: Arc<dyn TranscribeJobs>,
}

impl PollingBackend {
    pub fn new(language: String, store: Arc<dyn ObjectStore>, jobs: Arc<dyn TranscribeJobs>) -> Self {
        Self {
            language,
            store,
            jobs,
        }
    }

    pub fn from_options(options: &PollingOptions, language: &str) -> Self {
        Self::new(
            language.to_string(),
            Arc::new(HttpObjectStore::new(&options.store_url, options.api_key.clone())),
            Arc::new(HttpTranscribeJobs::new(&options.jobs_url, options.api_key.clone())),
        )
    }
}

impl TranscriptionBackend for PollingBackend {
    fn id(&self) -> &'static str {
        "polling"
    }

    fn name(&self) -> &'static str {
        "Batch Transcription Job"
    }

    fn analyze(&self, file: &std::path::Path, cancel: CancellationToken) -> CueStream {
        let language = self.language.clone();
        let store = self.store.clone();
        let jobs = self.jobs.clone();
        let file = file.to_path_buf();
        drive(move |sink| run(language, store, jobs, file, cancel, sink))
    }
}

async fn run(
    language: String,
    store: Arc<dyn ObjectStore>,
    jobs: Arc<dyn TranscribeJobs>,
    file: PathBuf,
    cancel: CancellationToken,
    mut sink: CueSink,
) -> Result<(), AnalyzeError> {
    debug!("[polling] analyze begin");
    let source = AudioSource::open(&file)?;
    let bytes = source.bytes();
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".into());

    let hash = content_hash(&bytes);
    let source_object = source_object_name(&hash, &stem);
    let job = job_name(&source_object);
    let result_object = result_object_name(&job);

    // A result object with the job's name prefix means an earlier run over
    // this exact content already went through upload and submission.
    if store.list(&job).await?.is_empty() {
        if store.list(&format!("{}-", hash)).await?.is_empty() {
            info!("[polling] put wav to cloud ({} bytes) ...", bytes.len());
            store.put(&source_object, "audio/wav", bytes.to_vec()).await?;
        } else {
            info!("[polling] skip put wav, found in cloud '{}'", source_object);
        }

        info!("[polling] start transcription job '{}'", job);
        let submitted = jobs
            .submit(&JobRequest {
                name: job.clone(),
                language,
                media_key: source_object.clone(),
                media_format: "wav".into(),
                sample_rate: source.sample_rate(),
                output_key: result_object.clone(),
            })
            .await?;
        if submitted == JobStatus::Failed {
            return Err(AnalyzeError::JobFailed(format!(
                "job '{}' rejected on submit",
                job
            )));
        }

        info!("[polling] wait transcription job file ...");
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match jobs.status(&job).await? {
                JobStatus::Completed => break,
                JobStatus::Failed => {
                    return Err(AnalyzeError::JobFailed(format!(
                        "job '{}' reported failed",
                        job
                    )))
                }
                JobStatus::InProgress => {}
            }
            // Status fields are unreliable on some services; the result
            // object showing up also counts as completion.
            if !store.list(&job).await?.is_empty() {
                break;
            }
            if wait_or_cancel(&cancel).await {
                return Ok(());
            }
        }
    }

    info!("[polling] wait transcription result ...");
    let envelope = loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let body = store.get(&result_object).await?;
        let envelope: JobResultEnvelope =
            serde_json::from_slice(&body).map_err(|e| AnalyzeError::Parse(e.to_string()))?;
        match envelope.status.as_str() {
            STATUS_COMPLETED => break envelope,
            STATUS_FAILED => {
                return Err(AnalyzeError::JobFailed(
                    envelope
                        .failure_reason
                        .unwrap_or_else(|| "result fault".into()),
                ))
            }
            // The object may be a partial or placeholder write at first.
            _ => {}
        }
        if wait_or_cancel(&cancel).await {
            return Ok(());
        }
    };

    let tokens = tokens_from_envelope(&envelope);
    for span in segment_timed_tokens(&tokens) {
        if !sink.emit(span) {
            break;
        }
    }
    debug!("[polling] analyze end");
    Ok(())
}

/// Sleep one poll interval; `true` when cancellation cut the wait short.
async fn wait_or_cancel(cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(POLL_INTERVAL) => false,
    }
}

pub struct HttpObjectStore {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

async fn remote_error(action: &str, response: reqwest::Response) -> AnalyzeError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    AnalyzeError::Remote(format!("{} {}: {}", action, status, body))
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, AnalyzeError> {
        let url = format!("{}/objects?prefix={}", self.base_url, prefix);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| AnalyzeError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(remote_error("list objects", response).await);
        }
        response
            .json::<Vec<String>>()
            .await
            .map_err(|e| AnalyzeError::Parse(e.to_string()))
    }

    async fn put(&self, key: &str, content_type: &str, body: Vec<u8>) -> Result<(), AnalyzeError> {
        let url = format!("{}/objects/{}", self.base_url, key);
        let response = self
            .authorized(
                self.client
                    .put(&url)
                    .header("Content-Type", content_type)
                    .body(body),
            )
            .send()
            .await
            .map_err(|e| AnalyzeError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(remote_error("put object", response).await);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, AnalyzeError> {
        let url = format!("{}/objects/{}", self.base_url, key);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| AnalyzeError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(remote_error("get object", response).await);
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| AnalyzeError::Remote(e.to_string()))
    }
}

pub struct HttpTranscribeJobs {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpTranscribeJobs {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobStatusBody {
    #[serde(default)]
    status: String,
}

#[async_trait]
impl TranscribeJobs for HttpTranscribeJobs {
    async fn submit(&self, request: &JobRequest) -> Result<JobStatus, AnalyzeError> {
        let url = format!("{}/jobs", self.base_url);
        let response = self
            .authorized(self.client.post(&url).json(request))
            .send()
            .await
            .map_err(|e| AnalyzeError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(remote_error("start transcription job", response).await);
        }
        let body: JobStatusBody = response
            .json()
            .await
            .map_err(|e| AnalyzeError::Parse(e.to_string()))?;
        Ok(JobStatus::parse(&body.status))
    }

    async fn status(&self, name: &str) -> Result<JobStatus, AnalyzeError> {
        let url = format!("{}/jobs/{}", self.base_url, name);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| AnalyzeError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(remote_error("poll transcription job", response).await);
        }
        let body: JobStatusBody = response
            .json()
            .await
            .map_err(|e| AnalyzeError::Parse(e.to_string()))?;
        Ok(JobStatus::parse(&body.status))
    }
}
