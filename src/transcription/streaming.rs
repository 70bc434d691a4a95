//! Bidirectional streaming backend.
//!
//! One task pumps encoded audio frames into the open stream while the main
//! path consumes incremental result batches, mapping each batch's top
//! alternative back onto its word timestamps.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::backend::{drive, AnalyzeError, CueSink, CueStream, TranscriptionBackend};
use crate::audio::{AudioFormat, AudioSource};
use crate::config::StreamingOptions;
use crate::segment::{CueSpan, SENTENCE_BREAKS};

/// One incremental batch of recognition results.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultBatch {
    #[serde(default)]
    pub results: Vec<RecognitionResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecognitionResult {
    #[serde(default)]
    pub alternatives: Vec<RecognitionAlternative>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecognitionAlternative {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub words: Vec<TimedWord>,
}

/// Word timing in seconds from the start of the audio.
#[derive(Debug, Clone, Deserialize)]
pub struct TimedWord {
    #[serde(rename = "startTime")]
    pub start: f64,
    #[serde(rename = "endTime")]
    pub end: f64,
}

/// Outbound half of an open recognition stream.
#[async_trait]
pub trait AudioFrameSink: Send {
    async fn write(&mut self, frame: &[u8]) -> Result<(), AnalyzeError>;
    /// Signal end-of-input; results keep arriving until the stream closes.
    async fn finish(&mut self) -> Result<(), AnalyzeError>;
}

/// Inbound half: `Ok(None)` is the natural end of the stream.
#[async_trait]
pub trait ResultBatchSource: Send {
    async fn next_batch(&mut self) -> Result<Option<ResultBatch>, AnalyzeError>;
}

/// An open bidirectional call, split for concurrent use.
pub struct StreamingSession {
    pub audio: Box<dyn AudioFrameSink>,
    pub results: Box<dyn ResultBatchSource>,
}

#[async_trait]
pub trait StreamingRecognizer: Send + Sync {
    async fn open(&self, format: &AudioFormat) -> Result<StreamingSession, AnalyzeError>;
}

/// Map punctuation-split transcript fragments onto word timestamps.
///
/// Character offsets into the transcript stand in for word indices, the
/// way the batch's word list lines up with its transcript; approximate for
/// multi-character words, so the end index is clamped to the list.
fn cues_from_alternative(transcript: &str, words: &[TimedWord]) -> Vec<CueSpan> {
    let mut cues = Vec::new();
    if words.is_empty() {
        return cues;
    }
    let mut offset = 0usize;
    for piece in transcript.split(SENTENCE_BREAKS.as_slice()) {
        let len = piece.chars().count();
        if piece.trim().is_empty() {
            offset += len;
            continue;
        }
        let first = offset.min(words.len() - 1);
        let last = (offset + len - 1).min(words.len() - 1);
        cues.push(CueSpan {
            start: Duration::from_secs_f64(words[first].start),
            end: Duration::from_secs_f64(words[last].end),
            text: piece.trim().to_string(),
        });
        offset += len;
    }
    cues
}

pub struct StreamingBackend {
    recognizer: Arc<dyn StreamingRecognizer>,
}

impl StreamingBackend {
    pub fn new(recognizer: Arc<dyn StreamingRecognizer>) -> Self {
        Self { recognizer }
    }

    pub fn from_options(options: &StreamingOptions, language: &str) -> Self {
        Self::new(Arc::new(WsStreamingRecognizer {
            url: options.url.clone(),
            api_key: options.api_key.clone(),
            language: language.to_string(),
        }))
    }
}

impl TranscriptionBackend for StreamingBackend {
    fn id(&self) -> &'static str {
        "streaming"
    }

    fn name(&self) -> &'static str {
        "Streaming Recognition"
    }

    fn analyze(&self, file: &Path, cancel: CancellationToken) -> CueStream {
        let recognizer = self.recognizer.clone();
        let file = file.to_path_buf();
        drive(move |sink| run(recognizer, file, cancel, sink))
    }
}

async fn run(
    recognizer: Arc<dyn StreamingRecognizer>,
    file: std::path::PathBuf,
    cancel: CancellationToken,
    mut sink: CueSink,
) -> Result<(), AnalyzeError> {
    debug!("[streaming] analyze begin");
    let source = AudioSource::open(&file)?;
    let StreamingSession { audio, mut results } = recognizer.open(source.format()).await?;

    let bytes = source.bytes();
    let chunk = source.chunk_size();
    tokio::spawn(pump_audio(audio, bytes, chunk, cancel.clone()));

    while let Some(batch) = next_or_cancel(results.as_mut(), &cancel).await? {
        for result in batch.results {
            let Some(alternative) = result.alternatives.into_iter().next() else {
                continue;
            };
            if alternative.words.is_empty() {
                continue;
            }
            for span in cues_from_alternative(&alternative.transcript, &alternative.words) {
                if !sink.emit(span) {
                    return Ok(());
                }
            }
        }
    }
    debug!("[streaming] analyze end");
    Ok(())
}

/// Writer task: frames out, end-of-input, done. Its failure never blocks
/// cue emission; the reader side sees the stream end instead.
async fn pump_audio(
    mut audio: Box<dyn AudioFrameSink>,
    bytes: Arc<[u8]>,
    chunk: usize,
    cancel: CancellationToken,
) {
    for frame in bytes.chunks(chunk) {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = audio.write(frame).await {
            warn!("[streaming] audio write failed: {}", e);
            return;
        }
    }
    if let Err(e) = audio.finish().await {
        warn!("[streaming] end-of-input signal failed: {}", e);
        return;
    }
    debug!("[streaming] audio upload complete ({} bytes)", bytes.len());
}

async fn next_or_cancel(
    results: &mut dyn ResultBatchSource,
    cancel: &CancellationToken,
) -> Result<Option<ResultBatch>, AnalyzeError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(None),
        batch = results.next_batch() => batch,
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// WebSocket transport: a JSON config frame up front, binary audio frames
/// out, JSON result batches back.
pub struct WsStreamingRecognizer {
    pub url: String,
    pub api_key: Option<String>,
    pub language: String,
}

#[async_trait]
impl StreamingRecognizer for WsStreamingRecognizer {
    async fn open(&self, format: &AudioFormat) -> Result<StreamingSession, AnalyzeError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| AnalyzeError::Connect(e.to_string()))?;
        if let Some(key) = &self.api_key {
            request.headers_mut().insert(
                "Authorization",
                http::header::HeaderValue::from_str(&format!("Bearer {}", key))
                    .map_err(|e| AnalyzeError::Connect(e.to_string()))?,
            );
        }

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| AnalyzeError::Connect(e.to_string()))?;
        let (mut write, read) = ws.split();

        let config = serde_json::json!({
            "config": {
                "encoding": "LINEAR16",
                "sampleRateHertz": format.sample_rate,
                "audioChannelCount": format.channels,
                "languageCode": self.language,
                "enableAutomaticPunctuation": true,
                "enableWordTimeOffsets": true,
            }
        });
        write
            .send(Message::Text(config.to_string()))
            .await
            .map_err(|e| AnalyzeError::Connect(e.to_string()))?;

        Ok(StreamingSession {
            audio: Box::new(WsAudioSink { write }),
            results: Box::new(WsBatchSource { read }),
        })
    }
}

struct WsAudioSink {
    write: WsSink,
}

#[async_trait]
impl AudioFrameSink for WsAudioSink {
    async fn write(&mut self, frame: &[u8]) -> Result<(), AnalyzeError> {
        self.write
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| AnalyzeError::Remote(e.to_string()))
    }

    async fn finish(&mut self) -> Result<(), AnalyzeError> {
        self.write
            .send(Message::Text(r#"{"event":"end"}"#.into()))
            .await
            .map_err(|e| AnalyzeError::Remote(e.to_string()))
    }
}

struct WsBatchSource {
    read: WsSource,
}

#[async_trait]
impl ResultBatchSource for WsBatchSource {
    async fn next_batch(&mut self) -> Result<Option<ResultBatch>, AnalyzeError> {
        while let Some(message) = self.read.next().await {
            match message.map_err(|e| AnalyzeError::Remote(e.to_string()))? {
                Message::Text(text) => {
                    let batch: ResultBatch = serde_json::from_str(&text)
                        .map_err(|e| AnalyzeError::Parse(e.to_string()))?;
                    return Ok(Some(batch));
                }
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeAudioSink {
        frames: Arc<Mutex<Vec<usize>>>,
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AudioFrameSink for FakeAudioSink {
        async fn write(&mut self, frame: &[u8]) -> Result<(), AnalyzeError> {
            self.frames.lock().unwrap().push(frame.len());
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), AnalyzeError> {
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeBatchSource {
        batches: VecDeque<ResultBatch>,
    }

    #[async_trait]
    impl ResultBatchSource for FakeBatchSource {
        async fn next_batch(&mut self) -> Result<Option<ResultBatch>, AnalyzeError> {
            Ok(self.batches.pop_front())
        }
    }

    struct FakeRecognizer {
        batches: Mutex<Option<VecDeque<ResultBatch>>>,
        frames: Arc<Mutex<Vec<usize>>>,
        finished: Arc<AtomicBool>,
    }

    impl FakeRecognizer {
        fn new(batches: Vec<ResultBatch>) -> Self {
            Self {
                batches: Mutex::new(Some(batches.into())),
                frames: Arc::new(Mutex::new(Vec::new())),
                finished: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl StreamingRecognizer for FakeRecognizer {
        async fn open(&self, _format: &AudioFormat) -> Result<StreamingSession, AnalyzeError> {
            Ok(StreamingSession {
                audio: Box::new(FakeAudioSink {
                    frames: self.frames.clone(),
                    finished: self.finished.clone(),
                }),
                results: Box::new(FakeBatchSource {
                    batches: self.batches.lock().unwrap().take().unwrap(),
                }),
            })
        }
    }

    fn batch(json: &str) -> ResultBatch {
        serde_json::from_str(json).unwrap()
    }

    fn write_wav(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("talk.wav");
        let mut writer = hound::WavWriter::create(
            &path,
            hound::WavSpec {
                channels: 1,
                sample_rate: 16000,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            },
        )
        .unwrap();
        for i in 0..1600i16 {
            writer.write_sample(i % 64).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn fragment_without_punctuation_spans_the_whole_word_window() {
        // Words timed [0.0-0.5] and [0.5-1.2], transcript "Hi there" with
        // no split point: exactly one cue spanning 0.0-1.2.
        let words = vec![
            TimedWord { start: 0.0, end: 0.5 },
            TimedWord { start: 0.5, end: 1.2 },
        ];
        let cues = cues_from_alternative("Hi there", &words);
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].start, Duration::ZERO);
        assert_eq!(cues[0].end, Duration::from_secs_f64(1.2));
        assert_eq!(cues[0].text, "Hi there");
    }

    #[test]
    fn word_cursor_advances_per_fragment() {
        let words = vec![
            TimedWord { start: 0.0, end: 0.3 },
            TimedWord { start: 0.3, end: 0.6 },
            TimedWord { start: 0.7, end: 1.0 },
            TimedWord { start: 1.0, end: 1.3 },
        ];
        let cues = cues_from_alternative("你好，再見", &words);
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].start, Duration::ZERO);
        assert_eq!(cues[0].end, Duration::from_secs_f64(0.6));
        assert_eq!(cues[1].start, Duration::from_secs_f64(0.7));
        assert_eq!(cues[1].end, Duration::from_secs_f64(1.3));
    }

    #[test]
    fn word_window_is_clamped_to_the_word_list() {
        let words = vec![TimedWord { start: 0.0, end: 0.4 }];
        let cues = cues_from_alternative("一二三四五", &words);
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].end, Duration::from_secs_f64(0.4));
    }

    #[tokio::test]
    async fn batches_emit_cues_in_arrival_order_and_audio_is_pumped() {
        let recognizer = Arc::new(FakeRecognizer::new(vec![
            batch(
                r#"{"results":[{"alternatives":[{"transcript":"你好",
                    "words":[{"startTime":0.0,"endTime":0.4},{"startTime":0.4,"endTime":0.8}]}]}]}"#,
            ),
            batch(
                r#"{"results":[{"alternatives":[{"transcript":"再見",
                    "words":[{"startTime":1.0,"endTime":1.4},{"startTime":1.4,"endTime":1.8}]}]}]}"#,
            ),
        ]));
        let frames = recognizer.frames.clone();
        let finished = recognizer.finished.clone();
        let backend = StreamingBackend::new(recognizer);

        let dir = tempfile::tempdir().unwrap();
        let file = write_wav(&dir);
        let blocks: Vec<String> = backend
            .analyze(&file, CancellationToken::new())
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].starts_with("1\n"));
        assert!(blocks[0].contains("你好"));
        assert!(blocks[1].starts_with("2\n"));
        assert!(blocks[1].contains("再見"));

        // Writer ran to completion: every byte pumped, then end-of-input.
        // (The pump task is detached; give it a beat to finish.)
        tokio::time::sleep(Duration::from_millis(50)).await;
        let total: usize = frames.lock().unwrap().iter().sum();
        assert_eq!(total, 44 + 1600 * 2); // header + samples
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn batches_without_words_are_skipped() {
        let recognizer = Arc::new(FakeRecognizer::new(vec![batch(
            r#"{"results":[{"alternatives":[{"transcript":"interim guess","words":[]}]}]}"#,
        )]));
        let backend = StreamingBackend::new(recognizer);

        let dir = tempfile::tempdir().unwrap();
        let file = write_wav(&dir);
        let blocks: Vec<_> = backend
            .analyze(&file, CancellationToken::new())
            .collect()
            .await;
        assert!(blocks.is_empty());
    }
}
