//! Synchronous recognition-loop backend.
//!
//! A producer task fills a bounded push buffer with audio chunks while the
//! main loop repeatedly asks the recognizer for the next utterance, until
//! the buffer runs dry or the run is canceled. Utterances come back with an
//! offset and duration but no word timing, so cue times are either the whole
//! utterance or a proportional split across its sentences.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::debug;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
};
use tokio_util::sync::CancellationToken;

use super::backend::{drive, AnalyzeError, CueSink, CueStream, TranscriptionBackend};
use crate::audio::{AudioFormat, AudioSource};
use crate::config::RecognizeOptions;
use crate::segment::{segment_proportional, segment_whole_utterance};

/// Chunks the push buffer holds before the producer blocks.
const PUSH_BUFFER_CHUNKS: usize = 8;

/// One recognized utterance: full text plus its position in the audio.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub offset: Duration,
    pub duration: Duration,
}

/// Outcome of one blocking recognition call. A transport or service error
/// is returned as `Err` instead and is fatal for the run.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognized {
    Utterance(Utterance),
    /// The recognizer stopped cleanly (end of audio, clean remote close).
    Ended,
}

#[async_trait]
pub trait UtteranceRecognizer: Send {
    async fn recognize_next(&mut self) -> Result<Recognized, AnalyzeError>;
}

/// Builds a recognizer around the run's push buffer.
#[async_trait]
pub trait RecognizerFactory: Send + Sync {
    async fn create(
        &self,
        format: &AudioFormat,
        audio: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Box<dyn UtteranceRecognizer>, AnalyzeError>;
}

pub struct RecognizeLoopBackend {
    factory: Arc<dyn RecognizerFactory>,
    split: bool,
}

impl RecognizeLoopBackend {
    pub fn new(factory: Arc<dyn RecognizerFactory>, split: bool) -> Self {
        Self { factory, split }
    }

    pub fn from_options(options: &RecognizeOptions, language: &str) -> Self {
        Self::new(
            Arc::new(WsRecognizerFactory {
                url: options.url.clone(),
                api_key: options.api_key.clone(),
                language: language.to_string(),
            }),
            options.split,
        )
    }
}

impl TranscriptionBackend for RecognizeLoopBackend {
    fn id(&self) -> &'static str {
        "recognize"
    }

    fn name(&self) -> &'static str {
        "Utterance Recognition"
    }

    fn analyze(&self, file: &Path, cancel: CancellationToken) -> CueStream {
        let factory = self.factory.clone();
        let split = self.split;
        let file = file.to_path_buf();
        drive(move |sink| run(factory, split, file, cancel, sink))
    }
}

async fn run(
    factory: Arc<dyn RecognizerFactory>,
    split: bool,
    file: std::path::PathBuf,
    cancel: CancellationToken,
    mut sink: CueSink,
) -> Result<(), AnalyzeError> {
    debug!("[recognize] analyze begin");
    let source = AudioSource::open(&file)?;
    let (tx, rx) = mpsc::channel::<Vec<u8>>(PUSH_BUFFER_CHUNKS);
    let mut recognizer = factory.create(source.format(), rx).await?;

    let bytes = source.bytes();
    let chunk = source.chunk_size();
    let producer_cancel = cancel.clone();
    tokio::spawn(async move {
        for frame in bytes.chunks(chunk) {
            tokio::select! {
                biased;
                _ = producer_cancel.cancelled() => return,
                sent = tx.send(frame.to_vec()) => {
                    if sent.is_err() {
                        return; // recognizer went away
                    }
                }
            }
        }
        debug!("[recognize] audio loaded, recognizing ...");
        // Dropping the sender closes the push buffer, which is the
        // recognizer's end-of-input signal.
    });

    while !cancel.is_cancelled() {
        let utterance = match recognizer.recognize_next().await? {
            Recognized::Ended => {
                debug!("[recognize] recognizer ended");
                break;
            }
            Recognized::Utterance(utterance) => utterance,
        };
        if utterance.text.trim().is_empty() {
            debug!("[recognize] continue with result empty");
            continue;
        }

        let spans = if split {
            segment_proportional(&utterance.text, utterance.offset, utterance.duration)
        } else {
            segment_whole_utterance(&utterance.text, utterance.offset, utterance.duration)
                .into_iter()
                .collect()
        };
        for span in spans {
            if !sink.emit(span) {
                return Ok(());
            }
        }
    }
    debug!("[recognize] analyze end");
    Ok(())
}

/// Utterance frame on the wire.
#[derive(Debug, Deserialize)]
struct UtteranceFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(rename = "offsetMs", default)]
    offset_ms: u64,
    #[serde(rename = "durationMs", default)]
    duration_ms: u64,
}

/// WebSocket transport: forwards push-buffer chunks as binary frames while
/// utterance results come back as JSON text frames.
pub struct WsRecognizerFactory {
    pub url: String,
    pub api_key: Option<String>,
    pub language: String,
}

#[async_trait]
impl RecognizerFactory for WsRecognizerFactory {
    async fn create(
        &self,
        format: &AudioFormat,
        mut audio: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Box<dyn UtteranceRecognizer>, AnalyzeError> {
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
                "bitsPerSample": format.bits_per_sample,
                "audioChannelCount": format.channels,
                "languageCode": self.language,
            }
        });
        write
            .send(Message::Text(config.to_string()))
            .await
            .map_err(|e| AnalyzeError::Connect(e.to_string()))?;

        tokio::spawn(async move {
            while let Some(frame) = audio.recv().await {
                if write.send(Message::Binary(frame)).await.is_err() {
                    return;
                }
            }
            let _ = write.send(Message::Text(r#"{"event":"end"}"#.into())).await;
        });

        Ok(Box::new(WsUtteranceRecognizer { read }))
    }
}

struct WsUtteranceRecognizer {
    read: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

#[async_trait]
impl UtteranceRecognizer for WsUtteranceRecognizer {
    async fn recognize_next(&mut self) -> Result<Recognized, AnalyzeError> {
        while let Some(message) = self.read.next().await {
            match message.map_err(|e| AnalyzeError::Remote(e.to_string()))? {
                Message::Text(text) => {
                    let frame: UtteranceFrame = serde_json::from_str(&text)
                        .map_err(|e| AnalyzeError::Parse(e.to_string()))?;
                    return match frame.kind.as_str() {
                        "utterance" => Ok(Recognized::Utterance(Utterance {
                            text: frame.text,
                            offset: Duration::from_millis(frame.offset_ms),
                            duration: Duration::from_millis(frame.duration_ms),
                        })),
                        "end" => Ok(Recognized::Ended),
                        other => Err(AnalyzeError::Parse(format!(
                            "unknown frame type '{}'",
                            other
                        ))),
                    };
                }
                Message::Close(_) => return Ok(Recognized::Ended),
                _ => continue,
            }
        }
        Ok(Recognized::Ended)
    }
}
