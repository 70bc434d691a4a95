//! Transcription backend trait and shared types.

use std::future::Future;
use std::path::Path;

use futures_util::stream::{self, BoxStream, StreamExt};
use log::debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioError;
use crate::segment::CueSpan;
use crate::srt::{format_cue, Cue};

/// Lazy sequence of formatted SRT cue blocks. A fatal condition ends the
/// stream with its final `Err` item; cancellation surfaces through
/// [`crate::cancel::with_enforced_cancellation`] instead.
pub type CueStream = BoxStream<'static, Result<String, AnalyzeError>>;

/// Errors produced while analyzing one file.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzeError {
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error("cannot reach remote service: {0}")]
    Connect(String),
    #[error("remote service request failed: {0}")]
    Remote(String),
    #[error("transcription job failed: {0}")]
    JobFailed(String),
    #[error("malformed recognition result: {0}")]
    Parse(String),
    #[error("analysis canceled")]
    Canceled,
}

/// Trait for transcription backends.
///
/// Each `analyze` call is an independent run: it opens its own audio source
/// and remote session, and may be invoked again after a prior run completed
/// or was canceled. The returned stream does nothing until polled.
pub trait TranscriptionBackend: Send + Sync {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn analyze(&self, file: &Path, cancel: CancellationToken) -> CueStream;
}

/// Emission side of one run: assigns cue indices and hands formatted
/// blocks to the consumer.
pub(crate) struct CueSink {
    tx: mpsc::UnboundedSender<Result<String, AnalyzeError>>,
    index: u32,
}

impl CueSink {
    /// Number the span with the run's next index, format it and send it.
    /// Returns `false` once the consumer is gone.
    pub fn emit(&mut self, span: CueSpan) -> bool {
        self.index += 1;
        let block = format_cue(&Cue {
            index: self.index,
            start: span.start,
            end: span.end,
            text: span.text,
        });
        debug!("[cues]\n{}", block.trim_end());
        self.tx.send(Ok(block)).is_ok()
    }
}

/// Turn a provider's driver future into a lazy [`CueStream`].
///
/// The driver is spawned on first poll of the stream; cues flow through an
/// unbounded channel, and a fatal driver error becomes the stream's last
/// item. Dropping the stream closes the channel, which the driver observes
/// as a failed `emit`.
pub(crate) fn drive<F, Fut>(run: F) -> CueStream
where
    F: FnOnce(CueSink) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), AnalyzeError>> + Send + 'static,
{
    Box::pin(
        stream::once(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let sink = CueSink {
                tx: tx.clone(),
                index: 0,
            };
            tokio::spawn(async move {
                if let Err(e) = run(sink).await {
                    let _ = tx.send(Err(e));
                }
            });
            stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
        })
        .flatten(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn drive_runs_lazily_and_forwards_cues_then_errors() {
        let stream = drive(|mut sink| async move {
            sink.emit(CueSpan {
                start: Duration::ZERO,
                end: Duration::from_secs(1),
                text: "first".into(),
            });
            Err(AnalyzeError::Remote("after one cue".into()))
        });
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].as_ref().unwrap().starts_with("1\n"));
        assert!(matches!(items[1], Err(AnalyzeError::Remote(_))));
    }

    #[tokio::test]
    async fn sink_indices_count_up_from_one() {
        let stream = drive(|mut sink| async move {
            for text in ["a", "b", "c"] {
                sink.emit(CueSpan {
                    start: Duration::ZERO,
                    end: Duration::ZERO,
                    text: text.into(),
                });
            }
            Ok(())
        });
        let blocks: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        let indices: Vec<&str> = blocks.iter().map(|b| b.lines().next().unwrap()).collect();
        assert_eq!(indices, ["1", "2", "3"]);
    }
}
