//! Cancellation enforcement for cue streams.
//!
//! Backends can sit inside a produce-next step that cannot itself be
//! interrupted (a blocking recognition call, a poll delay on the remote
//! side). This wrapper races every step against the run's cancellation
//! token so the consumer stops promptly either way, while the abandoned
//! producer is still released once its in-flight step settles.

use futures_util::stream::{self, BoxStream, StreamExt, StreamFuture};
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::transcription::AnalyzeError;

type Source<T> = BoxStream<'static, Result<T, AnalyzeError>>;

enum State<T> {
    Racing(StreamFuture<Source<T>>, CancellationToken),
    Done,
}

/// Wrap `source` so that it stops as soon as `cancel` fires.
///
/// Elements and errors of the underlying stream pass through unchanged.
/// When the token fires, the wrapper yields a single
/// [`AnalyzeError::Canceled`] and ends; no element requested after the
/// signal is ever observed by the caller. The producer is released exactly
/// once on every exit path — if a step is still in flight at cancellation,
/// its release is detached onto the runtime rather than awaited here.
pub fn with_enforced_cancellation<T: Send + 'static>(
    source: Source<T>,
    cancel: CancellationToken,
) -> Source<T> {
    let state = State::Racing(source.into_future(), cancel);
    Box::pin(stream::unfold(state, |state| async move {
        match state {
            State::Done => None,
            State::Racing(mut pending, cancel) => {
                if cancel.is_cancelled() {
                    // No step has been requested from this future yet, so
                    // the producer can be released on the spot.
                    drop(pending.into_inner());
                    return Some((Err(AnalyzeError::Canceled), State::Done));
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        release_after_settle(pending);
                        Some((Err(AnalyzeError::Canceled), State::Done))
                    }
                    (item, rest) = &mut pending => match item {
                        Some(item) => Some((item, State::Racing(rest.into_future(), cancel))),
                        None => None,
                    },
                }
            }
        }
    }))
}

/// Let an in-flight step run to its natural end off the caller's path,
/// dropping the producer only once it settles.
fn release_after_settle<T: Send + 'static>(pending: StreamFuture<Source<T>>) {
    tokio::spawn(async move {
        let _ = pending.await;
        debug!("[cancel] abandoned producer settled and released");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn channel_source<T: Send + 'static>() -> (
        mpsc::UnboundedSender<Result<T, AnalyzeError>>,
        Source<T>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (tx, Box::pin(stream))
    }

    #[tokio::test]
    async fn passes_elements_through_until_exhaustion() {
        let source: Source<u32> = Box::pin(stream::iter(vec![Ok(1), Ok(2), Ok(3)]));
        let cancel = CancellationToken::new();
        let items: Vec<_> = with_enforced_cancellation(source, cancel).collect().await;
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.is_ok()));
    }

    #[tokio::test]
    async fn propagates_producer_errors() {
        let source: Source<u32> = Box::pin(stream::iter(vec![
            Ok(1),
            Err(AnalyzeError::Remote("boom".into())),
        ]));
        let cancel = CancellationToken::new();
        let items: Vec<_> = with_enforced_cancellation(source, cancel).collect().await;
        assert!(matches!(items[0], Ok(1)));
        assert!(matches!(items[1], Err(AnalyzeError::Remote(_))));
    }

    #[tokio::test]
    async fn cancel_before_first_element_yields_only_canceled() {
        let (tx, source) = channel_source::<u32>();
        tx.send(Ok(1)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let items: Vec<_> = with_enforced_cancellation(source, cancel).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(AnalyzeError::Canceled)));
    }

    #[tokio::test]
    async fn cancel_after_elements_stops_without_yielding_more() {
        let (tx, source) = channel_source::<u32>();
        let cancel = CancellationToken::new();
        let mut wrapped = with_enforced_cancellation(source, cancel.clone());

        tx.send(Ok(1)).unwrap();
        tx.send(Ok(2)).unwrap();
        assert!(matches!(wrapped.next().await, Some(Ok(1))));
        assert!(matches!(wrapped.next().await, Some(Ok(2))));

        cancel.cancel();
        tx.send(Ok(3)).unwrap();
        assert!(matches!(wrapped.next().await, Some(Err(AnalyzeError::Canceled))));
        assert!(wrapped.next().await.is_none());
    }

    #[tokio::test]
    async fn abandoned_producer_is_released_after_its_step_settles() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(flag.clone());
        let source: Source<u32> = Box::pin(stream::unfold(guard, |guard| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Some((Ok(1), guard))
        }));

        let cancel = CancellationToken::new();
        let mut wrapped = with_enforced_cancellation(source, cancel.clone());
        let consumer = tokio::spawn(async move { wrapped.next().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        // The caller gets the canceled outcome promptly, while the
        // producer's step is still pending.
        let item = consumer.await.unwrap();
        assert!(matches!(item, Some(Err(AnalyzeError::Canceled))));
        assert!(!flag.load(Ordering::SeqCst));

        // Once the step settles, the detached release drops the producer.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_before_first_poll_releases_producer_immediately() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(flag.clone());
        let source: Source<u32> = Box::pin(stream::unfold(guard, |guard| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Some((Ok(1), guard))
        }));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut wrapped = with_enforced_cancellation(source, cancel);
        assert!(matches!(wrapped.next().await, Some(Err(AnalyzeError::Canceled))));
        assert!(wrapped.next().await.is_none());
        assert!(flag.load(Ordering::SeqCst));
    }
}
