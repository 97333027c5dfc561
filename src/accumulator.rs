//! Folds a streamed response into the transcript, chunk by chunk.
//!
//! The accumulator is the only place that drives a [`ChunkStream`](crate::transport::ChunkStream).
//! Every chunk is handed to a [`DeltaSink`] the moment it arrives; nothing is buffered or
//! batched, so observers see the response grow in arrival order.  A stream that ends cleanly
//! is completed exactly once.  A stream that fails is *not* finalized here: the partial text
//! stays committed and the caller decides what the user sees.

use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::observability::{
    STREAM_BYTES, STREAM_CHUNKS, STREAM_DURATION, STREAM_ERRORS, STREAM_TTFB,
};
use crate::transcript::{MessageStatus, Transcript};

/// Receives the mutations produced while consuming a response.
pub trait DeltaSink {
    /// Applies one chunk of response text.
    fn apply_delta(&mut self, delta: &str) -> Result<()>;

    /// Marks the response complete.  Called at most once, after the last delta.
    fn complete(&mut self) -> Result<()>;
}

impl DeltaSink for Transcript {
    fn apply_delta(&mut self, delta: &str) -> Result<()> {
        self.update_last_content(delta)
    }

    fn complete(&mut self) -> Result<()> {
        self.finalize(MessageStatus::Complete, None).map(|_| ())
    }
}

/// Consumes one response stream.
#[derive(Debug)]
pub struct ResponseAccumulator {
    text: String,
    chunks: u64,
    started: Instant,
    duration: Option<Duration>,
}

impl ResponseAccumulator {
    /// Creates an accumulator; timing starts now.
    pub fn new() -> Self {
        Self {
            text: String::new(),
            chunks: 0,
            started: Instant::now(),
            duration: None,
        }
    }

    /// Drives `stream` to completion, applying each chunk to `sink`.
    ///
    /// Returns the full response text after calling [`DeltaSink::complete`].  The stream is
    /// timed however it ends; see [`ResponseAccumulator::duration`].
    ///
    /// # Errors
    ///
    /// - [`Error::StreamInterrupted`] if the stream yields an error.  Chunks already applied stay
    ///   applied and `complete` is not called.
    /// - [`Error::Aborted`] if `cancel` fires.  No chunk is applied after cancellation is
    ///   observed, even one that was already buffered in the stream.
    /// - Whatever the sink returns if it rejects a mutation.
    pub async fn consume<S, K>(
        &mut self,
        stream: S,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> Result<String>
    where
        S: Stream<Item = Result<String>>,
        K: DeltaSink + ?Sized,
    {
        let outcome = self.drive(stream, sink, cancel).await;
        let elapsed = self.started.elapsed();
        STREAM_DURATION.add(elapsed.as_secs_f64());
        self.duration = Some(elapsed);
        outcome
    }

    async fn drive<S, K>(
        &mut self,
        stream: S,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> Result<String>
    where
        S: Stream<Item = Result<String>>,
        K: DeltaSink + ?Sized,
    {
        futures::pin_mut!(stream);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::aborted("response stream cancelled"));
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => self.apply(&chunk, sink)?,
                Some(Err(err)) => {
                    STREAM_ERRORS.click();
                    return Err(Error::stream_interrupted(
                        format!("response stream failed after {} chunks", self.chunks),
                        Some(err),
                    ));
                }
                None => break,
            }
        }
        sink.complete()?;
        Ok(self.text.clone())
    }

    /// How long the consumed stream ran, from creation to its last item, cancellation, or
    /// failure.  `None` until [`ResponseAccumulator::consume`] returns.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Number of chunks applied so far.
    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    fn apply<K: DeltaSink + ?Sized>(&mut self, chunk: &str, sink: &mut K) -> Result<()> {
        if self.chunks == 0 {
            STREAM_TTFB.add(self.started.elapsed().as_secs_f64());
        }
        sink.apply_delta(chunk)?;
        self.text.push_str(chunk);
        self.chunks += 1;
        STREAM_CHUNKS.click();
        STREAM_BYTES.count(chunk.len() as u64);
        Ok(())
    }
}

impl Default for ResponseAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::MessageDraft;
    use futures::stream;
    use tokio::sync::mpsc;

    fn streaming_transcript() -> Transcript {
        let mut transcript = Transcript::new();
        transcript.append(MessageDraft::user("q")).unwrap();
        transcript
            .append(MessageDraft::assistant_placeholder())
            .unwrap();
        transcript
    }

    fn chunks(items: Vec<Result<String>>) -> impl Stream<Item = Result<String>> {
        stream::iter(items)
    }

    /// Forwards every mutation to a channel so tests can watch them happen.
    struct ChannelSink(mpsc::UnboundedSender<String>);

    impl DeltaSink for ChannelSink {
        fn apply_delta(&mut self, delta: &str) -> Result<()> {
            self.0.send(delta.to_string()).map_err(|_| Error::SessionClosed)
        }

        fn complete(&mut self) -> Result<()> {
            self.0.send("<complete>".to_string()).map_err(|_| Error::SessionClosed)
        }
    }

    #[tokio::test]
    async fn chunks_fold_into_last_message() {
        let mut transcript = streaming_transcript();
        let text = ResponseAccumulator::new()
            .consume(
                chunks(vec![Ok("Hel".to_string()), Ok("lo".to_string())]),
                &mut transcript,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(text, "Hello");
        let last = transcript.last().unwrap();
        assert_eq!(last.content, "Hello");
        assert_eq!(last.status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn empty_stream_completes_with_empty_text() {
        let mut transcript = streaming_transcript();
        let text = ResponseAccumulator::new()
            .consume(chunks(vec![]), &mut transcript, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "");
        assert_eq!(transcript.last().unwrap().status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn failure_keeps_partial_text_and_skips_finalize() {
        let mut transcript = streaming_transcript();
        let err = ResponseAccumulator::new()
            .consume(
                chunks(vec![
                    Ok("Par".to_string()),
                    Err(Error::streaming("connection reset", None)),
                    Ok("never".to_string()),
                ]),
                &mut transcript,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_stream_interrupted());
        let last = transcript.last().unwrap();
        assert_eq!(last.content, "Par");
        assert_eq!(last.status, MessageStatus::Streaming);
    }

    #[tokio::test]
    async fn each_chunk_is_applied_before_the_next_arrives() {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<Result<String>>();
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let stream = stream::unfold(chunk_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let consumer = tokio::spawn(async move {
            let mut sink = ChannelSink(sink_tx);
            ResponseAccumulator::new()
                .consume(stream, &mut sink, &CancellationToken::new())
                .await
        });

        chunk_tx.send(Ok("first".to_string())).unwrap();
        assert_eq!(sink_rx.recv().await.unwrap(), "first");
        chunk_tx.send(Ok("second".to_string())).unwrap();
        assert_eq!(sink_rx.recv().await.unwrap(), "second");
        drop(chunk_tx);
        assert_eq!(sink_rx.recv().await.unwrap(), "<complete>");
        assert_eq!(consumer.await.unwrap().unwrap(), "firstsecond");
    }

    #[tokio::test]
    async fn cancellation_stops_delivery() {
        let mut transcript = streaming_transcript();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ResponseAccumulator::new()
            .consume(
                chunks(vec![Ok("late".to_string())]),
                &mut transcript,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_aborted());
        let last = transcript.last().unwrap();
        assert_eq!(last.content, "");
        assert_eq!(last.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn failed_and_cancelled_streams_are_timed() {
        let mut transcript = streaming_transcript();
        let mut failed = ResponseAccumulator::new();
        assert!(failed.duration().is_none());
        failed
            .consume(
                chunks(vec![Err(Error::streaming("connection reset", None))]),
                &mut transcript,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(failed.duration().is_some());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut cancelled = ResponseAccumulator::new();
        cancelled
            .consume(chunks(vec![Ok("late".to_string())]), &mut transcript, &cancel)
            .await
            .unwrap_err();
        assert!(cancelled.duration().is_some());
    }

    #[tokio::test]
    async fn sink_rejection_propagates() {
        let mut transcript = Transcript::new();
        let err = ResponseAccumulator::new()
            .consume(
                chunks(vec![Ok("orphan".to_string())]),
                &mut transcript,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
