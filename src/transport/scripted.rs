//! A deterministic in-process transport.
//!
//! [`ScriptedTransport`] replays a fixed list of chunks for every request, optionally failing
//! before the stream opens or after a number of chunks.  For step-by-step control a test can
//! queue [`Gate`]s: each request consumes the oldest gate and its stream yields exactly what the
//! gate releases.  Every request is recorded.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use super::{ChunkStream, Transport};
use crate::error::{Error, Result};

/// A request received by a [`ScriptedTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedRequest {
    /// The preamble instructions.
    pub preamble: String,
    /// The scripted opening reply.
    pub opening_reply: String,
    /// The user's query.
    pub query: String,
}

enum GateSignal {
    Chunk(String),
    Fail(Error),
    Finish,
}

/// Releases the chunks of one gated stream.
///
/// Dropping the gate ends the stream like [`Gate::finish`].
#[derive(Debug)]
pub struct Gate {
    signals: mpsc::UnboundedSender<GateSignal>,
}

impl Gate {
    /// Releases one chunk.  Returns false if the stream has been dropped.
    pub fn send_chunk(&self, chunk: impl Into<String>) -> bool {
        self.signals.send(GateSignal::Chunk(chunk.into())).is_ok()
    }

    /// Ends the stream with `error`.  Returns false if the stream has been dropped.
    pub fn fail(&self, error: Error) -> bool {
        self.signals.send(GateSignal::Fail(error)).is_ok()
    }

    /// Ends the stream cleanly.  Returns false if the stream has been dropped.
    pub fn finish(&self) -> bool {
        self.signals.send(GateSignal::Finish).is_ok()
    }

    /// True once the consumer has dropped the stream, e.g. after a reset.
    pub fn is_closed(&self) -> bool {
        self.signals.is_closed()
    }
}

/// A transport that answers from a script.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    chunks: Vec<String>,
    open_error: Option<Error>,
    fail_after: Option<(usize, Error)>,
    chunk_delay: Option<Duration>,
    open_delay: Option<Duration>,
    gates: Mutex<VecDeque<mpsc::UnboundedReceiver<GateSignal>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl std::fmt::Debug for GateSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateSignal::Chunk(chunk) => write!(f, "Chunk({} bytes)", chunk.len()),
            GateSignal::Fail(err) => write!(f, "Fail({err})"),
            GateSignal::Finish => f.write_str("Finish"),
        }
    }
}

impl ScriptedTransport {
    /// Replays `chunks` for every ungated request.
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// A canned reply for running without network access.
    pub fn offline_demo() -> Self {
        let reply = "**Offline mode.** I can't reach the assistant service right now, so I can \
                     only give you this canned reply.\n\n- Run without `--offline` and set \
                     `GEMINI_API_KEY` to talk to the live service.\n\nFor more information, feel \
                     free to contact us at [contact@vcnr.com](mailto:contact@vcnr.com).";
        Self::new(reply.split_inclusive(' ')).with_delay(Duration::from_millis(25))
    }

    /// Refuses every request with `error` instead of opening a stream.
    pub fn fail_open(mut self, error: Error) -> Self {
        self.open_error = Some(error);
        self
    }

    /// Ends every ungated stream with `error` after `chunks` chunks.
    pub fn fail_after(mut self, chunks: usize, error: Error) -> Self {
        self.fail_after = Some((chunks, error));
        self
    }

    /// Waits `delay` before each scripted chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Waits `delay` before opening each stream.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Queues a gate for the next request that does not already have one.
    pub fn push_gate(&self) -> Gate {
        let (signals, rx) = mpsc::unbounded_channel();
        lock(&self.gates).push_back(rx);
        Gate { signals }
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    fn scripted_stream(&self) -> ChunkStream {
        let mut items: Vec<Result<String>> = self.chunks.iter().cloned().map(Ok).collect();
        if let Some((after, err)) = &self.fail_after {
            items.truncate(*after);
            items.push(Err(err.clone()));
        }
        let delay = self.chunk_delay;
        Box::pin(stream::iter(items).then(move |item| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            item
        }))
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn stream_completion(
        &self,
        preamble: &str,
        opening_reply: &str,
        query: &str,
    ) -> Result<ChunkStream> {
        lock(&self.requests).push(RecordedRequest {
            preamble: preamble.to_string(),
            opening_reply: opening_reply.to_string(),
            query: query.to_string(),
        });
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.open_error {
            return Err(err.clone());
        }
        let gate = lock(&self.gates).pop_front();
        match gate {
            Some(rx) => Ok(gated_stream(rx)),
            None => Ok(self.scripted_stream()),
        }
    }
}

fn gated_stream(rx: mpsc::UnboundedReceiver<GateSignal>) -> ChunkStream {
    Box::pin(stream::unfold(Some(rx), |rx| async move {
        let mut rx = rx?;
        match rx.recv().await? {
            GateSignal::Chunk(chunk) => Some((Ok(chunk), Some(rx))),
            GateSignal::Fail(err) => Some((Err(err), None)),
            GateSignal::Finish => None,
        }
    }))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
