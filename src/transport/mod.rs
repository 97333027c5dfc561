//! The transport seam between the session and the generative-language service.
//!
//! A [`Transport`] opens one streaming completion per turn and hands back a [`ChunkStream`]:
//! a lazy, finite, non-restartable sequence of text deltas.  Dropping the stream aborts the
//! call and releases whatever network resources back it.  A failure is reported as a terminal
//! `Err` item on the stream, never as a partial chunk.

use std::pin::Pin;

use futures::Stream;

use crate::error::Result;

mod gemini;
mod scripted;

pub use gemini::{API_KEY_ENV, DEFAULT_API_URL, DEFAULT_MODEL, GeminiTransport};
pub use scripted::{Gate, RecordedRequest, ScriptedTransport};

/// A stream of response text deltas.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens streaming completions against a generative-language service.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Starts a completion for `query`.
    ///
    /// `preamble` is sent as the leading instruction and `opening_reply` as the assistant's
    /// scripted first utterance, so the service sees a two-message history followed by the
    /// query.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be opened at all; failures after the stream is
    /// returned arrive as items on the stream.
    async fn stream_completion(
        &self,
        preamble: &str,
        opening_reply: &str,
        query: &str,
    ) -> Result<ChunkStream>;
}
