//! Server-Sent Events (SSE) framing for streaming responses.
//!
//! This module turns the raw byte stream of an HTTP response into a stream of [`SseEvent`]s.
//! It knows nothing about the payload; interpreting `data` is left to the transport.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::error::{Error, Result};

/// One dispatched server-sent event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if the server sent one.
    pub event: Option<String>,
    /// All `data:` lines of the event joined with `\n`.
    pub data: String,
}

/// Process a stream of bytes into a stream of server-sent events.
///
/// Bytes are buffered until a blank line terminates an event, so multi-byte characters and
/// events split across network reads are reassembled before decoding.  Events without any
/// `data:` line (keep-alive comments) are skipped.
pub fn process_sse<S>(byte_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    // Convert reqwest errors to our error type
    let stream = byte_stream.map(|result| {
        result.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(format!("Response stream timed out: {e}"), None)
            } else {
                Error::streaming(format!("Error in HTTP stream: {e}"), Some(Box::new(e)))
            }
        })
    });

    stream::unfold(
        (stream, Vec::<u8>::new(), false),
        move |(mut stream, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                // First check if we have a complete event in the buffer
                while let Some((raw, remaining)) = split_event(&buffer) {
                    buffer = remaining;
                    match parse_event(&raw) {
                        Ok(Some(event)) => return Some((Ok(event), (stream, buffer, false))),
                        Ok(None) => continue,
                        Err(e) => return Some((Err(e), (stream, buffer, false))),
                    }
                }

                // Read more data
                match stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => return Some((Err(e), (stream, buffer, true))),
                    None => {
                        // End of stream: a final event may lack its trailing blank line
                        let raw = std::mem::take(&mut buffer);
                        return match parse_event(&raw) {
                            Ok(Some(event)) => Some((Ok(event), (stream, buffer, true))),
                            Ok(None) => None,
                            Err(e) => Some((Err(e), (stream, buffer, true))),
                        };
                    }
                }
            }
        },
    )
}

/// Split the first complete event off the front of `buffer`.
///
/// Accepts `\n\n`, `\r\n\r\n` and `\r\r` as event terminators.
fn split_event(buffer: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    const TERMINATORS: [&[u8]; 3] = [b"\r\n\r\n", b"\n\n", b"\r\r"];
    let (at, len) = TERMINATORS
        .iter()
        .filter_map(|t| find(buffer, t).map(|at| (at, t.len())))
        .min_by_key(|(at, _)| *at)?;
    Some((buffer[..at].to_vec(), buffer[at + len..].to_vec()))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parse one raw event block; `Ok(None)` means the block carried no data.
fn parse_event(raw: &[u8]) -> Result<Option<SseEvent>> {
    let text = std::str::from_utf8(raw)?;
    let mut event = None;
    let mut data: Option<String> = None;
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => match data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            // id and retry are irrelevant to a single-shot response
            _ => {}
        }
    }
    Ok(data.map(|data| SseEvent { event, data }))
}
