//! The transcript store.
//!
//! A [`Transcript`] is the ordered, append-only log of messages exchanged in one session.
//! Insertion order is display order is conversation order.  The store enforces the
//! single-in-flight invariant: at most one message may be `Pending` or `Streaming` at any
//! time, and only the most recent message may be mutated.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Ordinal identifier of a message within a session.
///
/// Identifiers keep increasing across [`Transcript::reset`], so an identifier never refers to
/// two different messages over the lifetime of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    /// Returns the ordinal value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    /// The person using the widget.
    User,
    /// The generative-language service.
    Assistant,
}

/// Lifecycle status of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Placeholder appended before the first chunk arrives.
    Pending,
    /// At least one chunk has been applied.
    Streaming,
    /// The response finished successfully.
    Complete,
    /// The response failed; content holds the apology text.
    Failed,
}

impl MessageStatus {
    /// Returns true for `Complete` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Complete | MessageStatus::Failed)
    }
}

/// A single entry in the transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Ordinal identifier assigned on append.
    pub id: MessageId,
    /// Author of the message.
    pub sender: Sender,
    /// Text content, markdown for assistant replies.
    pub content: String,
    /// Lifecycle status.
    pub status: MessageStatus,
}

impl Message {
    /// Returns true if the message is still receiving content.
    pub fn is_in_flight(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// A message that has not been appended yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageDraft {
    sender: Sender,
    content: String,
    status: MessageStatus,
}

impl MessageDraft {
    /// A user message; user messages are complete the moment they are appended.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            content: content.into(),
            status: MessageStatus::Complete,
        }
    }

    /// An empty assistant message awaiting its first chunk.
    pub fn assistant_placeholder() -> Self {
        Self {
            sender: Sender::Assistant,
            content: String::new(),
            status: MessageStatus::Pending,
        }
    }

    /// A fully-formed draft.
    pub fn new(sender: Sender, content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            sender,
            content: content.into(),
            status,
        }
    }
}

/// The ordered message log of a session.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    next_id: u64,
}

impl Transcript {
    /// Creates an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message and returns its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the draft is non-terminal while another message is
    /// still in flight.
    pub fn append(&mut self, draft: MessageDraft) -> Result<MessageId> {
        if !draft.status.is_terminal()
            && let Some(in_flight) = self.in_flight_message()
        {
            return Err(Error::invalid_state(format!(
                "cannot append a second in-flight message while {} is {:?}",
                in_flight.id, in_flight.status
            )));
        }
        let id = MessageId(self.next_id);
        self.next_id += 1;
        self.messages.push(Message {
            id,
            sender: draft.sender,
            content: draft.content,
            status: draft.status,
        });
        Ok(id)
    }

    /// Concatenates `delta` onto the most recent message.
    ///
    /// A `Pending` message becomes `Streaming` on its first delta.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the transcript is empty or the last message is terminal.
    pub fn update_last_content(&mut self, delta: &str) -> Result<()> {
        let last = self.last_in_flight_mut()?;
        last.content.push_str(delta);
        last.status = MessageStatus::Streaming;
        Ok(())
    }

    /// Moves the most recent message to a terminal status, optionally replacing its content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if `status` is not terminal and [`Error::NotFound`] if
    /// there is no in-flight message to finalize.
    pub fn finalize(&mut self, status: MessageStatus, content: Option<String>) -> Result<MessageId> {
        if !status.is_terminal() {
            return Err(Error::invalid_state(format!(
                "finalize requires a terminal status, got {status:?}"
            )));
        }
        let last = self.last_in_flight_mut()?;
        last.status = status;
        if let Some(content) = content {
            last.content = content;
        }
        Ok(last.id)
    }

    /// Removes every message.
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    /// The messages in conversation order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The most recent message, if any.
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Looks up a message by identifier.
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// The message that is still `Pending` or `Streaming`, if any.
    pub fn in_flight_message(&self) -> Option<&Message> {
        self.messages.iter().find(|message| message.is_in_flight())
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when there are no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn last_in_flight_mut(&mut self) -> Result<&mut Message> {
        match self.messages.last_mut() {
            Some(last) if last.is_in_flight() => Ok(last),
            Some(last) => Err(Error::not_found(format!(
                "last message {} is already {:?}",
                last.id, last.status
            ))),
            None => Err(Error::not_found("transcript is empty")),
        }
    }
}
