//! The session state machine.
//!
//! [`Coordinator`] owns the transcript and is its only writer.  It is deliberately
//! synchronous: the async driver in [`crate::session`] feeds it commands and stream events
//! and publishes a [`SessionSnapshot`] after every mutation.
//!
//! ```text
//! Idle --admit--> Admitting --stream_opened--> Streaming --complete--> Idle
//!                     |                            |
//!                     +-----------fail-------------+--> Error --recover--> Idle
//! ```
//!
//! `reset` is accepted in every phase and always lands in `Idle` with an empty transcript.
//! Turn-scoped methods take the [`TurnId`] they belong to and ignore events for a turn that
//! is no longer active, so a cancelled stream can never touch the transcript.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::observability::{
    SESSION_BUSY_REJECTIONS, SESSION_EMPTY_REJECTIONS, SESSION_RESETS, SESSION_SUBMITS,
    SESSION_TURNS_CANCELLED, SESSION_TURNS_COMPLETED, SESSION_TURNS_FAILED,
};
use crate::transcript::{Message, MessageDraft, MessageId, MessageStatus, Transcript};

/// Content written over a failed response.
pub const APOLOGY: &str = "Sorry, I ran into an issue. Please try again.";

/// Text of the transient notification raised for a failed turn.
pub const NOTIFICATION_TEXT: &str = "An error occurred. Please try again.";

/// Lifecycle phase of the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Ready to accept a query.
    #[default]
    Idle,
    /// A query was accepted and the response stream is being opened.
    Admitting,
    /// Response chunks are arriving.
    Streaming,
    /// The last turn failed; the session returns to `Idle` once the failure is reported.
    Error,
}

impl Phase {
    /// Returns true while a turn is between admission and completion or failure.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Phase::Admitting | Phase::Streaming)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Admitting => "admitting",
            Phase::Streaming => "streaming",
            Phase::Error => "error",
        };
        f.write_str(s)
    }
}

/// Identifies one turn for the lifetime of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(u64);

impl TurnId {
    /// Returns the ordinal value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A turn admitted by [`Coordinator::admit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Turn {
    /// The turn's identifier.
    pub id: TurnId,
    /// The query exactly as submitted.
    pub query: String,
    /// The assistant placeholder that this turn's response streams into.
    pub assistant: MessageId,
}

/// Presentation flags of the widget.  Never consulted by the state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Presentation {
    /// The widget is expanded from its launcher.
    pub open: bool,
    /// The widget is shown at the larger size.
    pub enlarged: bool,
}

/// Read-only projection of the session, published after every mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Current phase.
    pub phase: Phase,
    /// Copy of the transcript.
    pub transcript: Vec<Message>,
    /// True between admission and the end of the turn.
    pub in_flight: bool,
    /// Kind of the most recent failure, cleared by reset and by the next admitted turn.
    pub last_error: Option<ErrorKind>,
    /// Presentation flags.
    pub presentation: Presentation,
    /// Increases by one with every published mutation.
    pub revision: u64,
}

impl SessionSnapshot {
    /// The most recent message, if any.
    pub fn last_message(&self) -> Option<&Message> {
        self.transcript.last()
    }

    /// The message still receiving content, if any.
    pub fn in_flight_message(&self) -> Option<&Message> {
        self.transcript.iter().find(|m| m.is_in_flight())
    }
}

/// A transient, user-visible notice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Text to show.
    pub text: String,
}

impl Notification {
    /// The notice raised for a failed turn.
    pub fn for_failure(kind: ErrorKind) -> Self {
        Self {
            kind,
            text: NOTIFICATION_TEXT.to_string(),
        }
    }
}

/// The session state machine.
#[derive(Debug, Default)]
pub struct Coordinator {
    transcript: Transcript,
    phase: Phase,
    active: Option<Turn>,
    last_error: Option<ErrorKind>,
    presentation: Presentation,
    next_turn: u64,
    revision: u64,
}

impl Coordinator {
    /// Creates an idle coordinator with an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The turn in flight, if any.
    pub fn active_turn(&self) -> Option<&Turn> {
        self.active.as_ref()
    }

    /// The transcript.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Kind of the most recent failure.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Presentation flags.
    pub fn presentation(&self) -> Presentation {
        self.presentation
    }

    /// Accepts a query and moves to `Admitting`.
    ///
    /// Appends the user message with the query exactly as given, then an empty assistant
    /// placeholder in `Pending`.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionBusy`] unless the phase is `Idle`.
    /// - [`Error::EmptyQuery`] if the query is blank after trimming.
    ///
    /// Neither error changes any state.
    pub fn admit(&mut self, query: &str) -> Result<Turn> {
        if self.phase != Phase::Idle {
            SESSION_BUSY_REJECTIONS.click();
            return Err(Error::SessionBusy);
        }
        if query.trim().is_empty() {
            SESSION_EMPTY_REJECTIONS.click();
            return Err(Error::EmptyQuery);
        }
        self.transcript.append(MessageDraft::user(query))?;
        let assistant = self.transcript.append(MessageDraft::assistant_placeholder())?;
        self.next_turn += 1;
        let turn = Turn {
            id: TurnId(self.next_turn),
            query: query.to_string(),
            assistant,
        };
        self.phase = Phase::Admitting;
        self.last_error = None;
        self.active = Some(turn.clone());
        self.bump();
        SESSION_SUBMITS.click();
        Ok(turn)
    }

    /// Records that the response stream for `turn` is open.
    ///
    /// Returns `Ok(false)` without changes if `turn` is not the active turn.
    pub fn stream_opened(&mut self, turn: TurnId) -> Result<bool> {
        if !self.is_active(turn) {
            return Ok(false);
        }
        if self.phase != Phase::Admitting {
            return Err(Error::invalid_state(format!(
                "stream opened for {turn} while {}",
                self.phase
            )));
        }
        self.phase = Phase::Streaming;
        self.bump();
        Ok(true)
    }

    /// Appends one chunk of `turn`'s response to the assistant message.
    ///
    /// Returns `Ok(false)` without changes if `turn` is not the active turn.
    pub fn apply_delta(&mut self, turn: TurnId, delta: &str) -> Result<bool> {
        if !self.is_active(turn) {
            return Ok(false);
        }
        if !self.phase.is_in_flight() {
            return Err(Error::invalid_state(format!(
                "chunk for {turn} while {}",
                self.phase
            )));
        }
        self.transcript.update_last_content(delta)?;
        self.phase = Phase::Streaming;
        self.bump();
        Ok(true)
    }

    /// Finalizes `turn` as `Complete` and returns to `Idle`.
    ///
    /// Returns `Ok(false)` without changes if `turn` is not the active turn.
    pub fn complete(&mut self, turn: TurnId) -> Result<bool> {
        if !self.is_active(turn) {
            return Ok(false);
        }
        self.transcript.finalize(MessageStatus::Complete, None)?;
        self.phase = Phase::Idle;
        self.active = None;
        self.bump();
        SESSION_TURNS_COMPLETED.click();
        Ok(true)
    }

    /// Finalizes `turn` as `Failed`, replacing any partial text with [`APOLOGY`], and moves to
    /// `Error`.
    ///
    /// Returns the notification to raise, or `None` if `turn` is not the active turn.  The
    /// caller returns the session to `Idle` with [`Coordinator::recover`].
    pub fn fail(&mut self, turn: TurnId, error: &Error) -> Result<Option<Notification>> {
        if !self.is_active(turn) {
            return Ok(None);
        }
        let kind = error.kind();
        self.active = None;
        self.phase = Phase::Error;
        self.last_error = Some(kind);
        // Clear the in-flight phase even if the transcript disagrees.
        let finalized = self
            .transcript
            .finalize(MessageStatus::Failed, Some(APOLOGY.to_string()));
        self.bump();
        SESSION_TURNS_FAILED.click();
        finalized?;
        Ok(Some(Notification::for_failure(kind)))
    }

    /// Leaves the `Error` phase.  Returns true if the phase changed.
    pub fn recover(&mut self) -> bool {
        if self.phase != Phase::Error {
            return false;
        }
        self.phase = Phase::Idle;
        self.bump();
        true
    }

    /// Clears the transcript and the last error and forces `Idle`.
    ///
    /// Returns the turn that was in flight, which the caller must cancel.  Presentation flags
    /// are kept.
    pub fn reset(&mut self) -> Option<TurnId> {
        let cancelled = self.active.take().map(|turn| turn.id);
        if cancelled.is_some() {
            SESSION_TURNS_CANCELLED.click();
        }
        self.transcript.reset();
        self.phase = Phase::Idle;
        self.last_error = None;
        self.bump();
        SESSION_RESETS.click();
        cancelled
    }

    /// Flips the `open` presentation flag and returns the new flags.
    pub fn toggle_open(&mut self) -> Presentation {
        self.presentation.open = !self.presentation.open;
        self.bump();
        self.presentation
    }

    /// Flips the `enlarged` presentation flag and returns the new flags.
    pub fn toggle_enlarged(&mut self) -> Presentation {
        self.presentation.enlarged = !self.presentation.enlarged;
        self.bump();
        self.presentation
    }

    /// Projects the current state.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            transcript: self.transcript.messages().to_vec(),
            in_flight: self.phase.is_in_flight(),
            last_error: self.last_error,
            presentation: self.presentation,
            revision: self.revision,
        }
    }

    fn is_active(&self, turn: TurnId) -> bool {
        self.active.as_ref().is_some_and(|active| active.id == turn)
    }

    fn bump(&mut self) {
        self.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Sender;

    fn in_flight_count(coordinator: &Coordinator) -> usize {
        coordinator
            .transcript()
            .messages()
            .iter()
            .filter(|m| m.is_in_flight())
            .count()
    }

    #[test]
    fn admit_appends_user_and_placeholder() {
        let mut coordinator = Coordinator::new();
        let turn = coordinator.admit("What do you do?").unwrap();
        assert_eq!(coordinator.phase(), Phase::Admitting);
        assert_eq!(turn.query, "What do you do?");
        let messages = coordinator.transcript().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[0].content, "What do you do?");
        assert_eq!(messages[0].status, MessageStatus::Complete);
        assert_eq!(messages[1].sender, Sender::Assistant);
        assert_eq!(messages[1].status, MessageStatus::Pending);
        assert_eq!(messages[1].id, turn.assistant);
        assert!(coordinator.snapshot().in_flight);
    }

    #[test]
    fn query_is_kept_verbatim() {
        let mut coordinator = Coordinator::new();
        coordinator.admit("  padded  ").unwrap();
        assert_eq!(coordinator.transcript().messages()[0].content, "  padded  ");
    }

    #[test]
    fn blank_query_is_rejected_without_change() {
        let mut coordinator = Coordinator::new();
        let before = coordinator.snapshot();
        let err = coordinator.admit("   ").unwrap_err();
        assert!(err.is_empty_query());
        assert_eq!(coordinator.snapshot(), before);
        assert_eq!(coordinator.phase(), Phase::Idle);
    }

    #[test]
    fn second_admit_is_busy_in_every_non_idle_phase() {
        let mut coordinator = Coordinator::new();
        let turn = coordinator.admit("one").unwrap();
        let before = coordinator.snapshot();
        assert!(coordinator.admit("two").unwrap_err().is_session_busy());
        assert_eq!(coordinator.snapshot(), before);

        coordinator.stream_opened(turn.id).unwrap();
        assert!(coordinator.admit("two").unwrap_err().is_session_busy());

        coordinator
            .fail(turn.id, &Error::streaming("boom", None))
            .unwrap();
        assert_eq!(coordinator.phase(), Phase::Error);
        let before = coordinator.snapshot();
        assert!(coordinator.admit("two").unwrap_err().is_session_busy());
        assert_eq!(coordinator.snapshot(), before);
    }

    #[test]
    fn busy_check_precedes_empty_check() {
        let mut coordinator = Coordinator::new();
        coordinator.admit("one").unwrap();
        assert!(coordinator.admit("").unwrap_err().is_session_busy());
    }

    #[test]
    fn full_turn_reaches_complete() {
        let mut coordinator = Coordinator::new();
        let turn = coordinator.admit("hi").unwrap();
        assert!(coordinator.stream_opened(turn.id).unwrap());
        assert_eq!(coordinator.phase(), Phase::Streaming);
        assert!(coordinator.apply_delta(turn.id, "Hel").unwrap());
        let last = coordinator.transcript().last().unwrap();
        assert_eq!(last.status, MessageStatus::Streaming);
        assert!(coordinator.apply_delta(turn.id, "lo").unwrap());
        assert!(coordinator.complete(turn.id).unwrap());

        let last = coordinator.transcript().last().unwrap();
        assert_eq!(last.content, "Hello");
        assert_eq!(last.status, MessageStatus::Complete);
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert!(coordinator.active_turn().is_none());
        assert_eq!(in_flight_count(&coordinator), 0);
    }

    #[test]
    fn failure_overwrites_partial_text() {
        let mut coordinator = Coordinator::new();
        let turn = coordinator.admit("hi").unwrap();
        coordinator.stream_opened(turn.id).unwrap();
        coordinator.apply_delta(turn.id, "Par").unwrap();
        let notification = coordinator
            .fail(
                turn.id,
                &Error::stream_interrupted("lost", Some(Error::timeout("slow", None))),
            )
            .unwrap()
            .unwrap();
        assert_eq!(notification.kind, ErrorKind::StreamInterrupted);
        assert_eq!(notification.text, NOTIFICATION_TEXT);

        let last = coordinator.transcript().last().unwrap();
        assert_eq!(last.content, APOLOGY);
        assert_eq!(last.status, MessageStatus::Failed);
        assert_eq!(coordinator.phase(), Phase::Error);
        assert_eq!(
            coordinator.snapshot().last_error,
            Some(ErrorKind::StreamInterrupted)
        );
        assert!(!coordinator.snapshot().in_flight);

        assert!(coordinator.recover());
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert!(!coordinator.recover());
    }

    #[test]
    fn failure_before_open_is_handled() {
        let mut coordinator = Coordinator::new();
        let turn = coordinator.admit("hi").unwrap();
        coordinator
            .fail(turn.id, &Error::authentication("bad key"))
            .unwrap()
            .unwrap();
        let last = coordinator.transcript().last().unwrap();
        assert_eq!(last.content, APOLOGY);
        assert_eq!(last.status, MessageStatus::Failed);
        assert_eq!(coordinator.last_error(), Some(ErrorKind::StreamInterrupted));
    }

    #[test]
    fn next_turn_clears_last_error() {
        let mut coordinator = Coordinator::new();
        let turn = coordinator.admit("one").unwrap();
        coordinator
            .fail(turn.id, &Error::streaming("x", None))
            .unwrap();
        coordinator.recover();
        coordinator.admit("two").unwrap();
        assert_eq!(coordinator.last_error(), None);
        assert_eq!(coordinator.transcript().len(), 4);
    }

    #[test]
    fn reset_from_every_phase() {
        let mut coordinator = Coordinator::new();
        assert_eq!(coordinator.reset(), None);

        let turn = coordinator.admit("a").unwrap();
        assert_eq!(coordinator.reset(), Some(turn.id));

        let turn = coordinator.admit("b").unwrap();
        coordinator.stream_opened(turn.id).unwrap();
        coordinator.apply_delta(turn.id, "partial").unwrap();
        assert_eq!(coordinator.reset(), Some(turn.id));

        let turn = coordinator.admit("c").unwrap();
        coordinator
            .fail(turn.id, &Error::streaming("x", None))
            .unwrap();
        assert_eq!(coordinator.reset(), None);

        let snapshot = coordinator.snapshot();
        assert!(snapshot.transcript.is_empty());
        assert!(!snapshot.in_flight);
        assert_eq!(snapshot.last_error, None);
        assert_eq!(snapshot.phase, Phase::Idle);
    }

    #[test]
    fn stale_turn_events_are_ignored() {
        let mut coordinator = Coordinator::new();
        let old = coordinator.admit("old").unwrap();
        coordinator.stream_opened(old.id).unwrap();
        coordinator.reset();
        let new = coordinator.admit("new").unwrap();

        assert!(!coordinator.stream_opened(old.id).unwrap());
        assert!(!coordinator.apply_delta(old.id, "late").unwrap());
        assert!(!coordinator.complete(old.id).unwrap());
        assert!(
            coordinator
                .fail(old.id, &Error::streaming("late", None))
                .unwrap()
                .is_none()
        );

        let last = coordinator.transcript().last().unwrap();
        assert_eq!(last.content, "");
        assert_eq!(last.status, MessageStatus::Pending);
        assert_eq!(coordinator.active_turn().map(|t| t.id), Some(new.id));
    }

    #[test]
    fn turn_ids_are_unique_across_resets() {
        let mut coordinator = Coordinator::new();
        let first = coordinator.admit("a").unwrap();
        coordinator.reset();
        let second = coordinator.admit("b").unwrap();
        assert_ne!(first.id, second.id);
        assert!(second.assistant > first.assistant);
    }

    #[test]
    fn presentation_is_outside_the_state_machine() {
        let mut coordinator = Coordinator::new();
        let turn = coordinator.admit("a").unwrap();
        let flags = coordinator.toggle_open();
        assert!(flags.open);
        assert!(!flags.enlarged);
        let flags = coordinator.toggle_enlarged();
        assert!(flags.enlarged);
        assert_eq!(coordinator.phase(), Phase::Admitting);
        assert_eq!(coordinator.active_turn().map(|t| t.id), Some(turn.id));

        coordinator.reset();
        assert_eq!(
            coordinator.presentation(),
            Presentation {
                open: true,
                enlarged: true
            }
        );
        assert!(!coordinator.toggle_open().open);
    }

    #[test]
    fn revision_increases_with_every_mutation() {
        let mut coordinator = Coordinator::new();
        let r0 = coordinator.snapshot().revision;
        let turn = coordinator.admit("a").unwrap();
        let r1 = coordinator.snapshot().revision;
        coordinator.stream_opened(turn.id).unwrap();
        let r2 = coordinator.snapshot().revision;
        let _ = coordinator.admit("b");
        let r3 = coordinator.snapshot().revision;
        assert!(r0 < r1 && r1 < r2);
        assert_eq!(r2, r3);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let mut coordinator = Coordinator::new();
        coordinator.admit("hi").unwrap();
        let json = serde_json::to_value(coordinator.snapshot()).unwrap();
        assert_eq!(json["phase"], "admitting");
        assert_eq!(json["in_flight"], true);
        assert_eq!(json["transcript"][1]["status"], "pending");
        assert_eq!(json["last_error"], serde_json::Value::Null);
    }
}
