//! The session event loop.
//!
//! [`spawn_session`] starts a driver task that owns the [`Coordinator`] and is the session's
//! single writer.  Callers talk to it through a cloneable [`SessionHandle`]; every command is
//! applied in arrival order and answered over a oneshot channel.  Each admitted turn runs in
//! its own task that opens the transport stream and feeds the [`ResponseAccumulator`]; the
//! chunks come back to the driver as turn-tagged events so a reset can discard anything a
//! cancelled stream still had in flight.
//!
//! Observers read the session three ways:
//! - [`SessionHandle::snapshot`] / [`SessionHandle::watch`] for the latest state,
//! - [`SessionHandle::subscribe`] for every snapshot in order,
//! - [`SessionHandle::notifications`] for transient failure notices.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::accumulator::{DeltaSink, ResponseAccumulator};
use crate::coordinator::{Coordinator, Notification, Presentation, SessionSnapshot, TurnId};
use crate::error::{Error, Result};
use crate::preamble::PreambleProvider;
use crate::transport::Transport;

/// Default number of snapshots buffered for each [`SessionHandle::subscribe`] receiver.
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 256;

/// Default number of notifications buffered for each [`SessionHandle::notifications`] receiver.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 16;

const COMMAND_CAPACITY: usize = 32;

/// Channel sizing for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// Snapshots a lagging subscriber may fall behind before it misses some.
    pub snapshot_capacity: usize,
    /// Notifications a lagging subscriber may fall behind before it misses some.
    pub notification_capacity: usize,
}

impl SessionOptions {
    /// Sets the snapshot buffer size; zero is raised to one.
    pub fn with_snapshot_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_capacity = capacity.max(1);
        self
    }

    /// Sets the notification buffer size; zero is raised to one.
    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity.max(1);
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

enum Command {
    Submit {
        query: String,
        reply: oneshot::Sender<Result<TurnId>>,
    },
    SubmitSuggestion {
        index: usize,
        reply: oneshot::Sender<Result<TurnId>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    ToggleOpen {
        reply: oneshot::Sender<Presentation>,
    },
    ToggleEnlarged {
        reply: oneshot::Sender<Presentation>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum TurnEvent {
    Opened(TurnId),
    Delta(TurnId, String),
    Completed(TurnId),
    Failed(TurnId, Error),
}

/// Cloneable handle to a running session.
///
/// The driver stops when [`SessionHandle::shutdown`] is called or when every handle has been
/// dropped; either way the turn in flight is cancelled.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    latest: watch::Receiver<SessionSnapshot>,
    snapshots: broadcast::Sender<SessionSnapshot>,
    notifications: broadcast::Sender<Notification>,
    preamble: Arc<dyn PreambleProvider>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("revision", &self.latest.borrow().revision)
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl SessionHandle {
    /// Submits a query.
    ///
    /// Returns the id of the admitted turn once the user message and assistant placeholder
    /// are in the transcript.  The response streams in afterwards.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionBusy`] while a turn is in flight.
    /// - [`Error::EmptyQuery`] for a blank query.
    /// - [`Error::SessionClosed`] if the session has shut down.
    ///
    /// None of these change the session.
    pub async fn submit(&self, query: impl Into<String>) -> Result<TurnId> {
        let query = query.into();
        self.request(|reply| Command::Submit { query, reply })
            .await?
    }

    /// Submits the preamble's suggested prompt at `index`, with the same admission rules as
    /// [`SessionHandle::submit`].
    ///
    /// # Errors
    ///
    /// Additionally returns a validation error if `index` is out of range.
    pub async fn submit_suggestion(&self, index: usize) -> Result<TurnId> {
        self.request(|reply| Command::SubmitSuggestion { index, reply })
            .await?
    }

    /// Cancels the turn in flight, clears the transcript and the last error, and returns the
    /// session to idle.  Resolves after the reset snapshot is published.
    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Flips the `open` presentation flag.
    pub async fn toggle_open(&self) -> Result<Presentation> {
        self.request(|reply| Command::ToggleOpen { reply }).await
    }

    /// Flips the `enlarged` presentation flag.
    pub async fn toggle_enlarged(&self) -> Result<Presentation> {
        self.request(|reply| Command::ToggleEnlarged { reply }).await
    }

    /// Stops the driver after cancelling the turn in flight.  Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.latest.borrow().clone()
    }

    /// A receiver that always holds the most recent snapshot.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.latest.clone()
    }

    /// A receiver of every snapshot published from now on, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    /// A receiver of every notification raised from now on.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// The preamble this session sends with every request.
    pub fn preamble(&self) -> &dyn PreambleProvider {
        self.preamble.as_ref()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }
}

/// Starts a session on the current tokio runtime.
pub fn spawn_session(
    transport: Arc<dyn Transport>,
    preamble: Arc<dyn PreambleProvider>,
    options: SessionOptions,
) -> SessionHandle {
    let coordinator = Coordinator::new();
    let initial = coordinator.snapshot();
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (latest_tx, latest_rx) = watch::channel(initial);
    let (snapshots_tx, _) = broadcast::channel(options.snapshot_capacity.max(1));
    let (notifications_tx, _) = broadcast::channel(options.notification_capacity.max(1));

    let driver = Driver {
        coordinator,
        transport,
        preamble: Arc::clone(&preamble),
        active: None,
        events: events_tx,
        latest: latest_tx,
        snapshots: snapshots_tx.clone(),
        notifications: notifications_tx.clone(),
    };
    tokio::spawn(driver.run(commands_rx, events_rx));

    SessionHandle {
        commands: commands_tx,
        latest: latest_rx,
        snapshots: snapshots_tx,
        notifications: notifications_tx,
        preamble,
    }
}

struct ActiveTurn {
    id: TurnId,
    cancel: CancellationToken,
}

struct Driver {
    coordinator: Coordinator,
    transport: Arc<dyn Transport>,
    preamble: Arc<dyn PreambleProvider>,
    active: Option<ActiveTurn>,
    events: mpsc::UnboundedSender<TurnEvent>,
    latest: watch::Sender<SessionSnapshot>,
    snapshots: broadcast::Sender<SessionSnapshot>,
    notifications: broadcast::Sender<Notification>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<TurnEvent>,
    ) {
        tracing::debug!("session started");
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown();
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        self.teardown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { query, reply } => {
                let _ = reply.send(self.submit(query));
            }
            Command::SubmitSuggestion { index, reply } => {
                let result = match self.preamble.suggested_prompts().get(index) {
                    Some(prompt) => self.submit(prompt.clone()),
                    None => Err(Error::validation(
                        format!("no suggested prompt at index {index}"),
                        Some("index".to_string()),
                    )),
                };
                let _ = reply.send(result);
            }
            Command::Reset { reply } => {
                self.reset();
                let _ = reply.send(());
            }
            Command::ToggleOpen { reply } => {
                let presentation = self.coordinator.toggle_open();
                self.publish();
                let _ = reply.send(presentation);
            }
            Command::ToggleEnlarged { reply } => {
                let presentation = self.coordinator.toggle_enlarged();
                self.publish();
                let _ = reply.send(presentation);
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    fn submit(&mut self, query: String) -> Result<TurnId> {
        let turn = match self.coordinator.admit(&query) {
            Ok(turn) => turn,
            Err(err) => {
                tracing::debug!(error = %err, "submission rejected");
                return Err(err);
            }
        };
        self.publish();
        tracing::info!(turn = %turn.id, query_len = query.len(), "turn admitted");

        let cancel = CancellationToken::new();
        self.active = Some(ActiveTurn {
            id: turn.id,
            cancel: cancel.clone(),
        });
        let task = tokio::spawn(run_turn(
            Arc::clone(&self.transport),
            Arc::clone(&self.preamble),
            turn.id,
            turn.query,
            self.events.clone(),
            cancel,
        ));
        tokio::spawn(supervise_turn(turn.id, task, self.events.clone()));
        Ok(turn.id)
    }

    fn reset(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
        let cancelled = self.coordinator.reset();
        self.publish();
        tracing::info!(cancelled = ?cancelled.map(|t| t.get()), "session reset");
    }

    fn handle_event(&mut self, event: TurnEvent) {
        let turn = match &event {
            TurnEvent::Opened(turn)
            | TurnEvent::Delta(turn, _)
            | TurnEvent::Completed(turn)
            | TurnEvent::Failed(turn, _) => *turn,
        };
        let result = match event {
            TurnEvent::Opened(turn) => self.coordinator.stream_opened(turn).map(|applied| {
                if applied {
                    tracing::debug!(turn = %turn, "response stream opened");
                }
                applied
            }),
            TurnEvent::Delta(turn, delta) => self.coordinator.apply_delta(turn, &delta),
            TurnEvent::Completed(turn) => self.coordinator.complete(turn).map(|applied| {
                if applied {
                    self.active = None;
                    tracing::info!(turn = %turn, "turn completed");
                }
                applied
            }),
            TurnEvent::Failed(turn, err) => {
                tracing::warn!(turn = %turn, error = %err, "turn failed");
                Ok(self.fail(turn, &err))
            }
        };
        match result {
            Ok(true) => self.publish(),
            Ok(false) => tracing::trace!(turn = %turn, "discarded event for inactive turn"),
            Err(err) => {
                tracing::error!(turn = %turn, error = %err, "transcript rejected turn event");
                self.fail(turn, &err);
                self.publish();
            }
        }
    }

    /// Finalizes a failed turn, raises the notification, and returns to idle.
    ///
    /// Returns false if `turn` is no longer active.
    fn fail(&mut self, turn: TurnId, err: &Error) -> bool {
        if self.active.as_ref().is_some_and(|active| active.id == turn)
            && let Some(active) = self.active.take()
        {
            active.cancel.cancel();
        }
        let notification = match self.coordinator.fail(turn, err) {
            Ok(Some(notification)) => notification,
            Ok(None) => return false,
            Err(inconsistent) => {
                tracing::error!(turn = %turn, error = %inconsistent, "could not finalize failed turn");
                Notification::for_failure(err.kind())
            }
        };
        self.publish();
        let _ = self.notifications.send(notification);
        self.coordinator.recover();
        true
    }

    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            tracing::debug!(turn = %active.id, "cancelled turn on teardown");
        }
        tracing::debug!("session stopped");
    }

    fn publish(&self) {
        let snapshot = self.coordinator.snapshot();
        if snapshot.revision == self.latest.borrow().revision {
            return;
        }
        let _ = self.snapshots.send(snapshot.clone());
        self.latest.send_replace(snapshot);
    }
}

/// Forwards accumulator mutations to the driver, tagged with their turn.
struct TurnSink {
    turn: TurnId,
    events: mpsc::UnboundedSender<TurnEvent>,
}

impl DeltaSink for TurnSink {
    fn apply_delta(&mut self, delta: &str) -> Result<()> {
        self.events
            .send(TurnEvent::Delta(self.turn, delta.to_string()))
            .map_err(|_| Error::SessionClosed)
    }

    fn complete(&mut self) -> Result<()> {
        self.events
            .send(TurnEvent::Completed(self.turn))
            .map_err(|_| Error::SessionClosed)
    }
}

/// Fails the turn if its task dies without reporting an outcome.
///
/// A turn that already completed or was reset makes the failure stale, and the driver drops it.
async fn supervise_turn(
    turn: TurnId,
    task: JoinHandle<()>,
    events: mpsc::UnboundedSender<TurnEvent>,
) {
    match task.await {
        Ok(()) => {}
        Err(err) if err.is_panic() => {
            tracing::error!(turn = %turn, "response task panicked");
            let _ = events.send(TurnEvent::Failed(
                turn,
                Error::stream_interrupted("response task panicked", None),
            ));
        }
        Err(err) => {
            tracing::warn!(turn = %turn, error = %err, "response task ended without an outcome");
            let _ = events.send(TurnEvent::Failed(
                turn,
                Error::stream_interrupted("response task was cancelled", None),
            ));
        }
    }
}

async fn run_turn(
    transport: Arc<dyn Transport>,
    preamble: Arc<dyn PreambleProvider>,
    turn: TurnId,
    query: String,
    events: mpsc::UnboundedSender<TurnEvent>,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(turn = %turn, "turn cancelled before the stream opened");
            return;
        }
        opened = transport.stream_completion(preamble.instructions(), preamble.opening_reply(), &query) => opened,
    };
    let stream = match opened {
        Ok(stream) => stream,
        Err(err) => {
            let err = Error::stream_interrupted("failed to open response stream", Some(err));
            let _ = events.send(TurnEvent::Failed(turn, err));
            return;
        }
    };
    if events.send(TurnEvent::Opened(turn)).is_err() {
        return;
    }
    let mut sink = TurnSink {
        turn,
        events: events.clone(),
    };
    let mut accumulator = ResponseAccumulator::new();
    match accumulator.consume(stream, &mut sink, &cancel).await {
        Ok(text) => tracing::debug!(
            turn = %turn,
            bytes = text.len(),
            chunks = accumulator.chunks(),
            elapsed = ?accumulator.duration(),
            "response stream finished"
        ),
        Err(err) if err.is_aborted() => {
            tracing::debug!(turn = %turn, "response stream cancelled");
        }
        Err(Error::SessionClosed) => {}
        Err(err) => {
            let _ = events.send(TurnEvent::Failed(turn, err));
        }
    }
}
