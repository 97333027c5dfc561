//! Output rendering for the terminal front end.
//!
//! [`Renderer`] abstracts the terminal so the session view can be tested; [`SnapshotPrinter`]
//! turns the session's snapshot stream into incremental renderer calls.

use std::io::{self, Stdout, Write};

use crate::coordinator::SessionSnapshot;
use crate::transcript::{MessageId, MessageStatus, Sender};

/// ANSI escape code for dim text (used for informational lines).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for the assistant label).
const ANSI_CYAN: &str = "\x1b[36m";

/// ANSI escape code for yellow text (used for notifications).
const ANSI_YELLOW: &str = "\x1b[33m";

/// ANSI escape code for red text (used for failed replies).
const ANSI_RED: &str = "\x1b[31m";

/// Trait for rendering chat output.
pub trait Renderer: Send {
    /// Called before the first chunk of a reply.
    fn start_response(&mut self);

    /// Print a chunk of reply text as it streams in.
    fn print_text(&mut self, text: &str);

    /// Called when a reply is complete.
    fn finish_response(&mut self);

    /// Print the text that replaced a failed reply.
    fn print_failed(&mut self, text: &str);

    /// Called when a streaming reply was cancelled by a reset.
    fn print_interrupted(&mut self);

    /// Print a transient notification.
    fn print_notification(&mut self, text: &str);

    /// Print an error message.
    fn print_error(&mut self, error: &str);

    /// Print an informational message.
    fn print_info(&mut self, info: &str);
}

/// Plain text renderer with optional ANSI styling.
pub struct PlainTextRenderer {
    stdout: Stdout,
    use_color: bool,
}

impl PlainTextRenderer {
    /// Creates a new PlainTextRenderer with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self {
            stdout: io::stdout(),
            use_color,
        }
    }

    /// Flushes stdout to ensure immediate display of streamed content.
    fn flush(&mut self) {
        let _ = self.stdout.flush();
    }

    fn styled(&self, style: &str, text: &str) -> String {
        if self.use_color {
            format!("{style}{text}{ANSI_RESET}")
        } else {
            text.to_string()
        }
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for PlainTextRenderer {
    fn start_response(&mut self) {
        println!("{}", self.styled(ANSI_CYAN, "Assistant:"));
        self.flush();
    }

    fn print_text(&mut self, text: &str) {
        print!("{text}");
        self.flush();
    }

    fn finish_response(&mut self) {
        println!();
        self.flush();
    }

    fn print_failed(&mut self, text: &str) {
        println!("\n{}", self.styled(ANSI_RED, text));
        self.flush();
    }

    fn print_interrupted(&mut self) {
        println!("\n{}", self.styled(ANSI_DIM, "[interrupted]"));
        self.flush();
    }

    fn print_notification(&mut self, text: &str) {
        eprintln!("{}", self.styled(ANSI_YELLOW, &format!("! {text}")));
    }

    fn print_error(&mut self, error: &str) {
        eprintln!("\nError: {error}");
    }

    fn print_info(&mut self, info: &str) {
        println!("{}", self.styled(ANSI_DIM, info));
    }
}

#[derive(Debug)]
struct Tracked {
    id: MessageId,
    printed: usize,
    done: bool,
}

/// Renders the assistant reply of each turn incrementally from session snapshots.
///
/// Only the suffix added since the previous snapshot is printed, so skipped snapshots (a
/// lagging subscriber, or a watch receiver that only sees the latest value) still produce the
/// full text exactly once.
#[derive(Debug, Default)]
pub struct SnapshotPrinter {
    tracked: Option<Tracked>,
}

impl SnapshotPrinter {
    /// Creates a printer that has not seen any reply.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a reply has started printing but has not finished.
    pub fn is_streaming(&self) -> bool {
        self.tracked.as_ref().is_some_and(|t| !t.done)
    }

    /// Renders whatever changed in the last assistant message since the previous call.
    pub fn render(&mut self, snapshot: &SessionSnapshot, renderer: &mut dyn Renderer) {
        let Some(message) = snapshot
            .last_message()
            .filter(|m| m.sender == Sender::Assistant)
        else {
            if self.is_streaming() {
                renderer.print_interrupted();
            }
            self.tracked = None;
            return;
        };

        if self.tracked.as_ref().map(|t| t.id) != Some(message.id) {
            if self.is_streaming() {
                renderer.print_interrupted();
            }
            renderer.start_response();
            self.tracked = Some(Tracked {
                id: message.id,
                printed: 0,
                done: false,
            });
        }
        let Some(tracked) = self.tracked.as_mut() else {
            return;
        };
        if tracked.done {
            return;
        }
        match message.status {
            MessageStatus::Pending => {}
            MessageStatus::Streaming | MessageStatus::Complete => {
                if let Some(suffix) = message.content.get(tracked.printed..)
                    && !suffix.is_empty()
                {
                    renderer.print_text(suffix);
                    tracked.printed = message.content.len();
                }
                if message.status == MessageStatus::Complete {
                    renderer.finish_response();
                    tracked.done = true;
                }
            }
            MessageStatus::Failed => {
                renderer.print_failed(&message.content);
                tracked.done = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::error::Error;

    #[derive(Default)]
    struct RecordingRenderer {
        calls: Vec<String>,
    }

    impl Renderer for RecordingRenderer {
        fn start_response(&mut self) {
            self.calls.push("start".to_string());
        }
        fn print_text(&mut self, text: &str) {
            self.calls.push(format!("text:{text}"));
        }
        fn finish_response(&mut self) {
            self.calls.push("finish".to_string());
        }
        fn print_failed(&mut self, text: &str) {
            self.calls.push(format!("failed:{text}"));
        }
        fn print_interrupted(&mut self) {
            self.calls.push("interrupted".to_string());
        }
        fn print_notification(&mut self, text: &str) {
            self.calls.push(format!("notify:{text}"));
        }
        fn print_error(&mut self, error: &str) {
            self.calls.push(format!("error:{error}"));
        }
        fn print_info(&mut self, info: &str) {
            self.calls.push(format!("info:{info}"));
        }
    }

    #[test]
    fn renderer_default_has_color() {
        let renderer = PlainTextRenderer::new();
        assert!(renderer.use_color);
        assert_eq!(renderer.styled(ANSI_RED, "x"), "\x1b[31mx\x1b[0m");
    }

    #[test]
    fn renderer_without_color() {
        let renderer = PlainTextRenderer::with_color(false);
        assert!(!renderer.use_color);
        assert_eq!(renderer.styled(ANSI_RED, "x"), "x");
    }

    #[test]
    fn prints_each_suffix_once() {
        let mut coordinator = Coordinator::new();
        let mut printer = SnapshotPrinter::new();
        let mut renderer = RecordingRenderer::default();

        let turn = coordinator.admit("hi").unwrap();
        printer.render(&coordinator.snapshot(), &mut renderer);
        coordinator.stream_opened(turn.id).unwrap();
        coordinator.apply_delta(turn.id, "Hel").unwrap();
        printer.render(&coordinator.snapshot(), &mut renderer);
        printer.render(&coordinator.snapshot(), &mut renderer);
        assert!(printer.is_streaming());
        coordinator.apply_delta(turn.id, "lo").unwrap();
        coordinator.complete(turn.id).unwrap();
        printer.render(&coordinator.snapshot(), &mut renderer);
        printer.render(&coordinator.snapshot(), &mut renderer);

        assert_eq!(renderer.calls, ["start", "text:Hel", "text:lo", "finish"]);
        assert!(!printer.is_streaming());
    }

    #[test]
    fn skipped_snapshots_still_print_everything() {
        let mut coordinator = Coordinator::new();
        let mut printer = SnapshotPrinter::new();
        let mut renderer = RecordingRenderer::default();

        let turn = coordinator.admit("hi").unwrap();
        coordinator.stream_opened(turn.id).unwrap();
        coordinator.apply_delta(turn.id, "a").unwrap();
        coordinator.apply_delta(turn.id, "b").unwrap();
        coordinator.complete(turn.id).unwrap();
        printer.render(&coordinator.snapshot(), &mut renderer);

        assert_eq!(renderer.calls, ["start", "text:ab", "finish"]);
    }

    #[test]
    fn failure_prints_apology() {
        let mut coordinator = Coordinator::new();
        let mut printer = SnapshotPrinter::new();
        let mut renderer = RecordingRenderer::default();

        let turn = coordinator.admit("hi").unwrap();
        coordinator.stream_opened(turn.id).unwrap();
        coordinator.apply_delta(turn.id, "Par").unwrap();
        printer.render(&coordinator.snapshot(), &mut renderer);
        coordinator
            .fail(turn.id, &Error::streaming("cut", None))
            .unwrap();
        printer.render(&coordinator.snapshot(), &mut renderer);

        assert_eq!(
            renderer.calls,
            [
                "start",
                "text:Par",
                "failed:Sorry, I ran into an issue. Please try again."
            ]
        );
    }

    #[test]
    fn reset_mid_stream_reports_interruption() {
        let mut coordinator = Coordinator::new();
        let mut printer = SnapshotPrinter::new();
        let mut renderer = RecordingRenderer::default();

        let turn = coordinator.admit("hi").unwrap();
        coordinator.stream_opened(turn.id).unwrap();
        coordinator.apply_delta(turn.id, "Par").unwrap();
        printer.render(&coordinator.snapshot(), &mut renderer);
        coordinator.reset();
        printer.render(&coordinator.snapshot(), &mut renderer);
        printer.render(&coordinator.snapshot(), &mut renderer);

        assert_eq!(renderer.calls, ["start", "text:Par", "interrupted"]);
    }
}
