//! Interactive chat with the VCNR assistant.
//!
//! This binary plays the part of the embedded assistant widget: it shows the scripted
//! opening reply and suggested questions, submits what you type, and renders each reply as
//! it streams in.
//!
//! # Usage
//!
//! ```bash
//! # Talk to the live service (reads GEMINI_API_KEY)
//! concierge-chat
//!
//! # Use a custom preamble
//! concierge-chat --preamble assistant.yaml
//!
//! # Try it without network access
//! concierge-chat --offline
//!
//! # See what the session is doing
//! RUST_LOG=concierge=debug concierge-chat
//! ```
//!
//! # Commands
//!
//! - `/help` - Show available commands
//! - `/1` .. `/9` - Ask a suggested question
//! - `/reset` - Cancel any reply and clear the conversation
//! - `/transcript` - Show the conversation so far
//! - `/quit` - Exit the application

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::{Notify, broadcast};
use tracing_subscriber::EnvFilter;

use concierge::commands::{ChatCommand, help_text, parse_command};
use concierge::render::{PlainTextRenderer, Renderer, SnapshotPrinter};
use concierge::{
    AssistantArgs, AssistantConfig, GeminiTransport, MessageStatus, Notification, Phase,
    PreambleProvider, ScriptedTransport, Sender, SessionHandle, Transport, spawn_session,
};

/// Ctrl+C state shared with the signal handler.
#[derive(Default)]
struct Interrupt {
    flag: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::Relaxed)
    }
}

/// Main entry point for the concierge-chat application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("concierge=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (args, _) = AssistantArgs::from_command_line_relaxed("concierge-chat [OPTIONS]");
    let config = AssistantConfig::from(args);
    let preamble = Arc::new(config.load_preamble()?);
    let transport: Arc<dyn Transport> = if config.offline {
        Arc::new(ScriptedTransport::offline_demo())
    } else {
        Arc::new(GeminiTransport::from_config(None, &config)?)
    };

    let session = spawn_session(transport, preamble, config.session_options());
    let mut notifications = session.notifications();
    let mut renderer = PlainTextRenderer::with_color(config.use_color);
    let mut printer = SnapshotPrinter::new();
    let mut rl = DefaultEditor::new()?;

    let interrupt = Arc::new(Interrupt::default());
    let handler_interrupt = Arc::clone(&interrupt);
    ctrlc::set_handler(move || {
        handler_interrupt.trigger();
    })?;

    if config.offline {
        println!("VCNR Assistant (offline)");
    } else {
        println!("VCNR Assistant (model: {})", config.model);
    }
    println!("Type /help for commands, /quit to exit\n");
    print_greeting(session.preamble(), &mut renderer);

    loop {
        interrupt.clear();

        match rl.readline("You: ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                let submitted = if let Some(cmd) = parse_command(line) {
                    match cmd {
                        ChatCommand::Quit => {
                            println!("Goodbye!");
                            break;
                        }
                        ChatCommand::Reset => {
                            session.reset().await?;
                            renderer.print_info("Conversation cleared.");
                            print_greeting(session.preamble(), &mut renderer);
                            continue;
                        }
                        ChatCommand::Suggest(index) => session.submit_suggestion(index).await,
                        ChatCommand::ListSuggestions => {
                            print_suggestions(session.preamble(), &mut renderer);
                            continue;
                        }
                        ChatCommand::ToggleOpen => {
                            let flags = session.toggle_open().await?;
                            renderer.print_info(&format!("Widget open: {}", yes_no(flags.open)));
                            continue;
                        }
                        ChatCommand::ToggleEnlarged => {
                            let flags = session.toggle_enlarged().await?;
                            renderer.print_info(&format!(
                                "Widget enlarged: {}",
                                yes_no(flags.enlarged)
                            ));
                            continue;
                        }
                        ChatCommand::ShowTranscript => {
                            print_transcript(&session);
                            continue;
                        }
                        ChatCommand::Status => {
                            print_status(&session);
                            continue;
                        }
                        ChatCommand::Help => {
                            for line in help_text().lines() {
                                println!("    {}", line);
                            }
                            continue;
                        }
                        ChatCommand::Invalid(message) => {
                            renderer.print_error(&message);
                            continue;
                        }
                    }
                } else {
                    session.submit(line).await
                };

                match submitted {
                    Ok(_) => {
                        follow_turn(
                            &session,
                            &mut printer,
                            &mut renderer,
                            &mut notifications,
                            &interrupt,
                        )
                        .await?;
                    }
                    Err(err) if err.is_empty_query() || err.is_session_busy() => {}
                    Err(err) if err.is_validation() => renderer.print_error(&err.to_string()),
                    Err(err) => {
                        renderer.print_error(&err.to_string());
                        break;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C at prompt - soft interrupt
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                // Ctrl+D - exit
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                renderer.print_error(&format!("Input error: {}", err));
                break;
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

/// Renders the turn in flight until it finishes; Ctrl+C resets the session.
async fn follow_turn(
    session: &SessionHandle,
    printer: &mut SnapshotPrinter,
    renderer: &mut PlainTextRenderer,
    notifications: &mut broadcast::Receiver<Notification>,
    interrupt: &Interrupt,
) -> concierge::Result<()> {
    let mut updates = session.watch();
    loop {
        let snapshot = updates.borrow_and_update().clone();
        printer.render(&snapshot, renderer);
        // Idle is published after the failure notification is raised.
        if snapshot.phase == Phase::Idle {
            break;
        }
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = interrupt.notify.notified() => {
                if interrupt.take() {
                    session.reset().await?;
                }
            }
        }
    }
    while let Ok(notification) = notifications.try_recv() {
        renderer.print_notification(&notification.text);
    }
    Ok(())
}

fn print_greeting(preamble: &dyn PreambleProvider, renderer: &mut dyn Renderer) {
    renderer.start_response();
    renderer.print_text(preamble.opening_reply());
    renderer.finish_response();
    print_suggestions(preamble, renderer);
}

fn print_suggestions(preamble: &dyn PreambleProvider, renderer: &mut dyn Renderer) {
    let prompts = preamble.suggested_prompts();
    if prompts.is_empty() {
        return;
    }
    renderer.print_info("Suggested questions:");
    for (i, prompt) in prompts.iter().enumerate() {
        renderer.print_info(&format!("  /{} {}", i + 1, prompt));
    }
    println!();
}

fn print_transcript(session: &SessionHandle) {
    let snapshot = session.snapshot();
    if snapshot.transcript.is_empty() {
        println!("    (no messages)");
        return;
    }
    for message in &snapshot.transcript {
        let who = match message.sender {
            Sender::User => "You",
            Sender::Assistant => "Assistant",
        };
        match message.status {
            MessageStatus::Complete => println!("    {who}: {}", message.content),
            status => println!("    {who} [{status:?}]: {}", message.content),
        }
    }
}

fn print_status(session: &SessionHandle) {
    let snapshot = session.snapshot();
    println!("    Session Status:");
    println!("      Phase: {}", snapshot.phase);
    println!("      Messages: {}", snapshot.transcript.len());
    println!("      In flight: {}", yes_no(snapshot.in_flight));
    match snapshot.last_error {
        Some(kind) => println!("      Last error: {kind}"),
        None => println!("      Last error: (none)"),
    }
    println!("      Widget open: {}", yes_no(snapshot.presentation.open));
    println!(
        "      Widget enlarged: {}",
        yes_no(snapshot.presentation.enlarged)
    );
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
