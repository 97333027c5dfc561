//! Slash command parsing for the terminal front end.
//!
//! Lines starting with `/` control the session and are never sent to the service.

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Cancel any response and clear the conversation.
    Reset,

    /// Submit the suggested prompt at this zero-based index.
    Suggest(usize),

    /// List the suggested prompts.
    ListSuggestions,

    /// Toggle the `open` presentation flag.
    ToggleOpen,

    /// Toggle the `enlarged` presentation flag.
    ToggleEnlarged,

    /// Print the transcript.
    ShowTranscript,

    /// Print the current session state.
    Status,

    /// Display help information.
    Help,

    /// Exit the chat application.
    Quit,

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for slash commands.
///
/// Returns `Some(ChatCommand)` if the input is a command, or `None` if it should be submitted
/// as a query.  Suggestions are numbered from one on the command line.
///
/// # Examples
///
/// ```
/// # use concierge::commands::{ChatCommand, parse_command};
/// assert_eq!(parse_command("/reset"), Some(ChatCommand::Reset));
/// assert_eq!(parse_command("/2"), Some(ChatCommand::Suggest(1)));
/// assert!(parse_command("What do you build?").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next()?.to_lowercase();
    let argument = parts.next().map(|s| s.trim()).filter(|s| !s.is_empty());

    let result = match command.as_str() {
        "reset" | "clear" => ChatCommand::Reset,
        "suggest" | "s" => match argument {
            Some(arg) => parse_suggestion(arg),
            None => ChatCommand::ListSuggestions,
        },
        "suggestions" => ChatCommand::ListSuggestions,
        "open" => ChatCommand::ToggleOpen,
        "enlarge" | "expand" => ChatCommand::ToggleEnlarged,
        "transcript" | "history" => ChatCommand::ShowTranscript,
        "status" | "stats" => ChatCommand::Status,
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        digits if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) => {
            parse_suggestion(digits)
        }
        _ => ChatCommand::Invalid(format!("Unknown command: /{command}")),
    };

    Some(result)
}

fn parse_suggestion(arg: &str) -> ChatCommand {
    match arg.parse::<usize>() {
        Ok(n) if n >= 1 => ChatCommand::Suggest(n - 1),
        _ => ChatCommand::Invalid(format!(
            "/suggest expects a suggestion number starting at 1, got '{arg}'"
        )),
    }
}

/// Returns help text describing available commands.
pub fn help_text() -> &'static str {
    r#"Available commands:
  /reset                 Cancel any response and clear the conversation (alias /clear)
  /<n>, /suggest <n>     Ask suggested question number n
  /suggestions           List the suggested questions
  /open                  Toggle the widget open flag
  /enlarge               Toggle the widget enlarged flag
  /transcript            Show the conversation so far
  /status                Show the session state
  /help                  Show this help message
  /quit                  Exit the chat
Press Ctrl+C while a reply is streaming to cancel it and reset the conversation."#
}
