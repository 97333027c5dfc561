//! Configuration for the assistant.
//!
//! [`AssistantArgs`] is parsed from the command line via `arrrg`; [`AssistantConfig`] holds the
//! resolved values with defaults applied.  The API key is deliberately absent from both: it is
//! read from the environment by the transport and never travels with the configuration.

use std::time::Duration;

use arrrg_derive::CommandLine;
use utf8path::Path;

use crate::error::Result;
use crate::preamble::Preamble;
use crate::session::{DEFAULT_SNAPSHOT_CAPACITY, SessionOptions};
use crate::transport::{DEFAULT_API_URL, DEFAULT_MODEL};

/// Default time allowed for one streaming call, from request to last chunk.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Command-line arguments for the concierge-chat tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct AssistantArgs {
    /// Model to use.
    #[arrrg(optional, "Model to use (default: gemini-1.5-flash-latest)", "MODEL")]
    pub model: Option<String>,

    /// YAML file with the preamble.
    #[arrrg(optional, "YAML preamble file (default: built-in VCNR assistant)", "FILE")]
    pub preamble: Option<String>,

    /// Base URL of the service.
    #[arrrg(optional, "Service base URL", "URL")]
    pub base_url: Option<String>,

    /// Timeout for one streaming call in seconds; zero disables it.
    #[arrrg(optional, "Stream timeout in seconds, 0 for none (default: 60)", "SECS")]
    pub timeout_secs: Option<u64>,

    /// Answer from a canned script instead of the service.
    #[arrrg(flag, "Run offline with a scripted transport")]
    pub offline: bool,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,
}

/// Resolved configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssistantConfig {
    /// Model used for completions.
    pub model: String,

    /// Base URL of the service; must end in `/`.
    pub base_url: String,

    /// Timeout for one streaming call.  `None` means the transport imposes none.
    pub timeout: Option<Duration>,

    /// Preamble file; `None` selects the built-in preamble.
    pub preamble_path: Option<String>,

    /// Use the scripted transport.
    pub offline: bool,

    /// Whether to use ANSI colors and styles in output.
    pub use_color: bool,

    /// Buffer size of the snapshot broadcast.
    pub snapshot_capacity: usize,
}

impl AssistantConfig {
    /// Creates a configuration with default values.
    ///
    /// Defaults:
    /// - Model: gemini-1.5-flash-latest
    /// - Timeout: 60 seconds
    /// - Preamble: built in
    /// - Color: enabled
    pub fn new() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_API_URL.to_string(),
            timeout: Some(DEFAULT_TIMEOUT),
            preamble_path: None,
            offline: false,
            use_color: true,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
        }
    }

    /// Sets the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the stream timeout; `None` disables it.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the preamble file.
    pub fn with_preamble_path(mut self, path: impl Into<String>) -> Self {
        self.preamble_path = Some(path.into());
        self
    }

    /// Selects the scripted transport.
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Disables ANSI color output.
    pub fn without_color(mut self) -> Self {
        self.use_color = false;
        self
    }

    /// Sets the snapshot buffer size.
    pub fn with_snapshot_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_capacity = capacity;
        self
    }

    /// Loads the configured preamble, or the built-in one.
    pub fn load_preamble(&self) -> Result<Preamble> {
        match &self.preamble_path {
            Some(path) => Preamble::from_file(&Path::from(path.as_str())),
            None => Ok(Preamble::default()),
        }
    }

    /// Channel sizing for a session.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::default().with_snapshot_capacity(self.snapshot_capacity)
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl From<AssistantArgs> for AssistantConfig {
    fn from(args: AssistantArgs) -> Self {
        let defaults = AssistantConfig::new();
        let timeout = match args.timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.timeout,
        };
        AssistantConfig {
            model: args.model.unwrap_or(defaults.model),
            base_url: args.base_url.unwrap_or(defaults.base_url),
            timeout,
            preamble_path: args.preamble,
            offline: args.offline,
            use_color: !args.no_color,
            snapshot_capacity: defaults.snapshot_capacity,
        }
    }
}
