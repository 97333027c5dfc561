//! Error types for the concierge session controller.
//!
//! Two layers live here.  [`Error`] is the rich error carried through the crate: it covers the
//! session's own rejections, contract violations inside the transcript, and every way the
//! generative-language transport can fail.  [`ErrorKind`] is the coarse projection that the
//! session records as `last_error` and that the view layer renders.

use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The user-visible classification of an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The submitted query was empty after trimming.
    EmptyQuery,
    /// A submission arrived while a turn was already in flight.
    SessionBusy,
    /// The transport failed before or during the stream.
    StreamInterrupted,
    /// A transcript mutation targeted a message that does not exist or is already terminal.
    NotFound,
    /// A transcript mutation would break the single-in-flight invariant.
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::EmptyQuery => "empty query",
            ErrorKind::SessionBusy => "session busy",
            ErrorKind::StreamInterrupted => "stream interrupted",
            ErrorKind::NotFound => "not found",
            ErrorKind::InvalidState => "invalid state",
        };
        f.write_str(name)
    }
}

/// The main error type for the concierge crate.
#[derive(Clone, Debug)]
pub enum Error {
    /// The query was empty or whitespace only.
    EmptyQuery,

    /// The session already has a turn in flight.
    SessionBusy,

    /// The response stream failed after it was admitted.
    StreamInterrupted {
        /// Human-readable error message.
        message: String,
        /// The transport error that ended the stream.
        source: Option<Arc<Error>>,
    },

    /// No message is available for the requested mutation.
    NotFound {
        /// Human-readable error message.
        message: String,
    },

    /// The mutation would violate a transcript invariant.
    InvalidState {
        /// Human-readable error message.
        message: String,
    },

    /// The stream was cancelled by a reset or teardown.
    Aborted {
        /// Human-readable error message.
        message: String,
    },

    /// The session driver has shut down.
    SessionClosed,

    /// The service returned an error response.
    Api {
        /// HTTP status code.
        status_code: u16,
        /// Status string reported by the service, e.g. `INVALID_ARGUMENT`.
        status: Option<String>,
        /// Human-readable error message.
        message: String,
    },

    /// The credential was missing or rejected.
    Authentication {
        /// Human-readable error message.
        message: String,
    },

    /// The credential lacks permission for the model.
    Permission {
        /// Human-readable error message.
        message: String,
    },

    /// Rate limit exceeded.
    RateLimit {
        /// Human-readable error message.
        message: String,
        /// Time to wait before retrying, in seconds.
        retry_after: Option<u64>,
    },

    /// The request or stream timed out.
    Timeout {
        /// Human-readable error message.
        message: String,
        /// Duration of the timeout in seconds.
        duration: Option<f64>,
    },

    /// Connection error.
    Connection {
        /// Human-readable error message.
        message: String,
        /// Underlying cause.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// The service is overloaded or unavailable.
    ServiceUnavailable {
        /// Human-readable error message.
        message: String,
        /// Time to wait before retrying, in seconds.
        retry_after: Option<u64>,
    },

    /// HTTP client error.
    HttpClient {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// Error during JSON or YAML serialization or deserialization.
    Serialization {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// A streaming error occurred below the chunk level.
    Streaming {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// Encoding/decoding error.
    Encoding {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// I/O error.
    Io {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Arc<io::Error>,
    },

    /// A URL parsing or manipulation error.
    Url {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<url::ParseError>,
    },

    /// Invalid caller input that is not a query, e.g. a suggestion index out of range.
    Validation {
        /// Human-readable error message.
        message: String,
        /// Parameter that failed validation.
        param: Option<String>,
    },

    /// Invalid or missing configuration.
    Configuration {
        /// Human-readable error message.
        message: String,
    },
}

impl Error {
    /// Creates a new stream-interrupted error wrapping the transport failure.
    pub fn stream_interrupted(message: impl Into<String>, source: Option<Error>) -> Self {
        Error::StreamInterrupted {
            message: message.into(),
            source: source.map(Arc::new),
        }
    }

    /// Creates a new not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            message: message.into(),
        }
    }

    /// Creates a new invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a new abort error.
    pub fn aborted(message: impl Into<String>) -> Self {
        Error::Aborted {
            message: message.into(),
        }
    }

    /// Creates a new API error.
    pub fn api(status_code: u16, status: Option<String>, message: impl Into<String>) -> Self {
        Error::Api {
            status_code,
            status,
            message: message.into(),
        }
    }

    /// Creates a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Error::Authentication {
            message: message.into(),
        }
    }

    /// Creates a new permission error.
    pub fn permission(message: impl Into<String>) -> Self {
        Error::Permission {
            message: message.into(),
        }
    }

    /// Creates a new rate limit error.
    pub fn rate_limit(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Error::RateLimit {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a new timeout error.
    pub fn timeout(message: impl Into<String>, duration: Option<f64>) -> Self {
        Error::Timeout {
            message: message.into(),
            duration,
        }
    }

    /// Creates a new connection error.
    pub fn connection(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Connection {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new service unavailable error.
    pub fn service_unavailable(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Error::ServiceUnavailable {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a new HTTP client error.
    pub fn http_client(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::HttpClient {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Serialization {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new streaming error.
    pub fn streaming(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Streaming {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new encoding error.
    pub fn encoding(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Encoding {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new I/O error.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            message: message.into(),
            source: Arc::new(source),
        }
    }

    /// Creates a new URL error.
    pub fn url(message: impl Into<String>, source: Option<url::ParseError>) -> Self {
        Error::Url {
            message: message.into(),
            source,
        }
    }

    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>, param: Option<String>) -> Self {
        Error::Validation {
            message: message.into(),
            param,
        }
    }

    /// Creates a new configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Projects this error onto the user-visible [`ErrorKind`].
    ///
    /// Everything that originates in the transport collapses to
    /// [`ErrorKind::StreamInterrupted`]: the session never distinguishes a refused connection
    /// from a stream that died halfway.  Errors raised by the session itself, such as
    /// cancellation or a bad suggestion index, are [`ErrorKind::InvalidState`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::EmptyQuery => ErrorKind::EmptyQuery,
            Error::SessionBusy => ErrorKind::SessionBusy,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::InvalidState { .. }
            | Error::Aborted { .. }
            | Error::SessionClosed
            | Error::Validation { .. }
            | Error::Configuration { .. } => ErrorKind::InvalidState,
            Error::StreamInterrupted { .. }
            | Error::Api { .. }
            | Error::Authentication { .. }
            | Error::Permission { .. }
            | Error::RateLimit { .. }
            | Error::Timeout { .. }
            | Error::Connection { .. }
            | Error::ServiceUnavailable { .. }
            | Error::HttpClient { .. }
            | Error::Serialization { .. }
            | Error::Streaming { .. }
            | Error::Encoding { .. }
            | Error::Io { .. }
            | Error::Url { .. } => ErrorKind::StreamInterrupted,
        }
    }

    /// Returns true if this is an empty-query rejection.
    pub fn is_empty_query(&self) -> bool {
        matches!(self, Error::EmptyQuery)
    }

    /// Returns true if this is a busy-session rejection.
    pub fn is_session_busy(&self) -> bool {
        matches!(self, Error::SessionBusy)
    }

    /// Returns true if the stream was interrupted.
    pub fn is_stream_interrupted(&self) -> bool {
        matches!(self, Error::StreamInterrupted { .. })
    }

    /// Returns true if the stream was cancelled.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted { .. })
    }

    /// Returns true if this error is related to authentication.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::Authentication { .. })
    }

    /// Returns true if this error is related to rate limiting.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimit { .. })
    }

    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Returns true if this error is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Returns true if this error is a transcript contract violation.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::InvalidState { .. })
    }

    /// Returns the status code associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Api { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EmptyQuery => write!(f, "Empty query"),
            Error::SessionBusy => write!(f, "Session busy: a response is still streaming"),
            Error::StreamInterrupted { message, source } => {
                if let Some(source) = source {
                    write!(f, "Stream interrupted: {message}: {source}")
                } else {
                    write!(f, "Stream interrupted: {message}")
                }
            }
            Error::NotFound { message } => write!(f, "Not found: {message}"),
            Error::InvalidState { message } => write!(f, "Invalid state: {message}"),
            Error::Aborted { message } => write!(f, "Aborted: {message}"),
            Error::SessionClosed => write!(f, "Session closed"),
            Error::Api {
                status_code,
                status,
                message,
            } => {
                if let Some(status) = status {
                    write!(f, "API error {status_code} ({status}): {message}")
                } else {
                    write!(f, "API error {status_code}: {message}")
                }
            }
            Error::Authentication { message } => write!(f, "Authentication error: {message}"),
            Error::Permission { message } => write!(f, "Permission error: {message}"),
            Error::RateLimit {
                message,
                retry_after,
            } => {
                if let Some(retry_after) = retry_after {
                    write!(
                        f,
                        "Rate limit exceeded: {message} (retry after {retry_after} seconds)"
                    )
                } else {
                    write!(f, "Rate limit exceeded: {message}")
                }
            }
            Error::Timeout { message, duration } => {
                if let Some(duration) = duration {
                    write!(f, "Timeout error: {message} ({duration} seconds)")
                } else {
                    write!(f, "Timeout error: {message}")
                }
            }
            Error::Connection { message, .. } => write!(f, "Connection error: {message}"),
            Error::ServiceUnavailable {
                message,
                retry_after,
            } => {
                if let Some(retry_after) = retry_after {
                    write!(
                        f,
                        "Service unavailable: {message} (retry after {retry_after} seconds)"
                    )
                } else {
                    write!(f, "Service unavailable: {message}")
                }
            }
            Error::HttpClient { message, .. } => write!(f, "HTTP client error: {message}"),
            Error::Serialization { message, .. } => write!(f, "Serialization error: {message}"),
            Error::Streaming { message, .. } => write!(f, "Streaming error: {message}"),
            Error::Encoding { message, .. } => write!(f, "Encoding error: {message}"),
            Error::Io { message, .. } => write!(f, "I/O error: {message}"),
            Error::Url { message, .. } => write!(f, "URL error: {message}"),
            Error::Validation { message, param } => {
                if let Some(param) = param {
                    write!(f, "Validation error: {message} (parameter: {param})")
                } else {
                    write!(f, "Validation error: {message}")
                }
            }
            Error::Configuration { message } => write!(f, "Configuration error: {message}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::StreamInterrupted { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Connection { source, .. }
            | Error::HttpClient { source, .. }
            | Error::Serialization { source, .. }
            | Error::Streaming { source, .. }
            | Error::Encoding { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Io { source, .. } => Some(source),
            Error::Url { source, .. } => {
                source.as_ref().map(|e| e as &(dyn error::Error + 'static))
            }
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err.to_string(), err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(format!("JSON error: {err}"), Some(Box::new(err)))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::serialization(format!("YAML error: {err}"), Some(Box::new(err)))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::url(format!("URL parse error: {err}"), Some(err))
    }
}

impl From<Utf8Error> for Error {
    fn from(err: Utf8Error) -> Self {
        Error::encoding(format!("UTF-8 error: {err}"), Some(Box::new(err)))
    }
}

/// A specialized Result type for concierge operations.
pub type Result<T> = std::result::Result<T, Error>;
