//! A streaming conversational session controller.
//!
//! A session sends each user query, together with a fixed preamble, to a generative-language
//! service and folds the streamed answer into a transcript that stays consistent under
//! streaming, concurrent submissions, resets, and failures.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use concierge::{GeminiTransport, Preamble, SessionOptions, spawn_session};
//!
//! # async fn demo() -> concierge::Result<()> {
//! let transport = Arc::new(GeminiTransport::new(None)?);
//! let session = spawn_session(transport, Arc::new(Preamble::default()), SessionOptions::default());
//! session.submit("What are VCNR's four core businesses?").await?;
//! let mut updates = session.watch();
//! let snapshot = updates
//!     .wait_for(|s| !s.in_flight)
//!     .await
//!     .map_err(|_| concierge::Error::SessionClosed)?
//!     .clone();
//! println!("{}", snapshot.transcript[1].content);
//! # Ok(())
//! # }
//! ```

// Public modules
pub mod accumulator;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod observability;
pub mod preamble;
pub mod render;
pub mod session;
pub mod sse;
pub mod transcript;
pub mod transport;

// Re-exports
pub use accumulator::{DeltaSink, ResponseAccumulator};
pub use config::{AssistantArgs, AssistantConfig};
pub use coordinator::{
    APOLOGY, Coordinator, NOTIFICATION_TEXT, Notification, Phase, Presentation, SessionSnapshot,
    Turn, TurnId,
};
pub use error::{Error, ErrorKind, Result};
pub use observability::register_biometrics;
pub use preamble::{Preamble, PreambleProvider};
pub use session::{SessionHandle, SessionOptions, spawn_session};
pub use transcript::{Message, MessageDraft, MessageId, MessageStatus, Sender, Transcript};
pub use transport::{ChunkStream, GeminiTransport, ScriptedTransport, Transport};
