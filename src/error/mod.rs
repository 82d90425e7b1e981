//! Error types for the live view protocol, the diff engine and the session store.

use thiserror::Error;

/// Error type returned by application handlers (mount, render, events, params).
///
/// Boxed so handlers can propagate any error with `?` or build one from a string
/// with `.into()`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Session store errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Stored session data could not be verified or decoded.
    #[error("Session corrupted: {0}")]
    Corrupt(String),

    #[error("Session could not be encoded: {0}")]
    Encode(String),
}

impl SessionError {
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}

/// Lifecycle phase a handler error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Mount,
    Params,
    Render,
    Event,
    Unmount,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Mount => "mount",
            Phase::Params => "params",
            Phase::Render => "render",
            Phase::Event => "event",
            Phase::Unmount => "unmount",
        };
        f.write_str(name)
    }
}

/// A unified error type for the live view runtime.
#[derive(Debug, Error)]
pub enum LiveError {
    /// No handler is registered for an event name. Never fatal.
    #[error("No event handler for '{0}'")]
    NoEventHandler(String),

    #[error("No render handler configured")]
    NoRenderer,

    /// An application handler returned an error.
    #[error("{phase} handler error: {source}")]
    Handler {
        phase: Phase,
        #[source]
        source: HandlerError,
    },

    #[error("Session corrupted: {0}")]
    SessionCorrupted(#[source] SessionError),

    #[error("Session error: {0}")]
    Session(#[source] SessionError),

    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("Timed out writing to socket")]
    WriteTimeout,

    #[error("Socket too slow to keep up with messages")]
    TooSlow,

    #[error("Socket outbound queue closed")]
    SendClosed,

    #[error("Patch cannot be applied: {0}")]
    Patch(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl LiveError {
    pub fn handler(phase: Phase, source: HandlerError) -> Self {
        Self::Handler { phase, source }
    }

    pub fn patch(message: impl Into<String>) -> Self {
        Self::Patch(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Missing handlers are logged and swallowed rather than reported.
    pub fn is_no_handler(&self) -> bool {
        matches!(self, Self::NoEventHandler(_))
    }

    /// Errors that end a connection with a policy violation close code.
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Self::TooSlow | Self::WriteTimeout)
    }
}

impl From<SessionError> for LiveError {
    fn from(err: SessionError) -> Self {
        if err.is_corrupt() {
            Self::SessionCorrupted(err)
        } else {
            Self::Session(err)
        }
    }
}
