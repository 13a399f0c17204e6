//! Error types shared across the askline client.
//!
//! `AskError` is the only error that reaches callers. Frame decode and answer
//! extraction failures have their own types but are logged and absorbed where
//! they occur.

use thiserror::Error;

/// Failure of a query attempt. The `Display` form is a single line suitable
/// for printing straight to the terminal.
#[derive(Debug, Error)]
pub enum AskError {
    /// The long-polling handshake failed or returned no usable `sid`.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The anonymous authentication exchange was rejected.
    #[error("failed to authenticate anonymous user: {0}")]
    Auth(String),

    /// A duplex channel was requested for a session that never authenticated.
    #[error("session {0} is not authenticated")]
    NotAuthenticated(String),

    /// The WebSocket connection could not be established.
    #[error("websocket connection failed: {0}")]
    Connect(String),

    /// The upgrade did not finish within the connect budget.
    #[error("websocket connection timeout after {attempts} attempts")]
    ConnectTimeout { attempts: u32 },

    /// The channel task has already exited.
    #[error("channel is closed")]
    ChannelClosed,

    /// Another query is still in flight on this channel.
    #[error("a query is already in flight on this channel")]
    QueryInFlight,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AskError>;

/// A raw transport message that could not be turned into a [`Frame`].
///
/// [`Frame`]: crate::protocol::Frame
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,

    #[error("unknown frame prefix {0:?}")]
    UnknownPrefix(String),

    #[error("invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected payload shape: {0}")]
    Shape(&'static str),
}

/// Why a candidate fragment did not yield an answer.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("steps field is not a JSON array: {0}")]
    Steps(String),

    #[error("step is not an object")]
    StepShape,

    #[error("no FINAL step with content")]
    NoFinalStep,
}
