//! Base types for the voice relay: errors, connection states, session
//! options, and callback signatures.
//!
//! The relay maintains one logical conversation (a `Session`) across any
//! number of physical WebSocket connections to the conversational backend.
//! Everything the telephony side observes — audio, text, interruptions,
//! reconnect progress, terminal closes — arrives through the callback types
//! defined here.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Connection to the backend failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connect handshake did not complete within the budget
    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Operation requires a live connection
    #[error("Not connected")]
    NotConnected,

    /// Unparseable or malformed control message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error reported by the backend
    #[error("Backend error {kind}: {detail}")]
    Backend {
        /// Backend-assigned error kind
        kind: String,
        /// Human-readable detail
        detail: String,
    },

    /// The bounded reconnect budget was exceeded
    #[error("Reconnect attempts exhausted ({0})")]
    ReconnectExhausted(u32),

    /// The session has already closed terminally
    #[error("Session closed")]
    SessionClosed,
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of a session.
///
/// `Closed` is terminal. `Reconnecting` returns to `Active` on success or
/// falls to `Closed` when the retry budget is exhausted or a reconnect open
/// fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection has been opened yet
    #[default]
    Idle,
    /// Initial connection in progress
    Connecting,
    /// Connected and streaming
    Active,
    /// Replacing the physical connection while the session stays up
    Reconnecting,
    /// Terminally closed
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Active => write!(f, "Active"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

// =============================================================================
// Session Options
// =============================================================================

/// Per-session options supplied by the telephony side.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Caller identity passed to the backend at setup
    pub caller_id: String,

    /// Session mode (e.g. "conversation")
    pub mode: String,

    /// Voice profile for synthesized output
    pub voice: Option<String>,

    /// Reference to a scheduled call, when this session belongs to one
    pub scheduled_call_ref: Option<String>,

    /// Ceiling for backend-signaled reconnect attempts.
    /// Used when a reconnect signal does not carry its own ceiling.
    pub max_reconnect_attempts: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            caller_id: String::new(),
            mode: "conversation".to_string(),
            voice: None,
            scheduled_call_ref: None,
            max_reconnect_attempts: 3,
        }
    }
}

// =============================================================================
// Reconnect Notices
// =============================================================================

/// What initiated a connection replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartTrigger {
    /// The backend signaled that the current session is expiring
    Backend,
    /// The relay restarted ahead of the backend's session lifetime
    Proactive,
}

impl fmt::Display for RestartTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartTrigger::Backend => write!(f, "backend"),
            RestartTrigger::Proactive => write!(f, "proactive"),
        }
    }
}

/// Details delivered when a reconnect begins.
#[derive(Debug, Clone)]
pub struct ReconnectNotice {
    /// What initiated the reconnect
    pub trigger: RestartTrigger,
    /// Backend-assigned attempt count at the time of the restart
    pub attempt: u32,
    /// Whether a resumption handle will be presented on reopen
    pub resuming: bool,
}

/// Details delivered when a reconnect completes successfully.
#[derive(Debug, Clone)]
pub struct ReconnectOutcome {
    /// Attempt number that succeeded
    pub attempt: u32,
    /// Frames captured during the gap and replayed in order
    pub flushed_frames: usize,
}

/// Why the session reached its terminal state.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// The owner requested a graceful close
    LocalClose,
    /// The backend ended the session
    BackendTerminated {
        /// Backend-supplied reason
        reason: String,
        /// Optional detail
        detail: Option<String>,
    },
    /// A reconnect signal exceeded the attempt ceiling
    RetriesExhausted {
        /// Attempt number from the signal
        attempt: u32,
        /// Ceiling in force
        max_attempts: u32,
    },
    /// The transport dropped with no reconnect pending
    ConnectionLost {
        /// Transport-level detail
        detail: String,
    },
    /// Reopening during a reconnect failed; reconnect opens are not retried
    ReconnectFailed {
        /// Failure detail
        detail: String,
    },
    /// The backend reported the fatal error kind; reconnection is disabled
    FatalBackendError {
        /// Backend error kind
        kind: String,
        /// Optional detail
        detail: Option<String>,
    },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::LocalClose => write!(f, "local close"),
            CloseReason::BackendTerminated { reason, .. } => {
                write!(f, "backend terminated: {reason}")
            }
            CloseReason::RetriesExhausted {
                attempt,
                max_attempts,
            } => write!(f, "retries exhausted ({attempt}/{max_attempts})"),
            CloseReason::ConnectionLost { detail } => write!(f, "connection lost: {detail}"),
            CloseReason::ReconnectFailed { detail } => write!(f, "reconnect failed: {detail}"),
            CloseReason::FatalBackendError { kind, .. } => {
                write!(f, "fatal backend error: {kind}")
            }
        }
    }
}

// =============================================================================
// Callback Types
// =============================================================================

/// Callback type for inbound backend audio.
pub type AudioCallback =
    Arc<dyn Fn(Bytes) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for inbound backend text.
pub type TextCallback =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for barge-in: caller speech detected while the backend is
/// speaking; playback must be interrupted immediately.
pub type InterruptCallback =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type invoked when a reconnect begins.
pub type ReconnectingCallback =
    Arc<dyn Fn(ReconnectNotice) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type invoked when a reconnect completes.
pub type ReconnectedCallback =
    Arc<dyn Fn(ReconnectOutcome) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for surfaced errors.
pub type ErrorCallback =
    Arc<dyn Fn(RelayError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for the terminal close.
pub type ClosedCallback =
    Arc<dyn Fn(CloseReason) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
