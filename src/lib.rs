//! Session-continuity layer for a real-time voice relay.
//!
//! Keeps one logical conversation alive between a telephone call leg and a
//! conversational AI backend whose streaming sessions are time-bounded: the
//! backend can end a session at any moment, and this crate transparently
//! replaces the connection, resumes the conversation with an opaque handle,
//! and replays caller audio captured during the gap — in order, with the
//! call itself untouched.
//!
//! Audio codec conversion, telephony call control, and credential
//! acquisition are the owner's concern; this crate consumes a configured
//! endpoint and bearer token and reports state faithfully.

pub mod config;
pub mod core;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::BackendConfig;
pub use core::relay::{
    BufferPolicy, CloseReason, ConnectionState, ReconnectNotice, ReconnectOutcome, RelayError,
    RelayResult, RestartPolicy, RestartTrigger, SessionOptions, VoiceRelay,
};
pub use utils::{EndpointError, validate_backend_endpoint};
