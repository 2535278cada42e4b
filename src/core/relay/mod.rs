//! Session-continuity relay between a telephone call leg and a real-time
//! conversational backend.
//!
//! The backend bounds how long one streaming session may live and can signal
//! mid-stream that the current session is expiring. This module keeps the
//! conversation up across those boundaries: it re-establishes the session
//! with an opaque resumption handle, captures caller audio during the gap,
//! and replays it in order — the caller hears no interruption.
//!
//! # Architecture
//!
//! - [`VoiceRelay`] — the public API: send audio/text, register callbacks
//! - one session actor owning all mutable session state
//! - one physical connection at a time, epoch-tagged so a superseded
//!   connection can never deliver audio late
//! - a bounded, time-boxed replay buffer for the reconnect gap
//! - a periodic restart check that refreshes the session before the backend
//!   kills it, preferring moments of silence
//!
//! # Example
//!
//! ```rust,ignore
//! use voxbridge_relay::{BackendConfig, SessionOptions, VoiceRelay};
//! use std::sync::Arc;
//!
//! let backend = BackendConfig::from_env()?;
//! let mut relay = VoiceRelay::new(backend, SessionOptions {
//!     caller_id: "+15550100".to_string(),
//!     ..Default::default()
//! })?;
//! relay.on_audio(Arc::new(|audio| Box::pin(async move { /* play */ })))?;
//! relay.connect().await?;
//! ```

mod base;
mod buffer;
mod client;
mod connection;
mod messages;
mod session;

pub use base::{
    AudioCallback, CloseReason, ClosedCallback, ConnectionState, ErrorCallback, InterruptCallback,
    ReconnectNotice, ReconnectOutcome, ReconnectedCallback, ReconnectingCallback, RelayError,
    RelayResult, RestartTrigger, SessionOptions, TextCallback,
};
pub use buffer::BufferPolicy;
pub use client::VoiceRelay;
pub use messages::{
    ClientEvent, FATAL_ERROR_KIND, InboundFrame, ServerEvent, SetupParams, decode_binary,
    decode_text,
};
pub use session::{RestartKind, RestartPolicy};
