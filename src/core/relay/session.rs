//! The session record: one logical conversation that outlives any number of
//! physical connections.
//!
//! Every state change funnels through [`Session::transition`], and at most
//! one [`ReconnectContext`] exists at a time, so "at most one reconnect in
//! flight" is enforced by construction rather than by convention.

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use super::base::{ConnectionState, RestartTrigger, SessionOptions};
use super::buffer::{BufferPolicy, ReplayBuffer};

// =============================================================================
// Proactive Restart Policy
// =============================================================================

/// Thresholds for restarting a connection before the backend's own session
/// lifetime ends it.
///
/// Two thresholds, deliberately: prefer restarting during silence (soft age
/// plus a short quiet window), but never let age alone pass the hard
/// ceiling, even mid-speech.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// How often the policy is evaluated
    pub check_interval: Duration,

    /// Age after which a restart fires during silence
    pub soft_age: Duration,

    /// Age after which a restart fires unconditionally
    pub hard_age: Duration,

    /// Quiet time required for a soft-age restart
    pub silence_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            soft_age: Duration::from_secs(7 * 60),
            hard_age: Duration::from_secs(9 * 60),
            silence_window: Duration::from_secs(2),
        }
    }
}

/// How urgent a due restart is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
    /// Soft threshold passed and the line is quiet
    Opportunistic,
    /// Hard threshold passed; restart regardless of activity
    Forced,
}

// =============================================================================
// Reconnect Context
// =============================================================================

/// The single in-flight reconnect record.
#[derive(Debug, Clone)]
pub(crate) struct ReconnectContext {
    /// Handle to present on reopen
    pub handle: Option<String>,
    /// Attempt number (backend-signaled; 0 for proactive restarts)
    pub attempt: u32,
    /// Ceiling in force for this reconnect
    pub max_attempts: u32,
    /// Silent-interval count to replay in the handshake
    pub silent_streak: u32,
    /// What initiated the reconnect
    pub trigger: RestartTrigger,
    /// Set once the superseded transport is confirmed gone
    pub close_confirmed: bool,
}

// =============================================================================
// Session
// =============================================================================

/// One logical conversation between a telephone call leg and the backend.
#[derive(Debug)]
pub(crate) struct Session {
    /// Stable id for logs and the owner
    pub session_id: String,
    /// Immutable per-session options
    pub options: SessionOptions,

    pub state: ConnectionState,

    /// Most recently observed resumption handle; last value wins
    pub resume_handle: Option<String>,
    /// The in-flight reconnect, if any
    pub reconnect: Option<ReconnectContext>,
    /// Set by the fatal backend error kind; no further reconnects
    pub reconnects_disabled: bool,
    /// Attempt number of the last backend-signaled reconnect
    pub last_attempt: u32,

    /// When the current connection opened
    pub connected_at: Option<Instant>,
    /// Last audio activity, either direction
    pub last_audio_at: Option<Instant>,
    /// Consecutive quiet check intervals, carried across reconnects
    pub silent_streak: u32,

    pub buffer: ReplayBuffer,
}

impl Session {
    pub fn new(options: SessionOptions, buffering: BufferPolicy) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            options,
            state: ConnectionState::Idle,
            resume_handle: None,
            reconnect: None,
            reconnects_disabled: false,
            last_attempt: 0,
            connected_at: None,
            last_audio_at: None,
            silent_streak: 0,
            buffer: ReplayBuffer::new(buffering),
        }
    }

    /// Apply a state change. Returns whether the state actually changed.
    ///
    /// Illegal transitions are refused and logged. `Closed` absorbs
    /// everything, including repeated closes.
    pub fn transition(&mut self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        if self.state == Closed {
            return false;
        }
        let legal = matches!(
            (self.state, to),
            (Idle, Connecting)
                | (Connecting, Active)
                | (Active, Reconnecting)
                | (Reconnecting, Active)
                | (_, Closed)
        );
        if !legal {
            tracing::error!(
                session_id = %self.session_id,
                from = %self.state,
                to = %to,
                "Refusing illegal state transition"
            );
            return false;
        }
        tracing::debug!(session_id = %self.session_id, from = %self.state, to = %to, "State transition");
        self.state = to;
        true
    }

    /// Arm a reconnect. Only legal from `Active`, and only when none is
    /// already in flight; this is where single-flight is enforced.
    pub fn begin_reconnect(&mut self, ctx: ReconnectContext) -> bool {
        if self.reconnect.is_some() || !self.transition(ConnectionState::Reconnecting) {
            return false;
        }
        self.last_attempt = ctx.attempt;
        self.reconnect = Some(ctx);
        true
    }

    /// Mark a successful reopen: back to `Active` with a fresh clock.
    pub fn complete_reconnect(&mut self, now: Instant) {
        self.reconnect = None;
        self.transition(ConnectionState::Active);
        self.connected_at = Some(now);
        self.last_audio_at = Some(now);
    }

    /// Record fresh audio activity in either direction.
    pub fn note_audio(&mut self, now: Instant) {
        self.last_audio_at = Some(now);
        self.silent_streak = 0;
    }

    /// Record a periodic check interval that saw no audio.
    pub fn note_silent_interval(&mut self) {
        self.silent_streak = self.silent_streak.saturating_add(1);
    }

    /// Whether the periodic check saw audio since the last tick.
    pub fn quiet_since(&self, now: Instant, window: Duration) -> bool {
        match self.last_audio_at {
            Some(at) => now.duration_since(at) >= window,
            None => true,
        }
    }

    /// Evaluate the proactive restart policy.
    ///
    /// Never fires before a resumption handle has been observed (nothing to
    /// resume with), outside `Active`, or while a reconnect is in flight.
    pub fn restart_due(&self, now: Instant, policy: &RestartPolicy) -> Option<RestartKind> {
        if self.state != ConnectionState::Active
            || self.reconnect.is_some()
            || self.reconnects_disabled
            || self.resume_handle.is_none()
        {
            return None;
        }
        let age = now.duration_since(self.connected_at?);
        if age >= policy.hard_age {
            return Some(RestartKind::Forced);
        }
        if age >= policy.soft_age && self.quiet_since(now, policy.silence_window) {
            return Some(RestartKind::Opportunistic);
        }
        None
    }
}
