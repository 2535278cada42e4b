//! Replay buffer for caller audio captured while no connection is writable.
//!
//! While a reconnect is in flight, outbound frames are captured here and
//! replayed in order into the new connection before any live frame. The
//! buffer is bounded (frames beyond capacity are dropped, never blocked) and
//! time-boxed (a stuck reconnect must not grow memory without limit).

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

/// Sizing and timing limits for the replay buffer.
#[derive(Debug, Clone)]
pub struct BufferPolicy {
    /// Maximum captured frames; enqueues beyond this are dropped
    pub capacity: usize,

    /// How long the buffer may stay active before it is discarded
    pub max_hold: Duration,

    /// Minimum spacing between dropped-frame warnings
    pub drop_warn_interval: Duration,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            capacity: 500,
            max_hold: Duration::from_secs(10),
            drop_warn_interval: Duration::from_secs(5),
        }
    }
}

/// Bounded, time-boxed FIFO of outbound audio frames.
#[derive(Debug)]
pub(crate) struct ReplayBuffer {
    policy: BufferPolicy,
    frames: VecDeque<Bytes>,
    active_since: Option<Instant>,
    dropped: u64,
    last_drop_warn: Option<Instant>,
}

impl ReplayBuffer {
    pub fn new(policy: BufferPolicy) -> Self {
        Self {
            policy,
            frames: VecDeque::new(),
            active_since: None,
            dropped: 0,
            last_drop_warn: None,
        }
    }

    /// Begin capturing. Enqueues before activation are rejected.
    pub fn activate(&mut self, now: Instant) {
        if self.active_since.is_none() {
            self.active_since = Some(now);
            tracing::debug!("Replay buffer activated");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_since.is_some()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Total frames dropped over the buffer's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Append a frame while active. Returns `false` if the frame was not
    /// captured (inactive buffer or capacity reached). Never blocks.
    pub fn enqueue(&mut self, frame: Bytes, now: Instant) -> bool {
        if self.active_since.is_none() {
            return false;
        }
        if self.frames.len() >= self.policy.capacity {
            self.dropped += 1;
            let warn_due = self
                .last_drop_warn
                .is_none_or(|t| now.duration_since(t) >= self.policy.drop_warn_interval);
            if warn_due {
                tracing::warn!(
                    capacity = self.policy.capacity,
                    dropped = self.dropped,
                    "Replay buffer full, dropping caller audio"
                );
                self.last_drop_warn = Some(now);
            }
            return false;
        }
        self.frames.push_back(frame);
        true
    }

    /// Whether the safety hold has elapsed without a completed reconnection.
    pub fn expired(&self, now: Instant) -> bool {
        self.active_since
            .is_some_and(|since| now.duration_since(since) >= self.policy.max_hold)
    }

    /// Deactivate and return all captured frames in enqueue order.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.active_since = None;
        self.last_drop_warn = None;
        self.frames.drain(..).collect()
    }

    /// Deactivate and throw away everything. Returns the discarded count.
    pub fn discard(&mut self) -> usize {
        self.active_since = None;
        self.last_drop_warn = None;
        let discarded = self.frames.len();
        self.frames.clear();
        if discarded > 0 {
            tracing::warn!(discarded, "Replay buffer discarded");
        }
        discarded
    }
}
