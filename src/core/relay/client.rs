//! The public relay API and the session actor.
//!
//! [`VoiceRelay`] is what the telephony side holds: `send_audio`,
//! `send_text`, `close`, and callback registration. Behind it, a single
//! actor task owns the [`Session`] record and is the only writer of its
//! state — commands from the owner, events from the current connection, the
//! periodic restart check, and the reconnect backoff all funnel into one
//! `select!` loop. That single-writer shape is what makes "at most one
//! reconnect in flight" and "no frame both buffered and forwarded live" hold
//! without scattered guard flags.
//!
//! # Session continuity
//!
//! The backend bounds session lifetime and can demand a replacement
//! mid-stream. Either that signal or the local restart policy arms the
//! replay buffer, closes the current transport, waits for the close to be
//! confirmed, backs off briefly, and reopens with the freshest resumption
//! handle. Caller audio sent during the gap is captured and replayed in
//! order before anything newer. The telephone call itself never drops from
//! here; terminal states are only reported.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::prelude::*;
use bytes::Bytes;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep, interval, sleep};

use crate::config::BackendConfig;

use super::base::{
    AudioCallback, ClosedCallback, CloseReason, ConnectionState, ErrorCallback, InterruptCallback,
    ReconnectedCallback, ReconnectingCallback, ReconnectNotice, ReconnectOutcome, RelayError,
    RelayResult, RestartTrigger, SessionOptions, TextCallback,
};
use super::connection::{ConnEvent, Connection};
use super::messages::{ClientEvent, FATAL_ERROR_KIND, InboundFrame, ServerEvent, SetupParams};
use super::session::{ReconnectContext, Session};

/// Capacity for owner commands.
const CMD_CHANNEL_CAPACITY: usize = 256;

/// Capacity for connection events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Commands
// =============================================================================

enum Command {
    SendAudio(Bytes),
    SendText(String),
    Close,
}

// =============================================================================
// Callbacks
// =============================================================================

/// Registered callbacks, shared between the public handle and the actor.
#[derive(Clone, Default)]
struct CallbackSet {
    audio: Arc<Mutex<Option<AudioCallback>>>,
    text: Arc<Mutex<Option<TextCallback>>>,
    interrupt: Arc<Mutex<Option<InterruptCallback>>>,
    reconnecting: Arc<Mutex<Option<ReconnectingCallback>>>,
    reconnected: Arc<Mutex<Option<ReconnectedCallback>>>,
    error: Arc<Mutex<Option<ErrorCallback>>>,
    closed: Arc<Mutex<Option<ClosedCallback>>>,
}

/// Store a callback without blocking. Registration is normally done before
/// `connect`, so the lock is free; if it is held, fall back to a spawn to
/// avoid deadlocking the caller.
fn set_slot<T: Send + 'static>(slot: &Arc<Mutex<Option<T>>>, value: T) {
    if let Ok(mut guard) = slot.try_lock() {
        *guard = Some(value);
    } else {
        let slot = slot.clone();
        tokio::spawn(async move {
            *slot.lock().await = Some(value);
        });
    }
}

impl CallbackSet {
    async fn emit_audio(&self, data: Bytes) {
        if let Some(cb) = self.audio.lock().await.as_ref() {
            cb(data).await;
        }
    }

    async fn emit_text(&self, text: String) {
        if let Some(cb) = self.text.lock().await.as_ref() {
            cb(text).await;
        }
    }

    async fn emit_interrupt(&self) {
        if let Some(cb) = self.interrupt.lock().await.as_ref() {
            cb().await;
        }
    }

    async fn emit_reconnecting(&self, notice: ReconnectNotice) {
        if let Some(cb) = self.reconnecting.lock().await.as_ref() {
            cb(notice).await;
        }
    }

    async fn emit_reconnected(&self, outcome: ReconnectOutcome) {
        if let Some(cb) = self.reconnected.lock().await.as_ref() {
            cb(outcome).await;
        }
    }

    async fn emit_error(&self, error: RelayError) {
        if let Some(cb) = self.error.lock().await.as_ref() {
            cb(error).await;
        }
    }

    async fn emit_closed(&self, reason: CloseReason) {
        if let Some(cb) = self.closed.lock().await.as_ref() {
            cb(reason).await;
        }
    }
}

// =============================================================================
// Public Relay Handle
// =============================================================================

/// Relay between one telephone call leg and the conversational backend.
///
/// # Example
///
/// ```rust,ignore
/// use voxbridge_relay::{BackendConfig, SessionOptions, VoiceRelay};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let backend = BackendConfig::from_env()?;
///     let options = SessionOptions {
///         caller_id: "+15550100".to_string(),
///         ..Default::default()
///     };
///
///     let mut relay = VoiceRelay::new(backend, options)?;
///     relay.on_audio(Arc::new(|audio| Box::pin(async move {
///         // play to the caller
///     })))?;
///     relay.connect().await?;
///     relay.send_audio(caller_frame).await?;
///     Ok(())
/// }
/// ```
pub struct VoiceRelay {
    backend: BackendConfig,
    /// Present until `connect` hands it to the actor
    session: Option<Session>,
    session_id: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Fast writable check, shared with the actor
    connected: Arc<AtomicBool>,
    cmd_tx: Arc<Mutex<Option<mpsc::Sender<Command>>>>,
    callbacks: CallbackSet,
    actor_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl VoiceRelay {
    /// Create a relay for one call. Validates configuration; no I/O.
    pub fn new(backend: BackendConfig, options: SessionOptions) -> RelayResult<Self> {
        backend.validate()?;
        if options.caller_id.is_empty() {
            return Err(RelayError::InvalidConfiguration(
                "caller_id is required".to_string(),
            ));
        }
        let session = Session::new(options, backend.buffering.clone());
        let session_id = session.session_id.clone();
        Ok(Self {
            backend,
            session: Some(session),
            session_id,
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
            connected: Arc::new(AtomicBool::new(false)),
            cmd_tx: Arc::new(Mutex::new(None)),
            callbacks: CallbackSet::default(),
            actor_handle: Arc::new(Mutex::new(None)),
        })
    }

    /// Stable session id, assigned at construction.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Whether a frame written now would go out live.
    pub fn is_active(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Open the first connection. Resolves once the backend reports ready;
    /// an initial open failure is terminal for the session.
    pub async fn connect(&mut self) -> RelayResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut session = self.session.take().ok_or(RelayError::SessionClosed)?;
        session.transition(ConnectionState::Connecting);
        *self.state.write().await = ConnectionState::Connecting;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let epoch = 1;
        let setup = setup_params(&session.options, None, None);

        match Connection::open(
            &self.backend.endpoint,
            &self.backend.api_key,
            setup,
            epoch,
            event_tx.clone(),
            self.backend.open_timeout,
        )
        .await
        {
            Ok(conn) => {
                let now = Instant::now();
                session.transition(ConnectionState::Active);
                session.connected_at = Some(now);
                session.last_audio_at = Some(now);
                // A fresh session open (no resume pending) resets retry
                // bookkeeping.
                session.last_attempt = 0;
                *self.state.write().await = ConnectionState::Active;
                self.connected.store(true, Ordering::SeqCst);

                let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
                *self.cmd_tx.lock().await = Some(cmd_tx);

                let actor = SessionActor {
                    backend: self.backend.clone(),
                    session,
                    conn: Some(conn),
                    epoch,
                    event_tx,
                    event_rx,
                    cmd_rx,
                    callbacks: self.callbacks.clone(),
                    state: self.state.clone(),
                    connected: self.connected.clone(),
                };
                *self.actor_handle.lock().await = Some(tokio::spawn(actor.run()));
                Ok(())
            }
            Err(e) => {
                session.transition(ConnectionState::Closed);
                *self.state.write().await = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    /// Send one caller audio frame. Non-blocking from the caller's
    /// perspective; while a reconnect is in flight the frame is captured and
    /// replayed in order.
    pub async fn send_audio(&self, data: Bytes) -> RelayResult<()> {
        self.send_command(Command::SendAudio(data)).await
    }

    /// Send a text hint into the conversation. Text is never buffered; it is
    /// written live or dropped.
    pub async fn send_text(&self, text: &str) -> RelayResult<()> {
        self.send_command(Command::SendText(text.to_string())).await
    }

    /// Request a graceful close. Idempotent; safe to call from any state,
    /// repeatedly, or while a reconnect is in flight.
    pub async fn close(&self) -> RelayResult<()> {
        let tx = self.cmd_tx.lock().await.clone();
        if let Some(tx) = tx {
            // A send failure means the actor already shut down.
            let _ = tx.send(Command::Close).await;
        }
        Ok(())
    }

    async fn send_command(&self, cmd: Command) -> RelayResult<()> {
        let guard = self.cmd_tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx.send(cmd).await.map_err(|_| RelayError::SessionClosed),
            None => {
                if *self.state.read().await == ConnectionState::Closed {
                    Err(RelayError::SessionClosed)
                } else {
                    Err(RelayError::NotConnected)
                }
            }
        }
    }

    /// Register a callback for inbound backend audio.
    pub fn on_audio(&self, callback: AudioCallback) -> RelayResult<()> {
        set_slot(&self.callbacks.audio, callback);
        Ok(())
    }

    /// Register a callback for inbound backend text.
    pub fn on_text(&self, callback: TextCallback) -> RelayResult<()> {
        set_slot(&self.callbacks.text, callback);
        Ok(())
    }

    /// Register a callback for barge-in. Invoked immediately, independent of
    /// any buffering.
    pub fn on_interrupt(&self, callback: InterruptCallback) -> RelayResult<()> {
        set_slot(&self.callbacks.interrupt, callback);
        Ok(())
    }

    /// Register a callback invoked when a reconnect begins.
    pub fn on_reconnecting(&self, callback: ReconnectingCallback) -> RelayResult<()> {
        set_slot(&self.callbacks.reconnecting, callback);
        Ok(())
    }

    /// Register a callback invoked when a reconnect completes.
    pub fn on_reconnected(&self, callback: ReconnectedCallback) -> RelayResult<()> {
        set_slot(&self.callbacks.reconnected, callback);
        Ok(())
    }

    /// Register a callback for surfaced errors.
    pub fn on_error(&self, callback: ErrorCallback) -> RelayResult<()> {
        set_slot(&self.callbacks.error, callback);
        Ok(())
    }

    /// Register a callback for the terminal close. Invoked exactly once.
    pub fn on_closed(&self, callback: ClosedCallback) -> RelayResult<()> {
        set_slot(&self.callbacks.closed, callback);
        Ok(())
    }
}

fn setup_params(
    options: &SessionOptions,
    resume_handle: Option<String>,
    silent_streak: Option<u32>,
) -> SetupParams {
    SetupParams {
        session_mode: options.mode.clone(),
        voice_profile: options.voice.clone(),
        caller_id: options.caller_id.clone(),
        scheduled_call_ref: options.scheduled_call_ref.clone(),
        // Only meaningful alongside a resume handle.
        silent_streak: resume_handle.as_ref().and(silent_streak),
        resume_handle,
    }
}

// =============================================================================
// Session Actor
// =============================================================================

type Backoff = Option<Pin<Box<Sleep>>>;

/// Waits for the armed backoff; parks forever while none is armed so the
/// select branch simply never fires.
async fn backoff_elapsed(slot: &mut Backoff) {
    match slot.as_mut() {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

struct SessionActor {
    backend: BackendConfig,
    session: Session,
    conn: Option<Connection>,
    /// Epoch of the current connection; events from older epochs are dropped
    epoch: u64,
    event_tx: mpsc::Sender<(u64, ConnEvent)>,
    event_rx: mpsc::Receiver<(u64, ConnEvent)>,
    cmd_rx: mpsc::Receiver<Command>,
    callbacks: CallbackSet,
    state: Arc<RwLock<ConnectionState>>,
    connected: Arc<AtomicBool>,
}

impl SessionActor {
    async fn run(mut self) {
        let mut tick = interval(self.backend.restart.check_interval);
        // The first tick fires immediately; consume it so checks start one
        // interval in.
        tick.tick().await;
        let mut backoff: Backoff = None;

        let close_reason = loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::SendAudio(data)) => self.handle_send_audio(data).await,
                    Some(Command::SendText(text)) => self.handle_send_text(text).await,
                    Some(Command::Close) | None => break CloseReason::LocalClose,
                },

                Some((epoch, event)) = self.event_rx.recv() => {
                    if epoch != self.epoch {
                        // A superseded connection must never reach the owner.
                        tracing::trace!(epoch, current = self.epoch, "Dropping stale connection event");
                        continue;
                    }
                    if let Some(reason) = self.handle_conn_event(event, &mut backoff).await {
                        break reason;
                    }
                },

                _ = backoff_elapsed(&mut backoff) => {
                    backoff = None;
                    if let Some(reason) = self.reopen().await {
                        break reason;
                    }
                },

                _ = tick.tick() => {
                    if let Some(reason) = self.on_tick(&mut backoff).await {
                        break reason;
                    }
                },
            }
        };

        self.shutdown(close_reason).await;
    }

    async fn handle_send_audio(&mut self, data: Bytes) {
        let now = Instant::now();
        self.session.note_audio(now);
        if self.session.buffer.is_active() {
            self.session.buffer.enqueue(data, now);
        } else if self.session.state == ConnectionState::Active {
            if let Some(conn) = &self.conn {
                if let Err(e) = conn.send_audio(data).await {
                    tracing::debug!("Audio frame dropped: {e}");
                }
            }
        } else {
            tracing::debug!(state = %self.session.state, "No writable connection, audio frame dropped");
        }
    }

    async fn handle_send_text(&mut self, text: String) {
        if self.session.state == ConnectionState::Active {
            if let Some(conn) = &self.conn {
                if let Err(e) = conn.send_control(&ClientEvent::Text { text }).await {
                    tracing::debug!("Text hint dropped: {e}");
                }
                return;
            }
        }
        tracing::debug!(state = %self.session.state, "No writable connection, text hint dropped");
    }

    async fn handle_conn_event(
        &mut self,
        event: ConnEvent,
        backoff: &mut Backoff,
    ) -> Option<CloseReason> {
        match event {
            ConnEvent::Frame(InboundFrame::Audio(data)) => {
                self.session.note_audio(Instant::now());
                self.callbacks.emit_audio(data).await;
                None
            }
            ConnEvent::Frame(InboundFrame::Control(event)) => {
                self.handle_server_event(event, backoff).await
            }
            ConnEvent::Closed { error } => {
                self.conn = None;
                self.connected.store(false, Ordering::SeqCst);
                if let Some(ctx) = self.session.reconnect.as_mut() {
                    // The close we were waiting for: the old transport is
                    // fully gone, so the reopen may now be scheduled.
                    ctx.close_confirmed = true;
                    *backoff = Some(Box::pin(sleep(self.backend.reconnect_backoff)));
                    None
                } else {
                    Some(CloseReason::ConnectionLost {
                        detail: error.unwrap_or_else(|| "connection closed by backend".to_string()),
                    })
                }
            }
        }
    }

    async fn handle_server_event(
        &mut self,
        event: ServerEvent,
        backoff: &mut Backoff,
    ) -> Option<CloseReason> {
        match event {
            ServerEvent::Ready => {
                tracing::trace!("Ignoring mid-stream ready message");
                None
            }

            ServerEvent::Audio { data } => {
                match BASE64_STANDARD.decode(&data) {
                    Ok(audio) => {
                        self.session.note_audio(Instant::now());
                        self.callbacks.emit_audio(Bytes::from(audio)).await;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to decode audio payload: {e}");
                    }
                }
                None
            }

            ServerEvent::Text { text } => {
                self.callbacks.emit_text(text).await;
                None
            }

            ServerEvent::Interrupted => {
                self.callbacks.emit_interrupt().await;
                None
            }

            ServerEvent::ResumptionUpdate { handle } => {
                // Passive refresh: store the handle, leave the connection
                // alone.
                tracing::debug!("Resumption handle refreshed");
                self.session.resume_handle = Some(handle);
                None
            }

            ServerEvent::Reconnect {
                handle,
                attempt,
                max_attempts,
                silent_streak,
            } => {
                self.handle_reconnect_signal(handle, attempt, max_attempts, silent_streak, backoff)
                    .await
            }

            ServerEvent::Terminated { reason, detail } => {
                tracing::info!(reason, "Backend terminated the session");
                Some(CloseReason::BackendTerminated { reason, detail })
            }

            ServerEvent::Error { kind, detail } => {
                tracing::error!(kind, ?detail, "Backend error");
                self.callbacks
                    .emit_error(RelayError::Backend {
                        kind: kind.clone(),
                        detail: detail.clone().unwrap_or_default(),
                    })
                    .await;
                if kind == FATAL_ERROR_KIND {
                    // This kind means the session cannot be resurrected;
                    // every further reconnect attempt is suppressed.
                    self.session.reconnects_disabled = true;
                    Some(CloseReason::FatalBackendError { kind, detail })
                } else {
                    None
                }
            }
        }
    }

    async fn handle_reconnect_signal(
        &mut self,
        handle: String,
        attempt: u32,
        max_attempts: u32,
        silent_streak: u32,
        backoff: &mut Backoff,
    ) -> Option<CloseReason> {
        // The freshest handle always wins.
        self.session.resume_handle = Some(handle.clone());

        if self.session.reconnects_disabled {
            tracing::warn!("Ignoring reconnect signal, reconnection is disabled");
            return None;
        }

        if let Some(ctx) = self.session.reconnect.as_mut() {
            // Single flight: refresh the pending handle, never a second open.
            tracing::debug!("Reconnect already in flight, refreshed pending handle");
            ctx.handle = Some(handle);
            return None;
        }

        let ceiling = if max_attempts > 0 {
            max_attempts
        } else {
            self.session.options.max_reconnect_attempts
        };
        if attempt > ceiling {
            tracing::warn!(attempt, ceiling, "Reconnect attempt ceiling exceeded");
            self.callbacks
                .emit_error(RelayError::ReconnectExhausted(attempt))
                .await;
            return Some(CloseReason::RetriesExhausted {
                attempt,
                max_attempts: ceiling,
            });
        }

        let streak = if silent_streak > 0 {
            silent_streak
        } else {
            self.session.silent_streak
        };
        self.start_reconnect(
            ReconnectContext {
                handle: Some(handle),
                attempt,
                max_attempts: ceiling,
                silent_streak: streak,
                trigger: RestartTrigger::Backend,
                close_confirmed: false,
            },
            backoff,
        )
        .await;
        None
    }

    /// Arm the buffer, notify the owner, and begin tearing down the current
    /// transport. The reopen happens only once the close is confirmed.
    async fn start_reconnect(&mut self, ctx: ReconnectContext, backoff: &mut Backoff) {
        let notice = ReconnectNotice {
            trigger: ctx.trigger,
            attempt: ctx.attempt,
            resuming: ctx.handle.is_some(),
        };
        if !self.session.begin_reconnect(ctx) {
            return;
        }
        *self.state.write().await = ConnectionState::Reconnecting;
        self.connected.store(false, Ordering::SeqCst);
        self.session.buffer.activate(Instant::now());
        self.callbacks.emit_reconnecting(notice).await;

        match self.conn.as_mut() {
            Some(conn) => conn.begin_close().await,
            None => {
                // No transport to wait on; schedule the reopen directly.
                if let Some(ctx) = self.session.reconnect.as_mut() {
                    ctx.close_confirmed = true;
                }
                *backoff = Some(Box::pin(sleep(self.backend.reconnect_backoff)));
            }
        }
    }

    /// Reopen after the backoff. A failed open here is terminal: the bounded
    /// retry policy applies to backend signals, not to reopen attempts.
    async fn reopen(&mut self) -> Option<CloseReason> {
        if self.session.state != ConnectionState::Reconnecting {
            return None;
        }
        let ctx = self.session.reconnect.clone()?;
        if !ctx.close_confirmed {
            // Never two live connections: the reopen waits for the old
            // transport to be confirmed gone.
            return None;
        }

        self.epoch += 1;
        let resume = ctx.handle.clone().or_else(|| self.session.resume_handle.clone());
        let streak = (ctx.silent_streak > 0).then_some(ctx.silent_streak);
        let setup = setup_params(&self.session.options, resume, streak);

        match Connection::open(
            &self.backend.endpoint,
            &self.backend.api_key,
            setup,
            self.epoch,
            self.event_tx.clone(),
            self.backend.open_timeout,
        )
        .await
        {
            Ok(conn) => {
                self.conn = Some(conn);
                self.session.complete_reconnect(Instant::now());
                *self.state.write().await = ConnectionState::Active;
                self.connected.store(true, Ordering::SeqCst);

                // Replay captured frames in original order before anything
                // newer can be written.
                let frames = self.session.buffer.drain();
                let flushed = frames.len();
                if let Some(conn) = self.conn.as_ref() {
                    for frame in frames {
                        if let Err(e) = conn.send_audio(frame).await {
                            tracing::warn!("Failed to replay buffered audio: {e}");
                            break;
                        }
                    }
                }

                tracing::info!(
                    flushed,
                    attempt = ctx.attempt,
                    max_attempts = ctx.max_attempts,
                    "Backend session resumed"
                );
                self.callbacks
                    .emit_reconnected(ReconnectOutcome {
                        attempt: ctx.attempt,
                        flushed_frames: flushed,
                    })
                    .await;
                None
            }
            Err(e) => {
                tracing::error!("Reopen during reconnect failed: {e}");
                let detail = e.to_string();
                self.callbacks.emit_error(e).await;
                Some(CloseReason::ReconnectFailed { detail })
            }
        }
    }

    async fn on_tick(&mut self, backoff: &mut Backoff) -> Option<CloseReason> {
        let now = Instant::now();

        if self.session.state == ConnectionState::Active
            && self
                .session
                .quiet_since(now, self.backend.restart.check_interval)
        {
            self.session.note_silent_interval();
        }

        // A reconnect that outlives the safety hold forfeits its captured
        // audio; memory stays bounded even if the reopen is stuck.
        if self.session.buffer.is_active() && self.session.buffer.expired(now) {
            self.session.buffer.discard();
        }

        if let Some(kind) = self.session.restart_due(now, &self.backend.restart) {
            tracing::info!(?kind, "Refreshing backend session ahead of its lifetime");
            let ctx = ReconnectContext {
                handle: self.session.resume_handle.clone(),
                attempt: self.session.last_attempt,
                max_attempts: self.session.options.max_reconnect_attempts,
                silent_streak: self.session.silent_streak,
                trigger: RestartTrigger::Proactive,
                close_confirmed: false,
            };
            self.start_reconnect(ctx, backoff).await;
        }
        None
    }

    /// Terminal teardown: discard the buffer, drop the transport, report the
    /// close exactly once. Returning from the actor cancels the restart tick
    /// and any armed backoff.
    async fn shutdown(mut self, reason: CloseReason) {
        self.session.buffer.discard();
        self.session.reconnect = None;
        self.session.transition(ConnectionState::Closed);
        *self.state.write().await = ConnectionState::Closed;
        self.connected.store(false, Ordering::SeqCst);
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        tracing::info!(session_id = %self.session.session_id, %reason, "Session closed");
        self.callbacks.emit_closed(reason).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
