//! One physical WebSocket connection to the backend.
//!
//! A connection is opened with a single timeout budget covering the upgrade,
//! the setup message, and the backend's ready acknowledgment. Once open, an
//! I/O task owns both halves of the socket: outbound frames arrive over a
//! channel, inbound frames are decoded and forwarded to the session owner
//! tagged with this connection's epoch. The owner drops events from
//! superseded epochs, so a connection that is being replaced can never
//! deliver audio late.
//!
//! Writes are not durable here: if the connection is no longer writable the
//! frame is dropped. Callers needing durability use the replay buffer.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{http::HeaderValue, Message};

use super::base::{RelayError, RelayResult};
use super::messages::{
    decode_binary, decode_text, ClientEvent, InboundFrame, ServerEvent, SetupParams,
};

/// Capacity of the outbound frame channel.
const OUT_CHANNEL_CAPACITY: usize = 256;

/// How long `close` waits for the I/O task before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Events a connection's I/O task reports to its owner, tagged with the
/// connection epoch at the transport layer.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// A decoded inbound frame
    Frame(InboundFrame),
    /// The transport ended. Emitted exactly once, last. `error` is set for
    /// abnormal ends; a clean close frame leaves it `None`.
    Closed { error: Option<String> },
}

enum Outbound {
    Audio(Bytes),
    Control(String),
    Close,
}

/// Handle to one physical connection.
pub(crate) struct Connection {
    epoch: u64,
    out_tx: Option<mpsc::Sender<Outbound>>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Open a connection: upgrade, send setup, await the backend's ready
    /// acknowledgment — all within `budget`.
    pub async fn open(
        endpoint: &str,
        api_key: &str,
        setup: SetupParams,
        epoch: u64,
        event_tx: mpsc::Sender<(u64, ConnEvent)>,
        budget: Duration,
    ) -> RelayResult<Self> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| RelayError::InvalidConfiguration(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let resuming = setup.resume_handle.is_some();
        let handshake = async move {
            let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;
            let (mut sink, mut stream) = ws_stream.split();

            let setup_json = serde_json::to_string(&ClientEvent::Setup { session: setup })
                .map_err(|e| RelayError::Serialization(e.to_string()))?;
            sink.send(Message::Text(setup_json.into()))
                .await
                .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;

            // The connection is not writable until the backend acknowledges
            // the setup; anything else arriving first is dropped.
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(InboundFrame::Control(ServerEvent::Ready)) =
                            decode_text(text.as_str())
                        {
                            return Ok((sink, stream));
                        }
                        tracing::debug!("Dropping pre-ready message");
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if let InboundFrame::Control(ServerEvent::Ready) = decode_binary(data) {
                            return Ok((sink, stream));
                        }
                        tracing::debug!("Dropping pre-ready binary frame");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(RelayError::ConnectionFailed(
                            "Connection closed during handshake".to_string(),
                        ));
                    }
                    Some(Err(e)) => return Err(RelayError::ConnectionFailed(e.to_string())),
                    _ => {}
                }
            }
        };

        let (mut sink, mut stream) = timeout(budget, handshake)
            .await
            .map_err(|_| RelayError::ConnectTimeout(budget))??;

        tracing::info!(epoch, resuming, "Backend connection ready");

        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUT_CHANNEL_CAPACITY);

        let task = tokio::spawn(async move {
            let mut error: Option<String> = None;
            loop {
                tokio::select! {
                    // Prioritize audio sending for lowest latency
                    biased;

                    out = out_rx.recv() => match out {
                        Some(Outbound::Audio(data)) => {
                            if let Err(e) = sink.send(Message::Binary(data)).await {
                                error = Some(format!("Audio write failed: {e}"));
                                break;
                            }
                        }
                        Some(Outbound::Control(json)) => {
                            if let Err(e) = sink.send(Message::Text(json.into())).await {
                                error = Some(format!("Control write failed: {e}"));
                                break;
                            }
                        }
                        Some(Outbound::Close) | None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },

                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(frame) = decode_text(text.as_str()) {
                                if event_tx.send((epoch, ConnEvent::Frame(frame))).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            let frame = decode_binary(data);
                            if event_tx.send((epoch, ConnEvent::Frame(frame))).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(epoch, ?frame, "Backend closed the connection");
                            break;
                        }
                        Some(Err(e)) => {
                            error = Some(e.to_string());
                            break;
                        }
                        None => break,
                        _ => {}
                    },
                }
            }
            let _ = event_tx.send((epoch, ConnEvent::Closed { error })).await;
            tracing::debug!(epoch, "Connection I/O task ended");
        });

        Ok(Self {
            epoch,
            out_tx: Some(out_tx),
            task,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Queue an audio frame as a raw binary WebSocket frame.
    pub async fn send_audio(&self, data: Bytes) -> RelayResult<()> {
        match &self.out_tx {
            Some(tx) => tx
                .send(Outbound::Audio(data))
                .await
                .map_err(|_| RelayError::NotConnected),
            None => Err(RelayError::NotConnected),
        }
    }

    /// Queue a control message.
    pub async fn send_control(&self, event: &ClientEvent) -> RelayResult<()> {
        let json =
            serde_json::to_string(event).map_err(|e| RelayError::Serialization(e.to_string()))?;
        match &self.out_tx {
            Some(tx) => tx
                .send(Outbound::Control(json))
                .await
                .map_err(|_| RelayError::NotConnected),
            None => Err(RelayError::NotConnected),
        }
    }

    /// Request teardown without waiting for it. Idempotent. The epoch's
    /// final `Closed` event still arrives once the transport is gone.
    pub async fn begin_close(&mut self) {
        if let Some(tx) = self.out_tx.take() {
            let _ = tx.send(Outbound::Close).await;
        }
    }

    /// Tear down and wait briefly for the I/O task to finish.
    pub async fn close(mut self) {
        if let Some(tx) = self.out_tx.take() {
            let _ = tx.send(Outbound::Close).await;
        }
        if timeout(CLOSE_GRACE, &mut self.task).await.is_err() {
            self.task.abort();
        }
    }
}
