//! In-process mock of the conversational backend.
//!
//! Accepts WebSocket connections, answers the setup handshake with `ready`,
//! records everything the relay sends, and lets tests script server-side
//! behavior (control messages, binary audio, closes).

use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

const WAIT_BUDGET: Duration = Duration::from_secs(5);

/// Mock backend server bound to a loopback port.
pub struct MockBackend {
    url: String,
    conn_rx: mpsc::UnboundedReceiver<BackendConn>,
}

impl MockBackend {
    pub async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}", listener.local_addr()?);
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    if let Ok(conn) = handle_connection(stream).await {
                        let _ = conn_tx.send(conn);
                    }
                });
            }
        });

        Ok(Self { url, conn_rx })
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    /// Next accepted connection that completed the setup handshake.
    pub async fn next_conn(&mut self) -> Result<BackendConn> {
        timeout(WAIT_BUDGET, self.conn_rx.recv())
            .await
            .map_err(|_| anyhow!("no connection within {WAIT_BUDGET:?}"))?
            .ok_or_else(|| anyhow!("mock backend stopped"))
    }

    /// True when no new connection arrives within `window`.
    pub async fn no_conn_within(&mut self, window: Duration) -> bool {
        timeout(window, self.conn_rx.recv()).await.is_err()
    }
}

/// One accepted connection, as the backend saw it.
pub struct BackendConn {
    /// The parsed setup message that opened this connection
    pub setup: Value,
    audio_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    control_rx: mpsc::UnboundedReceiver<Value>,
    out_tx: mpsc::UnboundedSender<Message>,
}

impl BackendConn {
    /// Setup parameters (the `session` object of the setup message).
    pub fn session(&self) -> &Value {
        &self.setup["session"]
    }

    pub fn send_json(&self, value: Value) -> Result<()> {
        self.out_tx
            .send(Message::Text(value.to_string().into()))
            .map_err(|_| anyhow!("connection task ended"))
    }

    pub fn send_binary(&self, data: Vec<u8>) -> Result<()> {
        self.out_tx
            .send(Message::Binary(data.into()))
            .map_err(|_| anyhow!("connection task ended"))
    }

    /// Close the connection from the server side.
    pub fn close(&self) -> Result<()> {
        self.out_tx
            .send(Message::Close(None))
            .map_err(|_| anyhow!("connection task ended"))
    }

    /// Next binary audio frame received from the relay.
    pub async fn next_audio(&mut self) -> Result<Vec<u8>> {
        timeout(WAIT_BUDGET, self.audio_rx.recv())
            .await
            .map_err(|_| anyhow!("no audio within {WAIT_BUDGET:?}"))?
            .ok_or_else(|| anyhow!("connection ended"))
    }

    /// Next JSON control message received from the relay.
    pub async fn next_control(&mut self) -> Result<Value> {
        timeout(WAIT_BUDGET, self.control_rx.recv())
            .await
            .map_err(|_| anyhow!("no control message within {WAIT_BUDGET:?}"))?
            .ok_or_else(|| anyhow!("connection ended"))
    }

}

async fn handle_connection(stream: TcpStream) -> Result<BackendConn> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    // The first message must be the setup handshake.
    let setup = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => break serde_json::from_str::<Value>(text.as_str())?,
            Some(Ok(_)) => continue,
            _ => bail!("connection ended before setup"),
        }
    };
    write
        .send(Message::Text(r#"{"type":"ready"}"#.into()))
        .await?;

    let (audio_tx, audio_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                out = out_rx.recv() => match out {
                    Some(Message::Close(frame)) => {
                        let _ = write.send(Message::Close(frame)).await;
                        break;
                    }
                    Some(msg) => {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                msg = read.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let _ = audio_tx.send(data.to_vec());
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                            let _ = control_tx.send(value);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                },
            }
        }
    });

    Ok(BackendConn {
        setup,
        audio_rx,
        control_rx,
        out_tx,
    })
}
