//! Newline-delimited JSON session transport.
//!
//! The first client frame is a [`ConnectRequest`]; the server answers with a
//! [`ConnectResponse`] and closes the stream on rejection. After that the
//! client sends [`AgentToServer`] frames and the server sends
//! [`ServerToAgent`] frames, both replies and pushes.

use crate::error::{ControlError, ControlResult};
use crate::opamp::{AgentConnection, Callbacks, SessionId, SharedConnection};
use crate::protocol::{AgentToServer, ConnectRequest, ConnectResponse, ServerToAgent};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// How long [`run_listener`] waits for open sessions to finish their close
/// hook after shutdown.
pub const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Outbound half of a stream session. Frames are written by a single writer
/// task in the order they were queued.
pub struct StreamSession {
    id: SessionId,
    remote_addr: String,
    tx: mpsc::UnboundedSender<ServerToAgent>,
}

#[async_trait]
impl AgentConnection for StreamSession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    async fn send(&self, message: ServerToAgent) -> ControlResult<()> {
        self.tx
            .send(message)
            .map_err(|_| ControlError::Transport(format!("session {} is closed", self.id)))
    }
}

async fn write_frame<W, T>(writer: &mut W, frame: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Runs one session to completion.
///
/// Returns `AuthRejected` when admission fails. The close hook runs exactly
/// once for every admitted session, whatever ends it.
pub async fn serve_connection<S>(
    stream: S,
    remote_addr: String,
    callbacks: Arc<dyn Callbacks>,
    message_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> ControlResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    let first = tokio::time::timeout(message_timeout, lines.next_line())
        .await
        .map_err(|_| ControlError::Transport("timed out waiting for connect request".into()))?
        .map_err(|e| ControlError::Transport(e.to_string()))?
        .ok_or_else(|| ControlError::Transport("closed before connect request".into()))?;
    let request: ConnectRequest = serde_json::from_str(&first)
        .map_err(|e| ControlError::Transport(format!("invalid connect request: {}", e)))?;

    let response = callbacks.on_connecting(&request);
    write_frame(&mut write_half, &response)
        .await
        .map_err(|e| ControlError::Transport(e.to_string()))?;
    if !response.accepted {
        let _ = write_half.shutdown().await;
        return Err(ControlError::AuthRejected);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerToAgent>();
    let session = StreamSession {
        id: next_session_id(),
        remote_addr: remote_addr.clone(),
        tx,
    };
    let session_id = session.id;
    let conn: SharedConnection = Arc::new(session);
    tracing::info!(session = session_id, remote_addr = %remote_addr, "Agent session admitted");

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &message).await {
                tracing::debug!(session = session_id, error = %e, "Session write failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(session = session_id, error = %e, "Session read failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let message: AgentToServer = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(session = session_id, error = %e, "Skipping unparseable frame");
                        continue;
                    }
                };

                match tokio::time::timeout(message_timeout, callbacks.on_message(conn.clone(), message)).await {
                    Ok(Some(reply)) => {
                        if let Err(e) = conn.send(reply).await {
                            tracing::debug!(session = session_id, error = %e, "Reply dropped");
                        }
                    }
                    Ok(None) => {}
                    Err(_) => {
                        tracing::warn!(session = session_id, "Message handling timed out");
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!(session = session_id, "Closing session for shutdown");
                break;
            }
        }
    }

    callbacks.on_close(conn).await;
    Ok(())
}

/// Accepts TCP sessions until `shutdown_tx` fires.
pub async fn run_listener(
    listener: TcpListener,
    callbacks: Arc<dyn Callbacks>,
    message_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
) -> ControlResult<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Agent transport listening");
    }
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let callbacks = callbacks.clone();
                        let shutdown = shutdown_tx.subscribe();
                        sessions.spawn(async move {
                            let result = serve_connection(
                                stream,
                                peer.to_string(),
                                callbacks,
                                message_timeout,
                                shutdown,
                            )
                            .await;
                            match result {
                                Ok(()) => {}
                                Err(ControlError::AuthRejected) => {
                                    tracing::info!(remote_addr = %peer, "Session rejected: unauthorized");
                                }
                                Err(e) => {
                                    tracing::warn!(remote_addr = %peer, error = %e, "Session ended with error");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept error");
                    }
                }
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    // Sessions see the same shutdown signal; let their close hooks finish
    let open = sessions.len();
    let drained = tokio::time::timeout(SESSION_DRAIN_TIMEOUT, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            remaining = sessions.len(),
            "Aborting sessions that did not close in time"
        );
        sessions.shutdown().await;
    } else if open > 0 {
        tracing::debug!(sessions = open, "Agent sessions drained");
    }

    Ok(())
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
