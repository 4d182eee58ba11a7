use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TransportEvent, TransportState};
use crate::error::{AppError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// WebSocket client to the signaling server
///
/// One connection at a time. Events go to the receiver handed out by
/// [`SignalingTransport::new`].
pub struct SignalingTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<TransportState>,
    conn: Mutex<Option<Connection>>,
}

impl SignalingTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TransportState::Disconnected);
        let transport = Arc::new(Self {
            events,
            state,
            conn: Mutex::new(None),
        });
        (transport, rx)
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Open the WebSocket; `Open` is emitted before this returns
    pub async fn connect(&self, url: &str, timeout: Duration) -> Result<()> {
        let started = self.state.send_if_modified(|state| {
            if *state != TransportState::Disconnected {
                return false;
            }
            *state = TransportState::Connecting;
            true
        });
        if !started {
            return Err(AppError::InvalidState(format!(
                "Signaling transport is {}",
                self.state()
            )));
        }

        info!("Connecting to signaling server {}", url);
        let ws = match tokio::time::timeout(timeout, connect_async(url)).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return Err(self.connect_failed(e.to_string())),
            Err(_) => {
                return Err(self.connect_failed(format!(
                    "handshake timed out after {} ms",
                    timeout.as_millis()
                )))
            }
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (started_tx, started_rx) = oneshot::channel();

        // The socket task holds back until Open is out, so nothing it reports
        // can overtake Open
        let task = tokio::spawn(run(
            ws,
            outbound_rx,
            self.events.clone(),
            self.state.clone(),
            cancel.clone(),
            started_rx,
        ));

        // Stored before Open so a send reacting to Open uses this connection.
        // A finished previous connection is simply replaced.
        *self.conn.lock() = Some(Connection {
            outbound,
            cancel,
            task,
        });
        self.state.send_replace(TransportState::Connected);
        let _ = self.events.send(TransportEvent::Open);
        let _ = started_tx.send(());
        Ok(())
    }

    fn connect_failed(&self, reason: String) -> AppError {
        warn!("Signaling connection failed: {}", reason);
        self.state.send_replace(TransportState::Disconnected);
        let _ = self.events.send(TransportEvent::Error(reason.clone()));
        AppError::Transport(reason)
    }

    /// Close the connection; returns once `Close` has been emitted
    pub async fn disconnect(&self) -> Result<()> {
        let Some(conn) = self.conn.lock().take() else {
            debug!("Signaling transport already disconnected");
            return Ok(());
        };

        conn.cancel.cancel();
        if let Err(e) = conn.task.await {
            if !e.is_cancelled() {
                return Err(AppError::Transport(format!("connection task failed: {}", e)));
            }
        }
        Ok(())
    }

    /// Queue one text frame
    pub fn send(&self, text: &str) -> Result<()> {
        if !self.is_connected() {
            warn!("Not sending, signaling transport is {}", self.state());
            return Err(AppError::Transport("not connected".to_string()));
        }

        let conn = self.conn.lock();
        let Some(conn) = conn.as_ref() else {
            return Err(AppError::Transport("not connected".to_string()));
        };
        conn.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| AppError::Transport("connection closed".to_string()))?;
        debug!("Signaling frame queued ({} bytes)", text.len());
        Ok(())
    }
}

/// Own the socket until either side closes it, then emit `Close` once
async fn run(
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<TransportState>,
    cancel: CancellationToken,
    started: oneshot::Receiver<()>,
) {
    let _ = started.await;
    let (mut sink, mut stream) = ws.split();

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break "Closed by client".to_string();
            }
            Some(msg) = outbound.recv() => {
                if let Err(e) = sink.send(msg).await {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break format!("Send failed: {}", e);
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(text.to_string()));
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring {} byte binary signaling frame", data.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) if !frame.reason.is_empty() => frame.reason.to_string(),
                        _ => "Closed by server".to_string(),
                    };
                }
                // Ping/pong is answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break e.to_string();
                }
                None => break "Connection lost".to_string(),
            },
        }
    };

    info!("Signaling connection closed: {}", reason);
    state.send_replace(TransportState::Disconnected);
    let _ = events.send(TransportEvent::Close(reason));
}
