//! Local signaling server for tests
//!
//! Relays every text frame to all other connections, like a minimal signaling
//! server. `echo:<text>` is answered to the sender only and `close` makes the
//! server drop that connection.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
struct Frame {
    from: usize,
    text: String,
}

pub(crate) struct TestServer {
    pub url: String,
    /// Every text frame any client sent, in arrival order
    pub received: mpsc::UnboundedReceiver<String>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (received_tx, received) = mpsc::unbounded_channel();
        let (relay, _) = broadcast::channel(256);

        let task = tokio::spawn(async move {
            let mut next_id = 0;
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                tokio::spawn(serve(ws, next_id, relay.clone(), received_tx.clone()));
                next_id += 1;
            }
        });

        Self {
            url,
            received,
            task,
        }
    }

    pub async fn next_received(&mut self) -> String {
        tokio::time::timeout(std::time::Duration::from_secs(2), self.received.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("server stopped")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    id: usize,
    relay: broadcast::Sender<Frame>,
    received: mpsc::UnboundedSender<String>,
) {
    let (mut sink, mut stream) = ws.split();
    let mut relayed = relay.subscribe();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let text = text.to_string();
                    let _ = received.send(text.clone());
                    if text == "close" {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    if let Some(rest) = text.strip_prefix("echo:") {
                        let _ = sink.send(Message::Text(rest.into())).await;
                    } else {
                        let _ = relay.send(Frame { from: id, text });
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            Ok(frame) = relayed.recv() => {
                if frame.from != id && sink.send(Message::Text(frame.text.into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
