//! Mock Home Assistant WebSocket endpoint.
//!
//! Accepts any handshake, records every text frame and echoes it back.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

pub struct MockSocketUpstream {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    shutdown: CancellationToken,
}

impl MockSocketUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let recorded = received.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(_) => continue,
                    },
                    _ = token.cancelled() => break,
                };

                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let Ok(mut socket) = accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(message)) = socket.next().await {
                        match message {
                            Message::Text(text) => {
                                recorded.lock().unwrap().push(text.to_string());
                                if socket.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                });
            }
        });

        Self {
            addr,
            received,
            shutdown,
        }
    }

    /// Base URL as configured for the gate (`http://`, rewritten to `ws://`).
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for MockSocketUpstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
