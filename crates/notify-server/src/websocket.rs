//! [`Connection`] over an axum WebSocket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::connections::Connection;
use crate::error::ConnectionError;

/// Write half of an upgraded socket. The read half stays with the handler
/// that owns the session.
pub struct WsConnection {
    endpoint: SocketAddr,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
}

impl WsConnection {
    pub fn new(endpoint: SocketAddr, sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            endpoint,
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send a close frame with `code` and shut the sink. Only the first call
    /// reaches the peer.
    pub async fn close_with(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(endpoint = %self.endpoint, error = %e, "close frame not sent");
        }
        let _ = sink.close().await;
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn write_text(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let text = std::str::from_utf8(payload).map_err(|_| ConnectionError::NotText)?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|e| ConnectionError::Write(e.to_string()))
    }

    async fn close(&self) {
        self.close_with(close_code::NORMAL, "").await;
    }
}
