//! Connection primitive for the push channel.
//!
//! `PushConnector` opens one duplex connection and hands back a
//! `PushStream` of raw text frames. The channel manager owns retry and
//! decoding; implementations only move frames.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsFrame};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::ChannelError;

/// How long a deliberate close waits for the peer's close frame.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens push connections.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn PushStream>, ChannelError>;
}

/// One open push connection.
#[async_trait]
pub trait PushStream: Send {
    /// Next text frame. `None` means the peer closed the connection.
    async fn next_frame(&mut self) -> Option<Result<String, ChannelError>>;

    /// Close deliberately.
    async fn close(&mut self);
}

/// WebSocket connector using tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn PushStream>, ChannelError> {
        let (ws, _resp) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ChannelError::ConnectFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(WsStream { ws }))
    }
}

struct WsStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushStream for WsStream {
    async fn next_frame(&mut self) -> Option<Result<String, ChannelError>> {
        loop {
            match self.ws.next().await {
                Some(Ok(WsFrame::Text(text))) => return Some(Ok(text.to_string())),
                Some(Ok(WsFrame::Close(frame))) => {
                    debug!(?frame, "Peer sent close frame");
                    return None;
                }
                Some(Ok(WsFrame::Binary(data))) => {
                    debug!(len = data.len(), "Ignoring binary frame");
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Some(Err(ChannelError::Closed));
                }
                Some(Err(e)) => return Some(Err(ChannelError::Receive(e.to_string()))),
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "Close handshake failed");
        }
        // Drain until the peer acknowledges, so the close completes cleanly.
        let drain = async { while let Some(Ok(_)) = self.ws.next().await {} };
        if tokio::time::timeout(CLOSE_ACK_TIMEOUT, drain).await.is_err() {
            debug!("Peer did not acknowledge close in time");
        }
    }
}
