//! Production WebSocket transport.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::{Frame, Transport, TransportLink};
use crate::error::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the collaboration server over WebSocket.
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn TransportLink>> {
        let (ws_stream, _) = connect_async(&self.url).await?;
        debug!(url = %self.url, "WebSocket connected");

        let (write, read) = ws_stream.split();
        Ok(Box::new(WebSocketLink { write, read }))
    }
}

struct WebSocketLink {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl TransportLink for WebSocketLink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.write.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Some(Frame::Text(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Some(Frame::Text(text)),
                    Err(_) => {
                        warn!("Dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    return Some(Frame::Keepalive)
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Server closed connection");
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket read error");
                    return None;
                }
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
        let _ = self.write.close().await;
    }
}
