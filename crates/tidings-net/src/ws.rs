//! WebSocket transport built on `tokio-tungstenite`.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use tidings_shared::constants::MAX_FRAME_SIZE;
use tidings_shared::protocol::{ClientFrame, ServerFrame};

use crate::error::{NetError, Result};
use crate::transport::{Connector, Credential, Inbound, Link};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials a `ws://` or `wss://` endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

pub struct WsLink {
    stream: WsStream,
}

impl Connector for WsConnector {
    type Link = WsLink;

    async fn open(&self, credential: &Credential) -> Result<WsLink> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| NetError::Transport(format!("invalid endpoint: {e}")))?;

        // The credential travels in the upgrade header, never in a frame.
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|e| NetError::HandshakeRejected(format!("unusable credential: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let config = WebSocketConfig {
            max_message_size: Some(MAX_FRAME_SIZE),
            max_frame_size: Some(MAX_FRAME_SIZE),
            ..Default::default()
        };

        let (mut stream, _response) = connect_async_with_config(request, Some(config), false)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(resp) => {
                    NetError::HandshakeRejected(format!("HTTP {}", resp.status()))
                }
                other => NetError::Transport(other.to_string()),
            })?;

        await_connected(&mut stream).await?;
        info!(url = %self.url, "WebSocket session established");

        Ok(WsLink { stream })
    }
}

/// Read until the server accepts or refuses the session.
async fn await_connected(stream: &mut WsStream) -> Result<()> {
    while let Some(msg) = stream.next().await {
        match msg.map_err(|e| NetError::Transport(e.to_string()))? {
            Message::Text(text) => {
                return match ServerFrame::from_json(&text)? {
                    ServerFrame::Connected { session } => {
                        debug!(session = ?session, "Handshake accepted");
                        Ok(())
                    }
                    ServerFrame::Error { message } => Err(NetError::HandshakeRejected(message)),
                    ServerFrame::Message { topic, .. } => Err(NetError::HandshakeRejected(
                        format!("message on {topic} before CONNECTED"),
                    )),
                };
            }
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "closed during handshake".to_string());
                return Err(NetError::HandshakeRejected(reason));
            }
            _ => continue,
        }
    }
    Err(NetError::HandshakeRejected("closed during handshake".into()))
}

impl Link for WsLink {
    async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        let text = frame.to_json()?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| NetError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Inbound>> {
        let msg = match self.stream.next().await? {
            Ok(m) => m,
            Err(e) => return Some(Err(NetError::Transport(e.to_string()))),
        };

        match msg {
            Message::Text(text) => match ServerFrame::from_json(&text) {
                Ok(frame) => Some(Ok(Inbound::Frame(frame))),
                Err(e) => {
                    warn!(error = %e, len = text.len(), "Dropping malformed server frame");
                    Some(Ok(Inbound::Alive))
                }
            },
            Message::Close(frame) => {
                debug!(frame = ?frame, "Server closed WebSocket");
                None
            }
            // Ping replies are queued by tungstenite itself.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {
                Some(Ok(Inbound::Alive))
            }
        }
    }

    async fn heartbeat(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| NetError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Error while closing WebSocket");
        }
    }
}
