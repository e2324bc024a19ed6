//! Event-stream endpoint of a ComfyUI instance.
//!
//! [`ComfyUIClient`] knows where the `/ws` endpoint lives and which
//! identity token to present; [`ComfyUIClient::connect`] performs the
//! handshake and hands back a [`ComfyUIConnection`].

use futures::SinkExt;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// WebSocket stream carrying ComfyUI events.
pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Address and identity used to subscribe to an instance's events.
///
/// ComfyUI routes a prompt's events to the socket whose `clientId`
/// matches the `client_id` the prompt was submitted with, so the same
/// token must be used for both.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    client_id: String,
}

/// An open event stream.
pub struct ComfyUIConnection {
    pub client_id: String,
    pub ws_stream: WsStream,
}

/// Errors from opening or closing the event stream.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    #[error("cannot open event stream at {url}: {reason}")]
    Connection { url: String, reason: String },

    #[error("event stream protocol error: {0}")]
    Protocol(String),
}

impl ComfyUIClient {
    /// `ws_url` is the instance root, e.g. `ws://127.0.0.1:8188`.
    pub fn new(ws_url: String, client_id: String) -> Self {
        Self { ws_url, client_id }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// `{ws_url}/ws?clientId={client_id}`.
    pub fn endpoint(&self) -> String {
        format!("{}/ws?clientId={}", self.ws_url, self.client_id)
    }

    /// Perform the WebSocket handshake.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let (ws_stream, _response) =
            connect_async(self.endpoint())
                .await
                .map_err(|e| ComfyUIClientError::Connection {
                    url: self.ws_url.clone(),
                    reason: e.to_string(),
                })?;

        tracing::info!(ws_url = %self.ws_url, client_id = %self.client_id, "Event stream connected");

        Ok(ComfyUIConnection {
            client_id: self.client_id.clone(),
            ws_stream,
        })
    }
}

impl ComfyUIConnection {
    /// Close the stream politely. The peer may already be gone.
    pub async fn close(mut self) -> Result<(), ComfyUIClientError> {
        self.ws_stream
            .close(None)
            .await
            .map_err(|e| ComfyUIClientError::Protocol(e.to_string()))
    }
}
