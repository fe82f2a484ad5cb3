//! WebSocket connector for the push channel.

use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Stream type of every push-channel connection.
pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens push-channel connections against one server.
#[derive(Debug, Clone)]
pub struct PushClient {
    ws_base: String,
}

impl PushClient {
    /// `ws_base` is the server's WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_base: impl Into<String>) -> Self {
        Self {
            ws_base: ws_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// URL of the channel observing `job_id`.
    pub fn channel_url(&self, job_id: &str) -> String {
        format!("{}/ws?clientId={job_id}", self.ws_base)
    }

    pub async fn connect(&self, job_id: &str) -> Result<WsStream, ChannelError> {
        let url = self.channel_url(job_id);
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|source| ChannelError::Connect { url: url.clone(), source })?;

        tracing::info!(job_id, status = %response.status(), url = %url, "Push channel connected");
        Ok(stream)
    }
}

/// Ways a push-channel session can fail. Every variant triggers a
/// reconnection attempt while the budget lasts.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("Failed to send subscription: {0}")]
    Subscribe(#[source] tungstenite::Error),

    #[error("WebSocket receive error: {0}")]
    Receive(#[source] tungstenite::Error),

    /// The stream ended without a close frame.
    #[error("Connection dropped without a close frame")]
    Dropped,
}
