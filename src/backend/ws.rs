use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

use super::{BackendError, PushStream, PushTransport};
use crate::execution::ExecutionRef;

/// WebSocket push channel: one connection per active execution at
/// `{ws_base}/ws/{resource}/{id}?token={token}`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    base_url: Url,
    token: Option<String>,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(base_url: &str, token: Option<String>, connect_timeout: Duration) -> Result<Self, BackendError> {
        let base_url = Url::parse(base_url).map_err(|e| BackendError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !matches!(base_url.scheme(), "ws" | "wss") || base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            base_url,
            token,
            connect_timeout,
        })
    }

    pub fn socket_url(&self, exec: &ExecutionRef) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("ws")
            .push(exec.kind.resource())
            .push(exec.id.as_str());
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

/// Derive the socket base from the HTTP base: `http -> ws`, `https -> wss`.
pub fn derive_ws_url(http_base: &str) -> Result<String, BackendError> {
    let mut url = Url::parse(http_base).map_err(|e| BackendError::InvalidUrl(format!("{http_base}: {e}")))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url.to_string()),
        other => return Err(BackendError::InvalidUrl(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| BackendError::InvalidUrl(http_base.to_string()))?;
    Ok(url.to_string())
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn subscribe(&self, exec: &ExecutionRef) -> Result<PushStream, BackendError> {
        let url = self.socket_url(exec)?;
        let (socket, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| BackendError::Socket(format!("connect timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| BackendError::Socket(e.to_string()))?;
        info!(execution = %exec, "push channel connected");

        // The server never expects client frames, so the socket is only read.
        let frames = socket.filter_map(|msg| {
            let out = match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        debug!("dropping non-UTF-8 binary frame");
                        None
                    }
                },
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "push channel closed by server");
                    None
                }
                Err(e) => Some(Err(BackendError::Socket(e.to_string()))),
            };
            futures::future::ready(out)
        });
        Ok(frames.boxed())
    }
}
