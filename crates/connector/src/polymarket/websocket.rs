//! Polymarket CLOB WebSocket transport.
//!
//! - Keepalive is a raw text "PING" (not JSON, not a WS ping frame); the
//!   server answers "PONG", which is handed up like any text frame so the
//!   session can count it as liveness
//! - Subscriptions are by asset_id (outcome token ID)
//! - No subscription acks: the first `book` for an asset is the confirmation
//! - The server may go silent without closing; the session's read deadline
//!   catches that, this transport only bounds writes

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use polybook_metadata::WebSocketConfig as SocketSettings;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};

use crate::error::ConnectionError;
use crate::polymarket::messages::OutgoingMessage;
use crate::traits::Transport;
use crate::types::SubscriptionRequest;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
    write_timeout: Duration,
    ws: Option<Socket>,
}

impl WsTransport {
    /// Book snapshots with deep ladders can be large.
    const MAX_MESSAGE_SIZE: usize = 2_097_152;

    pub fn new(url: impl Into<String>, connect_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            write_timeout,
            ws: None,
        }
    }

    pub fn from_config(config: &SocketSettings) -> Self {
        Self::new(
            config.url.clone(),
            config.connect_timeout(),
            config.write_timeout(),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn socket(&mut self) -> Result<&mut Socket, ConnectionError> {
        self.ws.as_mut().ok_or(ConnectionError::NotConnected)
    }

    /// Sends and flushes one message within the write timeout. A stalled
    /// peer drops the connection.
    async fn write(&mut self, message: Message) -> Result<(), ConnectionError> {
        let write_timeout = self.write_timeout;
        let ws = self.socket()?;
        match tokio::time::timeout(write_timeout, ws.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.ws = None;
                Err(e.into())
            }
            Err(_) => {
                warn!(timeout_secs = write_timeout.as_secs(), "market feed write timeout");
                self.ws = None;
                Err(ConnectionError::WriteTimeout(write_timeout))
            }
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if let Some(mut old) = self.ws.take() {
            let _ = tokio::time::timeout(self.write_timeout, old.close(None)).await;
        }

        info!(url = %self.url, "connecting to market feed");
        let config = WebSocketConfig {
            max_message_size: Some(Self::MAX_MESSAGE_SIZE),
            max_frame_size: Some(Self::MAX_MESSAGE_SIZE),
            ..Default::default()
        };

        let (ws, response) = tokio::time::timeout(
            self.connect_timeout,
            connect_async_with_config(self.url.as_str(), Some(config), false),
        )
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(self.connect_timeout))??;

        info!(status = ?response.status(), "market feed connected");
        self.ws = Some(ws);
        Ok(())
    }

    async fn send(&mut self, request: &SubscriptionRequest) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(&OutgoingMessage::from(request))?;
        debug!(count = request.assets().len(), "sending subscription message");
        self.write(Message::Text(text)).await
    }

    async fn receive(&mut self) -> Result<String, ConnectionError> {
        loop {
            let next = self.socket()?.next().await;

            match next {
                Some(Ok(Message::Text(text))) => {
                    trace!(len = text.len(), "frame received");
                    return Ok(text);
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(text),
                    Err(e) => warn!(error = %e, "non-UTF-8 binary frame dropped"),
                },
                Some(Ok(Message::Ping(data))) => {
                    trace!("WS ping, sending pong");
                    self.write(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(frame = ?frame, "market feed closed the connection");
                    self.ws = None;
                    return Err(ConnectionError::Closed);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.ws = None;
                    return Err(e.into());
                }
                None => {
                    self.ws = None;
                    return Err(ConnectionError::Closed);
                }
            }
        }
    }

    async fn ping(&mut self) -> Result<(), ConnectionError> {
        self.write(Message::Text("PING".to_string())).await
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if let Some(mut ws) = self.ws.take() {
            tokio::time::timeout(self.write_timeout, ws.close(None))
                .await
                .map_err(|_| ConnectionError::WriteTimeout(self.write_timeout))??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetId;
    use polybook_metadata::DEFAULT_WS_URL;

    #[test]
    fn test_from_config() {
        let transport = WsTransport::from_config(&SocketSettings::default());
        assert_eq!(transport.url(), DEFAULT_WS_URL);
        assert_eq!(transport.write_timeout, Duration::from_secs(10));
        assert_eq!(transport.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let mut transport = WsTransport::from_config(&SocketSettings::default());
        let result = transport
            .send(&SubscriptionRequest::Subscribe(vec!["1".into()]))
            .await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
        assert!(matches!(
            transport.receive().await,
            Err(ConnectionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_without_connection_is_ok() {
        let mut transport = WsTransport::from_config(&SocketSettings::default());
        assert!(transport.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_peer_hits_write_timeout() {
        use tokio::net::TcpListener;

        // Completes the handshake, then never reads again.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(ws);
        });

        let mut transport = WsTransport::new(
            format!("ws://{}", addr),
            Duration::from_secs(5),
            Duration::from_millis(500),
        );
        transport.connect().await.unwrap();

        let assets: Vec<AssetId> = (0..20_000)
            .map(|i| AssetId::from(format!("{:0>70}", i)))
            .collect();
        let request = SubscriptionRequest::Subscribe(assets);

        let outcome = tokio::time::timeout(Duration::from_secs(30), async {
            for _ in 0..200 {
                if let Err(e) = transport.send(&request).await {
                    return Some(e);
                }
            }
            None
        })
        .await
        .expect("send never returned");

        assert!(matches!(outcome, Some(ConnectionError::WriteTimeout(_))));
        assert!(matches!(
            transport.ping().await,
            Err(ConnectionError::NotConnected)
        ));
        server.abort();
    }
}
