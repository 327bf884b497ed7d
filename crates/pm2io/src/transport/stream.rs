//! Stream handle abstraction and the WebSocket dialer
//!
//! The connection manager only sees a `(FrameSink, FrameStream)` pair. The
//! production [`WsDialer`] builds it from a tokio-tungstenite socket; tests
//! build it from in-memory channels.

use crate::config::{Config, PROTOCOL_VERSION};
use crate::error::ConnectionError;
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::*;

pub const HEADER_PUBLIC_KEY: &str = "x-km-public";
pub const HEADER_SECRET_KEY: &str = "x-km-secret";
pub const HEADER_SERVER: &str = "x-km-server";
pub const HEADER_AGENT_VERSION: &str = "x-pm2-version";
pub const HEADER_PROTOCOL_VERSION: &str = "x-protocol-version";

/// Unit read from or written to the stream
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ConnectionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ConnectionError>> + Send>>;

/// Authentication data carried by the upgrade request
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub public_key: String,
    pub secret_key: String,
    pub server_name: String,
    pub agent_version: String,
    pub protocol_version: String,
}

impl Handshake {
    pub fn new(config: &Config, server_name: &str) -> Self {
        Self {
            public_key: config.public_key.clone(),
            secret_key: config.private_key.clone(),
            server_name: server_name.to_string(),
            agent_version: config.version.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn headers(&self) -> [(&'static str, &str); 5] {
        [
            (HEADER_PUBLIC_KEY, &self.public_key),
            (HEADER_SECRET_KEY, &self.secret_key),
            (HEADER_SERVER, &self.server_name),
            (HEADER_AGENT_VERSION, &self.agent_version),
            (HEADER_PROTOCOL_VERSION, &self.protocol_version),
        ]
    }
}

/// Opens a new stream to an endpoint
#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(
        &self,
        endpoint: &str,
        handshake: &Handshake,
    ) -> Result<(FrameSink, FrameStream), ConnectionError>;
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }
}

/// WebSocket dialer (rustls for `wss://` endpoints)
#[derive(Debug, Default, Clone)]
pub struct WsDialer;

#[async_trait]
impl Dial for WsDialer {
    async fn dial(
        &self,
        endpoint: &str,
        handshake: &Handshake,
    ) -> Result<(FrameSink, FrameStream), ConnectionError> {
        let failed = |reason: String| ConnectionError::HandshakeFailed {
            endpoint: endpoint.to_string(),
            reason,
        };

        let mut request = endpoint
            .into_client_request()
            .map_err(|e| failed(e.to_string()))?;

        for (name, value) in handshake.headers() {
            let value = HeaderValue::from_str(value)
                .map_err(|e| failed(format!("invalid {name} header: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (socket, response) = connect_async(request)
            .await
            .map_err(|e| failed(e.to_string()))?;
        debug!("Upgrade to {} answered with {}", endpoint, response.status());

        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|e| ConnectionError::WriteFailed {
                reason: e.to_string(),
            })
            .with(|frame: Frame| future::ready(Ok::<Message, ConnectionError>(frame.into())));

        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(Message::Ping(data)) => Some(Ok(Frame::Ping(data))),
                Ok(Message::Pong(data)) => Some(Ok(Frame::Pong(data))),
                Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
                Ok(Message::Frame(_)) => None,
                Err(e) => Some(Err(ConnectionError::ReadFailed {
                    reason: e.to_string(),
                })),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
