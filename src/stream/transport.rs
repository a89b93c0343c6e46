use crate::error::AppError;
use futures_util::StreamExt;
use std::future::Future;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type TelemetryWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One inbound message, stripped of transport-level control traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Opens sessions against an endpoint. The reconnect loop owns one connector for its lifetime.
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    fn connect(&self, endpoint: &str)
        -> impl Future<Output = Result<Self::Session, AppError>> + Send;
}

pub trait Session: Send + 'static {
    /// Next frame, or `None` once the peer has gone away.
    fn next_frame(&mut self) -> impl Future<Output = Option<Result<Frame, AppError>>> + Send;

    /// Closes the session. Calling it again, or on a session the peer already closed, is a no-op.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct WsConnector {
    max_message_bytes: usize,
}

impl WsConnector {
    pub fn new(max_message_bytes: usize) -> Self {
        Self { max_message_bytes }
    }
}

impl Connector for WsConnector {
    type Session = WsSession;

    fn connect(&self, endpoint: &str) -> impl Future<Output = Result<WsSession, AppError>> + Send {
        let request = endpoint.to_string();
        let max_message_bytes = self.max_message_bytes;

        async move {
            let ws_config = WebSocketConfig {
                max_message_size: Some(max_message_bytes),
                max_frame_size: Some(max_message_bytes),
                ..Default::default()
            };

            let (stream, _) = connect_async_with_config(request, Some(ws_config), false).await?;
            Ok(WsSession {
                stream,
                peer_closed: false,
                closed: false,
            })
        }
    }
}

pub struct WsSession {
    stream: TelemetryWsStream,
    /// The peer sent its close frame; our reply is queued but not yet flushed.
    peer_closed: bool,
    closed: bool,
}

impl Session for WsSession {
    fn next_frame(&mut self) -> impl Future<Output = Option<Result<Frame, AppError>>> + Send {
        async move {
            loop {
                let message = match self.stream.next().await? {
                    Ok(message) => message,
                    Err(error) => return Some(Err(error.into())),
                };

                match message {
                    Message::Text(text) => return Some(Ok(Frame::Text(text))),
                    Message::Binary(bytes) => return Some(Ok(Frame::Binary(bytes))),
                    Message::Close(_) => {
                        self.peer_closed = true;
                        return Some(Ok(Frame::Close));
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                }
            }
        }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            if self.closed {
                return;
            }
            self.closed = true;

            // After a peer close this only flushes the queued reply.
            match self.stream.close(None).await {
                Ok(()) => {}
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                    tracing::debug!(peer_closed = self.peer_closed, "websocket already closed");
                }
                Err(error) => {
                    tracing::debug!(%error, "ignoring websocket close error");
                }
            }
        }
    }
}
