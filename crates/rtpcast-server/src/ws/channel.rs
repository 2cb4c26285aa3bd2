use crate::error::ChannelError;
use crate::signaling::{FrameReader, FrameWriter, Inbound, MessageChannel};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

/// Signaling channel over an upgraded axum websocket
pub struct WebSocketChannel {
    socket: WebSocket,
}

impl WebSocketChannel {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl MessageChannel for WebSocketChannel {
    type Writer = WebSocketWriter;
    type Reader = WebSocketReader;

    fn split(self) -> (WebSocketWriter, WebSocketReader) {
        let (sink, stream) = self.socket.split();
        (WebSocketWriter { sink }, WebSocketReader { stream })
    }
}

pub struct WebSocketWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameWriter for WebSocketWriter {
    async fn send(&mut self, frame: String) -> Result<(), ChannelError> {
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), ChannelError> {
        self.sink
            .send(Message::Ping(Default::default()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.send(Message::Close(None)).await {
            tracing::debug!("WebSocket already closed: {}", e);
        }
    }
}

pub struct WebSocketReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WebSocketReader {
    async fn receive(&mut self) -> Option<Result<Inbound, ChannelError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Inbound::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(_)) => return Some(Err(ChannelError::UnexpectedBinary)),
                Ok(Message::Pong(_)) => return Some(Ok(Inbound::Pong)),
                // axum answers pings itself
                Ok(Message::Ping(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(ChannelError::Transport(e.to_string()))),
            }
        }
    }
}
