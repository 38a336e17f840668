//! Framed Bolt connections.
//!
//! A [`BoltConn`] adapts a byte stream into a FIFO stream of [`Message`]s
//! plus a serialized write half. An internal reader task feeds the stream;
//! it ends (closing the channel) when the peer hangs up or the bytes stop
//! making sense. Two concrete transports exist: direct TCP chunking and
//! Bolt-over-WebSocket.

pub mod direct;
pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::WebSocketStream;

use crate::error::ProxyError;
use crate::message::Message;

/// Inbound messages buffered per connection before backpressure kicks in.
const CHANNEL_CAPACITY: usize = 32;

/// The write half of a framed connection.
///
/// `write_message` puts `message.data` on the wire verbatim, wrapped in a
/// binary frame for WebSocket transports.
#[async_trait]
pub trait MessageSink: Send {
    async fn write_message(&mut self, msg: &Message) -> Result<(), ProxyError>;
    async fn close(&mut self) -> Result<(), ProxyError>;
}

/// A cloneable handle to a connection's write half.
///
/// The mutex serializes writers: the session loop and the server-side
/// forwarding task never write to the same connection by construction, but
/// the canned replies sent during session setup share the client sink with
/// later forwarding tasks.
#[derive(Clone)]
pub struct SharedSink {
    inner: Arc<Mutex<Box<dyn MessageSink>>>,
}

impl SharedSink {
    fn new(sink: impl MessageSink + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub async fn write_message(&self, msg: &Message) -> Result<(), ProxyError> {
        self.inner.lock().await.write_message(msg).await
    }

    pub async fn close(&self) -> Result<(), ProxyError> {
        self.inner.lock().await.close().await
    }
}

/// A framed Bolt connection: message stream plus write half.
pub struct BoltConn {
    messages: mpsc::Receiver<Message>,
    sink: SharedSink,
}

impl BoltConn {
    /// Wraps a raw byte stream carrying chunked Bolt framing.
    pub fn direct<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(direct::read_loop(read_half, tx));
        Self {
            messages: rx,
            sink: SharedSink::new(direct::DirectSink::new(write_half)),
        }
    }

    /// Wraps an upgraded WebSocket stream carrying Bolt in binary frames.
    pub fn websocket<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        use futures_util::StreamExt;

        let (ws_tx, ws_rx) = ws.split();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(websocket::read_loop(ws_rx, tx));
        Self {
            messages: rx,
            sink: SharedSink::new(websocket::WsSink::new(ws_tx)),
        }
    }

    /// Receives the next inbound message. `None` means the peer hung up or
    /// the reader stopped on a protocol error.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    /// Clones a handle to the write half.
    pub fn sink(&self) -> SharedSink {
        self.sink.clone()
    }

    pub async fn write_message(&self, msg: &Message) -> Result<(), ProxyError> {
        self.sink.write_message(msg).await
    }

    /// Splits into the message stream and the write half, for handing the
    /// read side to a forwarding task.
    pub fn split(self) -> (mpsc::Receiver<Message>, SharedSink) {
        (self.messages, self.sink)
    }
}
