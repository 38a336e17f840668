//! Bolt framing over WebSocket binary frames.
//!
//! Browser drivers wrap the exact same chunked framing in WebSocket binary
//! frames, sometimes packing several complete Bolt messages into one frame
//! (RUN + PULL together is common). Chunk continuations may land in a later
//! frame, but a single chunk body never spans frames.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use super::MessageSink;
use crate::error::ProxyError;
use crate::message::{identify_type, Message, MessageKind};

/// Reads WebSocket frames and feeds the contained Bolt messages into `tx`.
pub(super) async fn read_loop<S>(
    mut ws_rx: SplitStream<WebSocketStream<S>>,
    tx: mpsc::Sender<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut chunking = false;

    while let Some(frame) = ws_rx.next().await {
        let mut payload = match frame {
            Ok(WsMessage::Binary(payload)) => payload,
            Ok(WsMessage::Close(_)) => {
                tracing::debug!("bolt websocket connection hung up");
                return;
            }
            Ok(other) => {
                tracing::warn!(opcode = %ws_opcode(&other), "unsupported websocket frame");
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "websocket bolt connection disconnect");
                return;
            }
        };

        let messages = match split_frame_payload(&payload, &mut chunking) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(error = %e, "bad bolt payload in websocket frame");
                return;
            }
        };
        // Scrub the frame buffer; HELLO payloads carry credentials.
        payload.fill(0xFF);

        for message in messages {
            if tx.send(message).await.is_err() {
                return;
            }
        }
    }
    tracing::debug!("bolt websocket stream ended");
}

fn ws_opcode(msg: &WsMessage) -> &'static str {
    match msg {
        WsMessage::Text(_) => "text",
        WsMessage::Binary(_) => "binary",
        WsMessage::Ping(_) => "ping",
        WsMessage::Pong(_) => "pong",
        WsMessage::Close(_) => "close",
        WsMessage::Frame(_) => "raw",
    }
}

/// Splits a binary frame payload into the Bolt messages it contains.
///
/// A chunk followed by the `00 00` terminator is complete (length prefix +
/// body + terminator); a chunk followed by anything else leaves the message
/// in progress, and every follow-up chunk is emitted as CHUNKED until a
/// terminator lands. `chunking` carries that state across frames. Only the
/// first chunk's signature byte determines the reported kind.
pub fn split_frame_payload(
    payload: &[u8],
    chunking: &mut bool,
) -> Result<Vec<Message>, ProxyError> {
    let mut messages = Vec::new();
    let mut pos = 0;

    while pos < payload.len() {
        if payload.len() - pos < 2 {
            return Err(ProxyError::Malformed(
                "chunk header split across websocket frames".into(),
            ));
        }
        let chunk_len = u16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
        let body_end = pos + 2 + chunk_len;
        if body_end > payload.len() {
            return Err(ProxyError::Truncated(format!(
                "chunk of {chunk_len} bytes crosses websocket frame boundary"
            )));
        }

        let terminated = payload.get(body_end..body_end + 2) == Some(&[0x00, 0x00]);
        let size = if terminated { chunk_len + 4 } else { chunk_len + 2 };

        let data = &payload[pos..pos + size];
        let kind = if *chunking {
            MessageKind::Chunked
        } else {
            identify_type(data)
        };
        *chunking = !terminated;

        messages.push(Message::new(kind, Bytes::copy_from_slice(data)));
        pos += size;
    }

    Ok(messages)
}

/// Write half of a WebSocket connection.
pub(super) struct WsSink<S> {
    ws_tx: SplitSink<WebSocketStream<S>, WsMessage>,
}

impl<S> WsSink<S> {
    pub(super) fn new(ws_tx: SplitSink<WebSocketStream<S>, WsMessage>) -> Self {
        Self { ws_tx }
    }
}

#[async_trait]
impl<S> MessageSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_message(&mut self, msg: &Message) -> Result<(), ProxyError> {
        self.ws_tx.send(WsMessage::Binary(msg.data.to_vec())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ProxyError> {
        self.ws_tx.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(payload: &[u8]) -> Result<Vec<Message>, ProxyError> {
        let mut chunking = false;
        split_frame_payload(payload, &mut chunking)
    }

    #[test]
    fn empty_payload_is_empty() {
        assert!(split(&[]).unwrap().is_empty());
    }

    #[test]
    fn single_message() {
        let record = [0x00, 0x04, 0xB1, 0x71, 0x91, 0x01, 0x00, 0x00];
        let messages = split(&record).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Record);
        assert_eq!(&messages[0].data[..], &record);
    }

    #[test]
    fn run_and_pull_in_one_frame() {
        let mut payload = Vec::new();
        let run = [0x00, 0x03, 0xB1, 0x10, 0x80, 0x00, 0x00];
        let pull = [0x00, 0x03, 0xB1, 0x3F, 0xA0, 0x00, 0x00];
        payload.extend_from_slice(&run);
        payload.extend_from_slice(&pull);

        let messages = split(&payload).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageKind::Run);
        assert_eq!(&messages[0].data[..], &run);
        assert_eq!(messages[1].kind, MessageKind::Pull);
        assert_eq!(&messages[1].data[..], &pull);
    }

    #[test]
    fn chunked_pair_in_one_frame() {
        let payload = [
            0x00, 0x04, 0xB1, 0x10, 0xAA, 0xBB, // chunk 1
            0x00, 0x04, 0xCC, 0xDD, 0xEE, 0xFF, // chunk 2
            0x00, 0x00, // terminator
        ];
        let messages = split(&payload).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageKind::Run);
        assert_eq!(messages[0].data.len(), 6);
        assert_eq!(messages[1].kind, MessageKind::Chunked);
        assert_eq!(messages[1].data.len(), 8);

        let mut rejoined = messages[0].data.to_vec();
        rejoined.extend_from_slice(&messages[1].data);
        assert_eq!(&rejoined, &payload);
    }

    #[test]
    fn chunking_state_spans_frames() {
        let mut chunking = false;

        // Frame 1 ends with an unterminated chunk.
        let first = split_frame_payload(
            &[0x00, 0x03, 0xB1, 0x10, 0x80],
            &mut chunking,
        )
        .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, MessageKind::Run);
        assert!(chunking);

        // Frame 2 carries the continuation and the terminator.
        let second =
            split_frame_payload(&[0x00, 0x02, 0xAB, 0xCD, 0x00, 0x00], &mut chunking).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind, MessageKind::Chunked);
        assert!(!chunking);
    }

    #[test]
    fn chunk_crossing_frame_is_truncated() {
        // Announces 16 bytes but the frame ends after 4.
        let payload = [0x00, 0x10, 0x01, 0x02, 0x03, 0x04];
        assert!(matches!(split(&payload), Err(ProxyError::Truncated(_))));
    }

    #[test]
    fn stray_header_byte_is_malformed() {
        let payload = [0x00, 0x02, 0xB0, 0x0F, 0x00, 0x00, 0x07];
        assert!(matches!(split(&payload), Err(ProxyError::Malformed(_))));
    }
}
