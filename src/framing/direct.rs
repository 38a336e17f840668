//! Chunked Bolt framing over a raw byte stream.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::MessageSink;
use crate::error::ProxyError;
use crate::message::{identify_type, Message, MessageKind};

/// Reads framed messages and feeds them into `tx` until hangup.
///
/// Each message is `<u16 BE length><body>` repeated, ended by a zero-length
/// chunk (`00 00`). After reading a chunk body the reader takes two more
/// bytes: either the terminator (message complete, terminator kept in the
/// emitted data) or the length of a follow-up chunk, which is emitted as a
/// separate message of kind CHUNKED. Only the first chunk's signature byte
/// determines the reported kind.
pub(super) async fn read_loop<R>(mut reader: R, tx: mpsc::Sender<Message>)
where
    R: AsyncRead + Unpin,
{
    // The working buffer is scrubbed with 0xFF between messages so auth
    // secrets do not linger and stale zeros cannot look like terminators.
    let mut buf: Vec<u8> = Vec::new();
    let mut pending_header: Option<[u8; 2]> = None;
    let mut chunking = false;

    loop {
        let header = match pending_header.take() {
            Some(h) => h,
            None => {
                let mut h = [0u8; 2];
                match reader.read_exact(&mut h).await {
                    Ok(_) => h,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        tracing::debug!("direct bolt connection hung up");
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "direct bolt connection disconnect");
                        return;
                    }
                }
            }
        };

        let chunk_len = u16::from_be_bytes(header) as usize;
        buf.resize(2 + chunk_len + 2, 0xFF);
        buf[..2].copy_from_slice(&header);

        if let Err(e) = reader.read_exact(&mut buf[2..2 + chunk_len]).await {
            tracing::debug!(error = %e, "short read inside chunk body");
            return;
        }
        // Two more bytes: terminator, or the next chunk's length.
        if let Err(e) = reader.read_exact(&mut buf[2 + chunk_len..]).await {
            tracing::debug!(error = %e, "short read after chunk body");
            return;
        }

        let terminated = buf[2 + chunk_len..] == [0x00, 0x00];
        let data_len = if terminated { 2 + chunk_len + 2 } else { 2 + chunk_len };

        let kind = if chunking {
            MessageKind::Chunked
        } else {
            identify_type(&buf[..data_len])
        };

        if terminated {
            chunking = false;
        } else {
            chunking = true;
            pending_header = Some([buf[2 + chunk_len], buf[2 + chunk_len + 1]]);
        }

        let data = Bytes::copy_from_slice(&buf[..data_len]);
        buf.fill(0xFF);

        if tx.send(Message::new(kind, data)).await.is_err() {
            // Consumer dropped the connection.
            return;
        }
    }
}

/// Write half of a direct connection.
pub(super) struct DirectSink<W> {
    writer: W,
}

impl<W> DirectSink<W> {
    pub(super) fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> MessageSink for DirectSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_message(&mut self, msg: &Message) -> Result<(), ProxyError> {
        self.writer.write_all(&msg.data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ProxyError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
