//! Client transport dispatch.
//!
//! Every accepted connection starts with four bytes that tell the proxy what
//! it is talking to: the Bolt magic preamble, `"GET "` (a health probe or a
//! WebSocket upgrade), or noise.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::backend::Backend;
use crate::error::ProxyError;
use crate::framing::BoltConn;
use crate::health;
use crate::session;
use crate::version::{self, Version, BOLT_MAGIC, HTTP_SIGNATURE};

/// Longest GET request the proxy will look at. Long user agents push the
/// upgrade request past 512 bytes, so allow a full KiB.
const MAX_REQUEST: usize = 1024;

/// Identifies the transport of a fresh client connection and runs it.
pub async fn handle_client<S>(
    mut stream: S,
    peer_addr: SocketAddr,
    backend: Arc<Backend>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;

    if head == BOLT_MAGIC {
        let mut offer = [0u8; 16];
        stream.read_exact(&mut offer).await?;

        let chosen = version::negotiate(&offer, &backend.version().to_bytes())?;
        stream.write_all(&chosen).await?;

        let client_version = Version::parse(&chosen)?;
        tracing::info!(%peer_addr, version = %client_version, "bolt client connected");
        session::run(BoltConn::direct(stream), client_version, backend).await
    } else if head == HTTP_SIGNATURE {
        let mut request = vec![0u8; MAX_REQUEST];
        request[..4].copy_from_slice(&head);
        let n = stream.read(&mut request[4..]).await?;
        request.truncate(4 + n);

        if health::is_health_check(&request) {
            return health::handle_health_check(&mut stream, &request).await;
        }

        let ws = upgrade_websocket(stream, &request).await?;
        let (ws, client_version) = websocket_handshake(ws, &backend).await?;
        tracing::info!(%peer_addr, version = %client_version, "bolt-over-websocket client connected");
        session::run(BoltConn::websocket(ws), client_version, backend).await
    } else {
        tracing::info!(%peer_addr, bytes = ?head, "client is speaking gibberish");
        Ok(())
    }
}

/// Completes the WebSocket upgrade from an already-consumed GET request.
async fn upgrade_websocket<S>(
    mut stream: S,
    request: &[u8],
) -> Result<WebSocketStream<S>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = websocket_key(request)?;
    let accept = derive_accept_key(key.as_bytes());
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;

    Ok(WebSocketStream::from_raw_socket(stream, Role::Server, None).await)
}

/// Extracts the `Sec-WebSocket-Key` of an upgrade request, verifying the
/// `Upgrade: websocket` header along the way.
fn websocket_key(request: &[u8]) -> Result<String, ProxyError> {
    let text = std::str::from_utf8(request)
        .map_err(|_| ProxyError::Malformed("GET request is not valid UTF-8".into()))?;

    let mut upgrade = false;
    let mut key = None;
    for line in text.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("upgrade") {
            upgrade = value.eq_ignore_ascii_case("websocket");
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.to_owned());
        }
    }

    if !upgrade {
        return Err(ProxyError::Malformed(
            "GET request is not a websocket upgrade".into(),
        ));
    }
    key.ok_or_else(|| ProxyError::Malformed("upgrade request has no Sec-WebSocket-Key".into()))
}

/// Runs the Bolt magic + version handshake inside WebSocket binary frames.
async fn websocket_handshake<S>(
    mut ws: WebSocketStream<S>,
    backend: &Backend,
) -> Result<(WebSocketStream<S>, Version), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = loop {
        match ws.next().await {
            Some(Ok(WsMessage::Binary(payload))) => break payload,
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(ProxyError::Malformed(
                    "websocket closed before bolt handshake".into(),
                ));
            }
            Some(Ok(_)) => {
                return Err(ProxyError::Unsupported(
                    "non-binary websocket frame during bolt handshake".into(),
                ));
            }
            Some(Err(e)) => return Err(e.into()),
        }
    };

    if payload.len() < 20 {
        return Err(ProxyError::Truncated(format!(
            "bolt handshake frame has {} bytes, need 20",
            payload.len()
        )));
    }
    version::validate_magic(&payload[..4])?;
    let chosen = version::negotiate(&payload[4..20], &backend.version().to_bytes())?;
    ws.send(WsMessage::Binary(chosen.to_vec())).await?;

    Ok((ws, Version::parse(&chosen)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_key_extracted() {
        let request = b"GET / HTTP/1.1\r\n\
            Host: proxy\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n";
        assert_eq!(
            websocket_key(request).unwrap(),
            "dGhlIHNhbXBsZSBub25jZQ=="
        );
    }

    #[test]
    fn missing_upgrade_header_rejected() {
        let request = b"GET / HTTP/1.1\r\n\
            Host: proxy\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        assert!(websocket_key(request).is_err());
    }

    #[test]
    fn missing_key_rejected() {
        let request = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n";
        assert!(websocket_key(request).is_err());
    }
}
