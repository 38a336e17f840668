//! boltgate — a transparent proxy for the Bolt protocol.
//!
//! Clients speak Bolt (raw TCP or Bolt-over-WebSocket) to the proxy; the
//! proxy intercepts the HELLO for authentication, opens one connection per
//! session to a single upstream Neo4j- or Memgraph-compatible database, and
//! shuttles messages verbatim in both directions. The listening port also
//! answers `GET /health` for liveness probes.
//!
//! # Architecture
//!
//! - **`packstream`** — binary value encoding/decoding (PackStream format)
//! - **`message`** — message typing over raw framed bytes
//! - **`framing`** — byte streams → FIFO message streams (TCP and WebSocket)
//! - **`version`** — magic preamble and version negotiation
//! - **`dispatch`** — first-bytes transport demultiplexing
//! - **`backend`** — upstream connector and startup probe
//! - **`auth`** — pluggable HELLO authentication strategies
//! - **`session`** — the per-client proxy state machine

pub mod auth;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod health;
pub mod message;
pub mod packstream;
pub mod session;
pub mod tls;
pub mod version;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::backend::Backend;

/// Accepts clients forever; a bad connection only costs itself.
pub async fn serve(listener: TcpListener, acceptor: Option<TlsAcceptor>, backend: Arc<Backend>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
                continue;
            }
        };

        let backend = backend.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => dispatch::handle_client(stream, peer_addr, backend).await,
                    Err(e) => {
                        tracing::warn!(%peer_addr, error = %e, "TLS handshake failed");
                        return;
                    }
                },
                None => dispatch::handle_client(stream, peer_addr, backend).await,
            };
            match result {
                Ok(()) => tracing::debug!(%peer_addr, "goodbye to client"),
                Err(e) => tracing::debug!(%peer_addr, error = %e, "client session error"),
            }
        });
    }
}
