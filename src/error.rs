//! Error types for the proxy.

/// Errors that can occur while proxying Bolt traffic.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Bad magic, unknown PackStream marker, or an otherwise unparseable frame.
    #[error("malformed protocol data: {0}")]
    Malformed(String),

    /// A buffer ended before the announced length was available.
    #[error("truncated protocol data: {0}")]
    Truncated(String),

    /// Valid Bolt that this proxy does not handle (floats, non-binary
    /// WebSocket opcodes, ...).
    #[error("unsupported protocol feature: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("configuration error: {0}")]
    Config(String),
}
