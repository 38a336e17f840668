//! Upstream database connector.
//!
//! The proxy talks to exactly one backend instance. At startup it probes the
//! instance once (full version handshake plus an authenticated HELLO) to
//! learn the server's preferred Bolt version and fail fast on bad
//! configuration. Afterwards every client session gets its own upstream
//! connection opened with the client's HELLO replayed verbatim.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::auth::Authenticator;
use crate::error::ProxyError;
use crate::framing::BoltConn;
use crate::message::{identify_type, sig, Message, MessageKind};
use crate::packstream::{self, Value};
use crate::tls;
use crate::version::{Version, BOLT_MAGIC};

/// Versions offered to the upstream during the startup probe, newest first.
const SUPPORTED_VERSIONS: [Version; 4] = [
    Version::new(4, 4),
    Version::new(4, 3),
    Version::new(4, 2),
    Version::new(4, 1),
];

/// The single upstream Bolt endpoint.
pub struct Backend {
    endpoint: Endpoint,
    /// Present only for `+s` / `+ssc` schemes.
    upstream_tls: Option<UpstreamTls>,
    version: Version,
    auth: Option<Arc<dyn Authenticator>>,
}

struct UpstreamTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl UpstreamTls {
    async fn dial(
        &self,
        address: &str,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ProxyError> {
        let tcp = TcpStream::connect(address).await?;
        Ok(self.connector.connect(self.server_name.clone(), tcp).await?)
    }
}

/// A parsed upstream URI.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    hostname: String,
    /// `host:port` dial target.
    address: String,
    tls: bool,
}

impl Endpoint {
    fn parse(uri: &str) -> Result<Self, ProxyError> {
        let url = url::Url::parse(uri)
            .map_err(|e| ProxyError::Config(format!("invalid bolt uri `{uri}`: {e}")))?;

        let tls = match url.scheme() {
            "bolt" | "neo4j" => false,
            "bolt+s" | "bolt+ssc" | "neo4j+s" | "neo4j+ssc" => true,
            other => {
                return Err(ProxyError::Config(format!(
                    "invalid bolt connection scheme `{other}`"
                )));
            }
        };

        let hostname = url
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("bolt uri `{uri}` has no host")))?
            .to_owned();
        let port = url.port().unwrap_or(7687);

        Ok(Self {
            address: format!("{hostname}:{port}"),
            hostname,
            tls,
        })
    }
}

impl Backend {
    /// Parses the upstream URI and probes the server once.
    ///
    /// The probe verifies reachability and the configured credentials, and
    /// records the version the server picked from our full offer; that
    /// version is what client handshakes are negotiated against.
    pub async fn connect(
        uri: &str,
        username: &str,
        password: &str,
        auth: Option<Arc<dyn Authenticator>>,
    ) -> Result<Self, ProxyError> {
        let endpoint = Endpoint::parse(uri)?;
        let upstream_tls = if endpoint.tls {
            let server_name = ServerName::try_from(endpoint.hostname.clone())
                .map_err(|e| ProxyError::Config(format!("bad upstream host name: {e}")))?;
            Some(UpstreamTls {
                connector: tls::upstream_connector(),
                server_name,
            })
        } else {
            None
        };

        let hello = build_probe_hello(username, password)?;
        let version = match &upstream_tls {
            Some(tls) => probe(tls.dial(&endpoint.address).await?, &hello).await?,
            None => probe(TcpStream::connect(&endpoint.address).await?, &hello).await?,
        };

        tracing::info!(address = %endpoint.address, %version, "probed backend");
        Ok(Self {
            endpoint,
            upstream_tls,
            version,
            auth,
        })
    }

    /// The Bolt version the backend prefers.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The `host:port` this backend dials.
    pub fn address(&self) -> &str {
        &self.endpoint.address
    }

    /// Parses a client HELLO (agent string, then auth map) and runs the
    /// configured authenticator over the auth fields. Without an
    /// authenticator every client is accepted.
    pub async fn authenticate(&self, hello: &Message) -> Result<(), ProxyError> {
        let body = hello
            .data
            .get(4..)
            .ok_or_else(|| ProxyError::Truncated("HELLO message too short".into()))?;
        let (agent, pos) = packstream::parse_string(body)?;
        let (auth_map, _) = packstream::parse_map(&body[pos..])?;
        tracing::debug!(agent = %agent, "client hello");

        match &self.auth {
            Some(auth) => auth.authenticate(&auth_map).await,
            None => Ok(()),
        }
    }

    /// Opens an upstream connection on behalf of a client: handshake with
    /// the known server version, replay the client's HELLO verbatim, and
    /// wrap the socket into a framed connection once the server says
    /// SUCCESS.
    pub async fn init_connection(&self, hello_data: &[u8]) -> Result<BoltConn, ProxyError> {
        match &self.upstream_tls {
            Some(tls) => {
                let stream = tls.dial(&self.endpoint.address).await?;
                self.init_on(stream, hello_data).await
            }
            None => {
                let stream = TcpStream::connect(&self.endpoint.address).await?;
                self.init_on(stream, hello_data).await
            }
        }
    }

    async fn init_on<S>(&self, mut stream: S, hello_data: &[u8]) -> Result<BoltConn, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut handshake = Vec::with_capacity(20);
        handshake.extend_from_slice(&BOLT_MAGIC);
        handshake.extend_from_slice(&self.version.to_bytes());
        handshake.extend_from_slice(&[0u8; 12]);
        stream.write_all(&handshake).await?;

        // The server answers with its chosen version, exactly 4 bytes.
        let mut chosen = [0u8; 4];
        stream.read_exact(&mut chosen).await?;

        stream.write_all(hello_data).await?;

        let reply = read_framed_message(&mut stream).await?;
        match reply.kind {
            MessageKind::Success => Ok(BoltConn::direct(stream)),
            MessageKind::Failure => {
                let (map, _) = packstream::parse_map(&reply.data[4..])?;
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("backend rejected HELLO")
                    .to_owned();
                let _ = stream.shutdown().await;
                Err(ProxyError::AuthRejected(message))
            }
            other => {
                let _ = stream.write_all(&Message::goodbye().data).await;
                let _ = stream.shutdown().await;
                Err(ProxyError::Malformed(format!(
                    "unexpected reply to HELLO: {other}"
                )))
            }
        }
    }
}

/// Performs the startup probe on a fresh upstream socket.
async fn probe<S>(mut stream: S, hello: &[u8]) -> Result<Version, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Vec::with_capacity(20);
    handshake.extend_from_slice(&BOLT_MAGIC);
    for v in SUPPORTED_VERSIONS {
        handshake.extend_from_slice(&v.to_bytes());
    }
    stream.write_all(&handshake).await?;

    let mut chosen = [0u8; 4];
    stream.read_exact(&mut chosen).await?;
    let version = Version::parse(&chosen)?;
    if version.major == 0 && version.minor == 0 {
        return Err(ProxyError::Config(
            "backend rejected every offered bolt version".into(),
        ));
    }

    stream.write_all(hello).await?;
    let reply = read_framed_message(&mut stream).await?;
    match reply.kind {
        MessageKind::Success => {
            let _ = stream.write_all(&Message::goodbye().data).await;
            Ok(version)
        }
        MessageKind::Failure => {
            let (map, _) = packstream::parse_map(&reply.data[4..])?;
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("backend rejected probe HELLO")
                .to_owned();
            Err(ProxyError::AuthRejected(message))
        }
        other => Err(ProxyError::Malformed(format!(
            "unexpected reply to probe HELLO: {other}"
        ))),
    }
}

/// Builds the framed HELLO used by the startup probe: agent string plus an
/// auth map, `basic` when a password is configured and `none` otherwise.
fn build_probe_hello(username: &str, password: &str) -> Result<Vec<u8>, ProxyError> {
    let agent = concat!("boltgate/", env!("CARGO_PKG_VERSION"));
    let auth = if password.is_empty() {
        vec![("scheme", Value::from("none"))]
    } else {
        vec![
            ("scheme", Value::from("basic")),
            ("principal", Value::from(username)),
            ("credentials", Value::from(password)),
        ]
    };

    let mut body = vec![packstream::marker::TINY_STRUCT_NIBBLE | 2, sig::HELLO];
    body.extend_from_slice(&packstream::string_to_bytes(agent));
    body.extend_from_slice(&packstream::tiny_map_to_bytes(&auth)?);

    let mut framed = Vec::with_capacity(body.len() + 4);
    framed.extend_from_slice(&(body.len() as u16).to_be_bytes());
    framed.extend_from_slice(&body);
    framed.extend_from_slice(&[0x00, 0x00]);
    Ok(framed)
}

/// Reads one single-chunk framed message straight off a byte stream.
///
/// Handshake replies (SUCCESS / FAILURE on HELLO) always fit one chunk.
async fn read_framed_message<S>(stream: &mut S) -> Result<Message, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let len = u16::from_be_bytes(header) as usize;

    let mut data = vec![0u8; 2 + len + 2];
    data[..2].copy_from_slice(&header);
    stream.read_exact(&mut data[2..]).await?;

    if data[2 + len..] != [0x00, 0x00] {
        return Err(ProxyError::Malformed(
            "chunked reply where a single frame was expected".into(),
        ));
    }
    let kind = identify_type(&data);
    Ok(Message::new(kind, data))
}
