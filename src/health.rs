//! Minimal HTTP liveness endpoint, served on the Bolt listening port.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

const HEALTH_PREFIX: &[u8] = b"GET /health HTTP";
const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n";
const BAD_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n";

/// Checks whether a request buffer targets the health endpoint.
pub fn is_health_check(buf: &[u8]) -> bool {
    buf.starts_with(HEALTH_PREFIX)
}

/// Answers a health probe: `200 OK` for a well-formed request, otherwise
/// `400 Bad Request`. The connection is closed by the caller either way.
pub async fn handle_health_check<W>(conn: &mut W, buf: &[u8]) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    if is_valid_request(buf) {
        conn.write_all(OK_RESPONSE).await?;
        Ok(())
    } else {
        conn.write_all(BAD_RESPONSE).await?;
        Err(ProxyError::Malformed(
            "malformed http health check request".into(),
        ))
    }
}

/// Validates the request line: `GET <target> HTTP/<major>.<minor>`.
fn is_valid_request(buf: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(buf) else {
        return false;
    };
    let Some(line) = text.lines().next() else {
        return false;
    };

    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    if method != "GET" || target.is_empty() {
        return false;
    }
    let Some(digits) = version.strip_prefix("HTTP/") else {
        return false;
    };
    let mut digits = digits.split('.');
    let (Some(major), Some(minor), None) = (digits.next(), digits.next(), digits.next()) else {
        return false;
    };
    !major.is_empty()
        && !minor.is_empty()
        && major.bytes().all(|b| b.is_ascii_digit())
        && minor.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn respond(request: &[u8]) -> Vec<u8> {
        let (mut local, mut remote) = tokio::io::duplex(256);
        handle_health_check(&mut local, request).await.ok();
        drop(local);
        let mut out = Vec::new();
        remote.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn health_prefix() {
        assert!(is_health_check(b"GET /health HTTP/1.1\r\n\r\n"));
        assert!(!is_health_check(b"GET /other HTTP/1.1\r\n\r\n"));
        assert!(!is_health_check(b"POST /health HTTP/1.1\r\n\r\n"));
    }

    #[tokio::test]
    async fn well_formed_request_gets_200() {
        let out = respond(b"GET /health HTTP/1.1\r\n\r\n").await;
        assert_eq!(out, OK_RESPONSE);
    }

    #[tokio::test]
    async fn malformed_version_gets_400() {
        let out = respond(b"GET /health HTTP/xxxx\r\n\r\n").await;
        assert_eq!(out, BAD_RESPONSE);
    }

    #[tokio::test]
    async fn garbage_gets_400() {
        let out = respond(b"GET /health HTTP").await;
        assert_eq!(out, BAD_RESPONSE);
    }
}
