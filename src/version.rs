//! Bolt magic preamble and version negotiation.

use std::fmt;

use crate::error::ProxyError;

/// Bolt magic preamble bytes.
pub const BOLT_MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// HTTP GET preamble bytes (`"GET "`), used for transport demultiplexing.
pub const HTTP_SIGNATURE: [u8; 4] = [0x47, 0x45, 0x54, 0x20];

/// A Bolt protocol version.
///
/// On the wire a version is 4 bytes big-endian: `00 00 minor major`.
/// The patch level is carried for display but never negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self {
            major,
            minor,
            patch: 0,
        }
    }

    /// Parses a 4-byte wire version (`00 00 minor major`).
    pub fn parse(buf: &[u8]) -> Result<Self, ProxyError> {
        if buf.len() < 4 {
            return Err(ProxyError::Truncated("version needs 4 bytes".into()));
        }
        Ok(Self {
            major: buf[3],
            minor: buf[2],
            patch: buf[1],
        })
    }

    /// Encodes this version in its 4-byte wire form.
    pub fn to_bytes(self) -> [u8; 4] {
        [0x00, 0x00, self.minor, self.major]
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Checks a buffer for the Bolt magic preamble.
pub fn validate_magic(magic: &[u8]) -> Result<(), ProxyError> {
    if magic.len() < 4 {
        return Err(ProxyError::Truncated("magic too short".into()));
    }
    if magic[..4] != BOLT_MAGIC {
        return Err(ProxyError::Malformed(format!(
            "invalid magic bytes: {:02X?}",
            &magic[..4]
        )));
    }
    Ok(())
}

/// Picks the version to hand back to the client.
///
/// The client offers four 4-byte candidates (16 bytes); `server` is the
/// single version the upstream already chose. The result is
/// `min(max(client candidates), server)` ordered by (major, minor).
/// Patch and range bytes are ignored.
pub fn negotiate(client: &[u8], server: &[u8]) -> Result<[u8; 4], ProxyError> {
    if client.len() != 16 {
        return Err(ProxyError::Malformed(format!(
            "client handshake wrong size: {}",
            client.len()
        )));
    }
    if server.len() != 4 {
        return Err(ProxyError::Malformed(format!(
            "server handshake wrong size: {}",
            server.len()
        )));
    }

    // max(client candidates) by (major = byte 3, minor = byte 2)
    let mut best: &[u8] = &[0x00, 0x00, 0x00, 0x00];
    for candidate in client.chunks_exact(4) {
        if candidate[3] > best[3] || (candidate[3] == best[3] && candidate[2] > best[2]) {
            best = candidate;
        }
    }

    let chosen = if best[3] > server[3] {
        // Client is ahead on major: fall back to the server's version.
        server
    } else if best[3] == server[3] && best[2] > server[2] {
        server
    } else {
        best
    };

    let mut out = [0u8; 4];
    out.copy_from_slice(chosen);
    Ok(out)
}
