//! PackStream decoding: bytes → [`Value`].
//!
//! Every parser returns the decoded value together with the number of bytes
//! it consumed, so callers can walk concatenated values positionally (the
//! HELLO body is a string followed by a map, a RUN body is a string followed
//! by two maps, and so on).

use super::marker;
use super::value::{Map, Value};
use crate::error::ProxyError;

fn need(buf: &[u8], count: usize, what: &str) -> Result<(), ProxyError> {
    if buf.len() < count {
        Err(ProxyError::Truncated(format!(
            "{what}: need {count} bytes, have {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

/// Reads a big-endian unsigned length of `width` bytes at `buf[pos..]`.
fn read_len(buf: &[u8], pos: usize, width: usize) -> Result<(usize, usize), ProxyError> {
    need(&buf[pos..], width, "length prefix")?;
    let mut len = 0usize;
    for &b in &buf[pos..pos + width] {
        len = (len << 8) | b as usize;
    }
    Ok((len, pos + width))
}

/// Parses a 7-bit non-negative tiny int.
pub fn parse_tiny_int(buf: &[u8]) -> Result<(i64, usize), ProxyError> {
    need(buf, 1, "tiny int")?;
    if buf[0] > 0x7F {
        return Err(ProxyError::Malformed(format!(
            "expected tiny int, got marker 0x{:02X}",
            buf[0]
        )));
    }
    Ok((i64::from(buf[0]), 1))
}

/// Parses a sized signed integer (`INT_8` through `INT_64`).
pub fn parse_int(buf: &[u8]) -> Result<(i64, usize), ProxyError> {
    need(buf, 2, "int")?;
    match buf[0] {
        marker::INT_8 => Ok((i64::from(buf[1] as i8), 2)),
        marker::INT_16 => {
            need(buf, 3, "int16")?;
            Ok((i64::from(i16::from_be_bytes([buf[1], buf[2]])), 3))
        }
        marker::INT_32 => {
            need(buf, 5, "int32")?;
            Ok((
                i64::from(i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]])),
                5,
            ))
        }
        marker::INT_64 => {
            need(buf, 9, "int64")?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[1..9]);
            Ok((i64::from_be_bytes(raw), 9))
        }
        m => Err(ProxyError::Malformed(format!(
            "expected int marker, got 0x{m:02X}"
        ))),
    }
}

/// Parses a string (tiny or `STRING_8/16/32`).
pub fn parse_string(buf: &[u8]) -> Result<(String, usize), ProxyError> {
    need(buf, 1, "string")?;
    let m = buf[0];

    let (len, pos) = if m >> 4 == 0x8 {
        ((m & 0x0F) as usize, 1)
    } else {
        match m {
            marker::STRING_8 => read_len(buf, 1, 1)?,
            marker::STRING_16 => read_len(buf, 1, 2)?,
            marker::STRING_32 => read_len(buf, 1, 4)?,
            _ => {
                return Err(ProxyError::Malformed(format!(
                    "expected string marker, got 0x{m:02X}"
                )));
            }
        }
    };

    need(&buf[pos..], len, "string body")?;
    let s = std::str::from_utf8(&buf[pos..pos + len])
        .map_err(|e| ProxyError::Malformed(format!("invalid UTF-8 string: {e}")))?;
    Ok((s.to_owned(), pos + len))
}

/// Parses a list (tiny or `LIST_8/16/32`).
pub fn parse_array(buf: &[u8]) -> Result<(Vec<Value>, usize), ProxyError> {
    need(buf, 1, "list")?;
    let m = buf[0];

    let (size, mut pos) = if m >> 4 == 0x9 {
        ((m & 0x0F) as usize, 1)
    } else {
        match m {
            marker::LIST_8 => read_len(buf, 1, 1)?,
            marker::LIST_16 => read_len(buf, 1, 2)?,
            marker::LIST_32 => read_len(buf, 1, 4)?,
            _ => {
                return Err(ProxyError::Malformed(format!(
                    "expected list marker, got 0x{m:02X}"
                )));
            }
        }
    };

    let mut items = Vec::with_capacity(size.min(64));
    for _ in 0..size {
        let (item, n) = parse_value(&buf[pos..])?;
        items.push(item);
        pos += n;
    }
    Ok((items, pos))
}

/// Parses a string-keyed map (tiny or `MAP_8/16/32`).
pub fn parse_map(buf: &[u8]) -> Result<(Map, usize), ProxyError> {
    need(buf, 1, "map")?;
    let m = buf[0];

    let (size, mut pos) = if m >> 4 == 0xA {
        ((m & 0x0F) as usize, 1)
    } else {
        match m {
            marker::MAP_8 => read_len(buf, 1, 1)?,
            marker::MAP_16 => read_len(buf, 1, 2)?,
            marker::MAP_32 => read_len(buf, 1, 4)?,
            _ => {
                return Err(ProxyError::Malformed(format!(
                    "expected map marker, got 0x{m:02X}"
                )));
            }
        }
    };

    let mut map = Map::with_capacity(size.min(64));
    for _ in 0..size {
        let (key, n) = parse_string(&buf[pos..])?;
        pos += n;
        let (value, n) = parse_value(&buf[pos..])?;
        pos += n;
        map.insert(key, value);
    }
    Ok((map, pos))
}

/// Parses any supported value, dispatching on the marker byte.
fn parse_value(buf: &[u8]) -> Result<(Value, usize), ProxyError> {
    need(buf, 1, "value")?;
    let m = buf[0];
    match m {
        0x00..=0x7F => {
            let (i, n) = parse_tiny_int(buf)?;
            Ok((Value::Integer(i), n))
        }
        marker::NULL => Ok((Value::Null, 1)),
        marker::FALSE => Ok((Value::Boolean(false), 1)),
        marker::TRUE => Ok((Value::Boolean(true), 1)),
        marker::FLOAT_64 => Err(ProxyError::Unsupported("float value".into())),
        marker::INT_8..=marker::INT_64 => {
            let (i, n) = parse_int(buf)?;
            Ok((Value::Integer(i), n))
        }
        _ if m >> 4 == 0x8 => {
            let (s, n) = parse_string(buf)?;
            Ok((Value::String(s), n))
        }
        marker::STRING_8..=marker::STRING_32 => {
            let (s, n) = parse_string(buf)?;
            Ok((Value::String(s), n))
        }
        _ if m >> 4 == 0x9 => {
            let (items, n) = parse_array(buf)?;
            Ok((Value::List(items), n))
        }
        marker::LIST_8..=marker::LIST_32 => {
            let (items, n) = parse_array(buf)?;
            Ok((Value::List(items), n))
        }
        _ if m >> 4 == 0xA => {
            let (map, n) = parse_map(buf)?;
            Ok((Value::Map(map), n))
        }
        marker::MAP_8..=marker::MAP_32 => {
            let (map, n) = parse_map(buf)?;
            Ok((Value::Map(map), n))
        }
        _ => Err(ProxyError::Malformed(format!(
            "unknown PackStream marker: 0x{m:02X}"
        ))),
    }
}
