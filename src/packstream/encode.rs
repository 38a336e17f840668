//! PackStream encoding for the proxy's few hand-crafted responses.
//!
//! The encoder always picks the smallest prefix that holds the value, and
//! preserves map entry order: callers pass entries as a slice of pairs,
//! not a hash map.

use super::marker;
use super::value::Value;
use crate::error::ProxyError;

/// Encodes a string with the minimum sufficient length prefix.
pub fn string_to_bytes(s: &str) -> Vec<u8> {
    let data = s.as_bytes();
    let mut out = Vec::with_capacity(data.len() + 5);
    match data.len() {
        0..=15 => out.push(marker::TINY_STRING_NIBBLE | data.len() as u8),
        16..=0xFF => {
            out.push(marker::STRING_8);
            out.push(data.len() as u8);
        }
        0x100..=0xFFFF => {
            out.push(marker::STRING_16);
            out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        }
        _ => {
            out.push(marker::STRING_32);
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        }
    }
    out.extend_from_slice(data);
    out
}

/// Encodes a signed integer with the minimum sufficient representation.
pub fn int_to_bytes(i: i64) -> Vec<u8> {
    if (0..=0x7F).contains(&i) {
        vec![i as u8]
    } else if i64::from(i8::MIN) <= i && i <= i64::from(i8::MAX) {
        vec![marker::INT_8, i as i8 as u8]
    } else if i64::from(i16::MIN) <= i && i <= i64::from(i16::MAX) {
        let mut out = vec![marker::INT_16];
        out.extend_from_slice(&(i as i16).to_be_bytes());
        out
    } else if i64::from(i32::MIN) <= i && i <= i64::from(i32::MAX) {
        let mut out = vec![marker::INT_32];
        out.extend_from_slice(&(i as i32).to_be_bytes());
        out
    } else {
        let mut out = vec![marker::INT_64];
        out.extend_from_slice(&i.to_be_bytes());
        out
    }
}

/// Encodes a tiny map, preserving the entry order given.
///
/// Fails on more than 15 entries or on list values, neither of which the
/// proxy ever produces.
pub fn tiny_map_to_bytes(entries: &[(&str, Value)]) -> Result<Vec<u8>, ProxyError> {
    if entries.len() > 15 {
        return Err(ProxyError::Unsupported(format!(
            "too many keys for a tiny map: {}",
            entries.len()
        )));
    }

    let mut out = vec![marker::TINY_MAP_NIBBLE | entries.len() as u8];
    for (key, value) in entries {
        out.extend_from_slice(&string_to_bytes(key));
        value_to_bytes(value, &mut out)?;
    }
    Ok(out)
}

fn value_to_bytes(value: &Value, out: &mut Vec<u8>) -> Result<(), ProxyError> {
    match value {
        Value::Null => out.push(marker::NULL),
        Value::Boolean(false) => out.push(marker::FALSE),
        Value::Boolean(true) => out.push(marker::TRUE),
        Value::Integer(i) => out.extend_from_slice(&int_to_bytes(*i)),
        Value::String(s) => out.extend_from_slice(&string_to_bytes(s)),
        Value::Map(map) => {
            let entries: Vec<(&str, Value)> =
                map.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
            out.extend_from_slice(&tiny_map_to_bytes(&entries)?);
        }
        Value::List(_) => {
            return Err(ProxyError::Unsupported(
                "list values in encoded maps".into(),
            ));
        }
    }
    Ok(())
}
