//! Order-preserving key encoding for index values
//!
//! Maps a field value to a string whose byte-wise order matches the value's
//! natural order within one type. Encodings of different types share one key
//! space but are not meant to be compared with each other.
//!
//! | Input      | Encoding                                                   |
//! |------------|------------------------------------------------------------|
//! | absent     | sentinel hash                                              |
//! | `Null`     | a different sentinel hash                                  |
//! | `Number`   | 16 hex digits of the sign-adjusted IEEE-754 bits           |
//! | `Date`     | the millisecond timestamp encoded like a number            |
//! | `Bool`     | `"0"` / `"1"`                                              |
//! | `String`   | the string itself                                          |
//! | `Array`    | escaped element encodings joined by [`ARRAY_SEPARATOR`]    |
//! | `Object`   | SHA-256 of the canonical MessagePack serialization         |
//! | `Bytes`    | rejected                                                   |
//!
//! The encoding is one-way; nothing decodes keys back into values.

use crate::error::{Error, Result};
use crate::path::Resolved;
use crate::value::Value;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

/// Joins element encodings inside an array key
pub const ARRAY_SEPARATOR: char = '\u{1f}';

/// Escape marker for element encodings; never followed by anything but itself or `\u{1d}`
const ESCAPE: char = '\u{1e}';

/// Key of an empty array
pub const EMPTY_ARRAY: &str = "";

static UNDEFINED_KEY: Lazy<String> = Lazy::new(|| sha256_hex(b"nestdb/sentinel/undefined"));
static NULL_KEY: Lazy<String> = Lazy::new(|| sha256_hex(b"nestdb/sentinel/null"));

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Key used for a field path that resolves to nothing
pub fn undefined_key() -> &'static str {
    UNDEFINED_KEY.as_str()
}

/// Key used for an explicit `Null`
pub fn null_key() -> &'static str {
    NULL_KEY.as_str()
}

/// Encode the outcome of a field path resolution
pub fn encode(resolved: Resolved<'_>) -> Result<String> {
    match resolved {
        Resolved::Absent => Ok(undefined_key().to_string()),
        Resolved::Present(value) => encode_value(value),
    }
}

/// Encode a present value
pub fn encode_value(value: &Value) -> Result<String> {
    match value {
        Value::Null => Ok(null_key().to_string()),
        Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => encode_number(*n),
        Value::Date(ms) => encode_number(*ms as f64),
        Value::String(s) => Ok(s.clone()),
        Value::Array(items) => {
            let mut out = String::new();
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(ARRAY_SEPARATOR);
                }
                out.push_str(&encode_element(item)?);
            }
            Ok(out)
        }
        Value::Object(_) => {
            let canonical = rmp_serde::to_vec(value)?;
            Ok(sha256_hex(&canonical))
        }
        Value::Bytes(_) => Err(Error::encoding("byte values cannot be indexed")),
    }
}

/// Order-preserving encoding of a double.
///
/// Negative values have every bit flipped, non-negative values only the sign
/// bit, so the unsigned bit patterns sort like the numbers. `-0.0` is folded
/// into `0.0`.
pub fn encode_number(n: f64) -> Result<String> {
    if n.is_nan() {
        return Err(Error::encoding("NaN has no position in key order"));
    }
    let n = if n == 0.0 { 0.0 } else { n };
    let bits = n.to_bits();
    let ordered = if bits >> 63 == 1 {
        !bits
    } else {
        bits ^ (1 << 63)
    };
    Ok(format!("{:016x}", ordered))
}

/// Encoding of a value as it appears inside an array key
pub fn encode_element(value: &Value) -> Result<String> {
    Ok(escape(&encode_value(value)?))
}

fn escape(encoded: &str) -> String {
    if !encoded.contains([ARRAY_SEPARATOR, ESCAPE]) {
        return encoded.to_string();
    }
    let mut out = String::with_capacity(encoded.len() + 4);
    for c in encoded.chars() {
        match c {
            ESCAPE => {
                out.push(ESCAPE);
                out.push(ESCAPE);
            }
            ARRAY_SEPARATOR => {
                out.push(ESCAPE);
                out.push('\u{1d}');
            }
            other => out.push(other),
        }
    }
    out
}

/// Split an array key back into its escaped element encodings
pub fn split_array(encoded: &str) -> Vec<&str> {
    if encoded == EMPTY_ARRAY {
        return Vec::new();
    }
    encoded.split(ARRAY_SEPARATOR).collect()
}
