//! A small, dependency-free bencode (BEP 3) decoder and encoder.
//!
//! Bencode has four value types: byte strings, signed arbitrary-precision
//! integers (we use `i64`, which is sufficient for any real torrent field),
//! lists, and dictionaries with byte-string keys. We decode dictionaries into
//! a `BTreeMap<Vec<u8>, Value>` so that key order is sorted as a side effect
//! of construction, matching the canonical encoding rule in spec.md §4.1.
//!
//! Unlike a serde-based codec, this module hands back the exact byte range a
//! decoded value occupied in the input, which `metainfo.rs` relies on to
//! reproduce the `info` dict's raw bytes for info-hash hashing.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    ByteString(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::ByteString(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(key.as_bytes())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),
    #[error("invalid integer at offset {0}")]
    InvalidInteger(usize),
    #[error("leading zero in integer at offset {0}")]
    LeadingZero(usize),
    #[error("invalid byte string length at offset {0}")]
    InvalidStringLen(usize),
    #[error("dict keys out of order or duplicated at offset {0}")]
    UnsortedOrDuplicateKey(usize),
    #[error("dict key is not a byte string at offset {0}")]
    NonStringKey(usize),
    #[error("unrecognized value tag {0:?} at offset {1}")]
    UnknownTag(u8, usize),
    #[error("trailing bytes after top-level value, starting at offset {0}")]
    TrailingBytes(usize),
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Decodes a single top-level bencoded value, failing if there are any
/// trailing bytes afterward.
pub fn decode(input: &[u8]) -> DecodeResult<Value> {
    let mut pos = 0;
    let value = decode_value(input, &mut pos)?;
    if pos != input.len() {
        return Err(DecodeError::TrailingBytes(pos));
    }
    Ok(value)
}

/// Decodes a value and also returns the exact byte span (start, end) of the
/// slice of `input` it was parsed from, without requiring the whole buffer
/// be consumed. Used to recover the raw `info` dict bytes.
pub fn decode_with_span(input: &[u8], start: usize) -> DecodeResult<(Value, usize, usize)> {
    let mut pos = start;
    let value = decode_value(input, &mut pos)?;
    Ok((value, start, pos))
}

fn decode_value(input: &[u8], pos: &mut usize) -> DecodeResult<Value> {
    match peek(input, *pos)? {
        b'i' => decode_integer(input, pos),
        b'l' => decode_list(input, pos),
        b'd' => decode_dict(input, pos),
        b'0'..=b'9' => decode_bytestring(input, pos),
        other => Err(DecodeError::UnknownTag(other, *pos)),
    }
}

fn peek(input: &[u8], pos: usize) -> DecodeResult<u8> {
    input.get(pos).copied().ok_or(DecodeError::UnexpectedEof(pos))
}

fn decode_integer(input: &[u8], pos: &mut usize) -> DecodeResult<Value> {
    let start = *pos;
    debug_assert_eq!(input[*pos], b'i');
    *pos += 1;
    let digits_start = *pos;
    let end = find(input, b'e', *pos).ok_or(DecodeError::UnexpectedEof(start))?;
    let raw = &input[digits_start..end];
    validate_integer_digits(raw, start)?;
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidInteger(start))?;
    let value: i64 = text.parse().map_err(|_| DecodeError::InvalidInteger(start))?;
    *pos = end + 1;
    Ok(Value::Integer(value))
}

fn validate_integer_digits(raw: &[u8], start: usize) -> DecodeResult<()> {
    if raw.is_empty() {
        return Err(DecodeError::InvalidInteger(start));
    }
    let (sign, digits) = if raw[0] == b'-' { (true, &raw[1..]) } else { (false, raw) };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::InvalidInteger(start));
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(DecodeError::LeadingZero(start));
    }
    // "-0" is not permitted.
    if sign && digits == b"0" {
        return Err(DecodeError::InvalidInteger(start));
    }
    Ok(())
}

fn decode_bytestring(input: &[u8], pos: &mut usize) -> DecodeResult<Value> {
    let start = *pos;
    let colon = find(input, b':', *pos).ok_or(DecodeError::UnexpectedEof(start))?;
    let len_raw = &input[*pos..colon];
    if len_raw.is_empty() || !len_raw.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::InvalidStringLen(start));
    }
    if len_raw.len() > 1 && len_raw[0] == b'0' {
        return Err(DecodeError::InvalidStringLen(start));
    }
    let len: usize = std::str::from_utf8(len_raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(DecodeError::InvalidStringLen(start))?;
    let data_start = colon + 1;
    let data_end = data_start
        .checked_add(len)
        .ok_or(DecodeError::InvalidStringLen(start))?;
    if data_end > input.len() {
        return Err(DecodeError::UnexpectedEof(start));
    }
    *pos = data_end;
    Ok(Value::ByteString(input[data_start..data_end].to_vec()))
}

fn decode_list(input: &[u8], pos: &mut usize) -> DecodeResult<Value> {
    debug_assert_eq!(input[*pos], b'l');
    *pos += 1;
    let mut items = Vec::new();
    loop {
        match peek(input, *pos)? {
            b'e' => {
                *pos += 1;
                break;
            }
            _ => items.push(decode_value(input, pos)?),
        }
    }
    Ok(Value::List(items))
}

fn decode_dict(input: &[u8], pos: &mut usize) -> DecodeResult<Value> {
    let start = *pos;
    debug_assert_eq!(input[*pos], b'd');
    *pos += 1;
    let mut map = BTreeMap::new();
    let mut last_key: Option<Vec<u8>> = None;
    loop {
        match peek(input, *pos)? {
            b'e' => {
                *pos += 1;
                break;
            }
            _ => {
                let key_pos = *pos;
                let key = match decode_value(input, pos)? {
                    Value::ByteString(b) => b,
                    _ => return Err(DecodeError::NonStringKey(key_pos)),
                };
                if let Some(prev) = &last_key {
                    if key <= *prev {
                        return Err(DecodeError::UnsortedOrDuplicateKey(key_pos));
                    }
                }
                let value = decode_value(input, pos)?;
                last_key = Some(key.clone());
                map.insert(key, value);
            }
        }
    }
    Ok(Value::Dict(map))
}

fn find(haystack: &[u8], needle: u8, from: usize) -> Option<usize> {
    haystack[from..].iter().position(|&b| b == needle).map(|i| i + from)
}

/// Encodes a value deterministically and byte-exactly: no leading zeros in
/// integers (except `0`), no `-0`, dict keys sorted lexicographically by raw
/// bytes (guaranteed by `BTreeMap`'s iteration order).
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::ByteString(b) => {
            write_usize(out, b.len());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::Integer(i) => {
            out.push(b'i');
            write_i64(out, *i);
            out.push(b'e');
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (k, v) in map {
                write_usize(out, k.len());
                out.push(b':');
                out.extend_from_slice(k);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

fn write_usize(out: &mut Vec<u8>, n: usize) {
    out.extend_from_slice(n.to_string().as_bytes());
}

fn write_i64(out: &mut Vec<u8>, n: i64) {
    out.extend_from_slice(n.to_string().as_bytes());
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&encode(self)))
    }
}

/// Convenience constructors used throughout the metainfo/tracker modules.
pub mod build {
    use super::Value;
    use std::collections::BTreeMap;

    pub fn bytestring(s: impl AsRef<[u8]>) -> Value {
        Value::ByteString(s.as_ref().to_vec())
    }

    pub fn dict(entries: Vec<(&str, Value)>) -> Value {
        let mut map = BTreeMap::new();
        for (k, v) in entries {
            map.insert(k.as_bytes().to_vec(), v);
        }
        Value::Dict(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: Vec<(&str, Value)>) -> Value {
        build::dict(pairs)
    }

    #[test]
    fn decodes_seed_dict() {
        let input = b"d3:cow3:moo4:spam4:eggse";
        let decoded = decode(input).unwrap();
        let expected = dict(vec![
            ("cow", Value::ByteString(b"moo".to_vec())),
            ("spam", Value::ByteString(b"eggs".to_vec())),
        ]);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn encodes_seed_dict_with_sorted_keys() {
        let value = dict(vec![
            ("spam", Value::ByteString(b"eggs".to_vec())),
            ("cow", Value::ByteString(b"moo".to_vec())),
        ]);
        assert_eq!(encode(&value), b"d3:cow3:moo4:spam4:eggse");
    }

    #[test]
    fn round_trips_nested_values() {
        let value = dict(vec![
            ("list", Value::List(vec![Value::Integer(1), Value::Integer(-2)])),
            ("n", Value::Integer(0)),
        ]);
        let encoded = encode(&value);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn rejects_leading_zero_integers() {
        assert_eq!(decode(b"i03e"), Err(DecodeError::LeadingZero(1)));
    }

    #[test]
    fn rejects_negative_zero() {
        assert!(decode(b"i-0e").is_err());
    }

    #[test]
    fn rejects_unterminated_integer() {
        assert!(decode(b"i3").is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert!(decode(b"i3eX").is_err());
    }

    #[test]
    fn rejects_duplicate_keys() {
        assert!(decode(b"d1:ai1e1:ai2ee").is_err());
    }

    #[test]
    fn rejects_out_of_order_keys() {
        assert!(decode(b"d1:bi1e1:ai2ee").is_err());
    }

    #[test]
    fn decode_with_span_reports_exact_range() {
        let input = b"4:spamtrailing";
        let (value, start, end) = decode_with_span(input, 0).unwrap();
        assert_eq!(value, Value::ByteString(b"spam".to_vec()));
        assert_eq!(&input[start..end], b"4:spam");
    }
}
