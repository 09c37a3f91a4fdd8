//! Bencode codec for the DHT wire format.
//!
//! Grammar: integers `i<decimal>e`, byte strings `<len>:<bytes>`, lists
//! `l…e`, dicts `d…e` with keys emitted in sorted order. Datagrams use
//! integer dict keys (positional fields); RPC result dicts use byte-string
//! keys. Top-level values must be dicts in both directions.

use super::error::DhtError;
use std::collections::BTreeMap;

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<BencodeKey, Bencode>),
}

/// Dict keys are either integers (datagram positional fields) or byte
/// strings (RPC result fields). A single dict never mixes the two.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum BencodeKey {
    Int(i64),
    Bytes(Vec<u8>),
}

impl Bencode {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Bencode::Bytes(data.into())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<BencodeKey, Bencode>> {
        match self {
            Bencode::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Encode a message. The top level must be a dict.
pub fn encode(value: &Bencode) -> Result<Vec<u8>, DhtError> {
    if !matches!(value, Bencode::Dict(_)) {
        return Err(DhtError::Decode("top-level value must be a dict".into()));
    }
    let mut out = Vec::new();
    encode_value(value, &mut out);
    Ok(out)
}

fn encode_value(value: &Bencode, out: &mut Vec<u8>) {
    match value {
        Bencode::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Bencode::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Bencode::List(items) => {
            out.push(b'l');
            for item in items {
                encode_value(item, out);
            }
            out.push(b'e');
        }
        Bencode::Dict(entries) => {
            out.push(b'd');
            for (key, val) in entries {
                match key {
                    BencodeKey::Int(n) => encode_value(&Bencode::Int(*n), out),
                    BencodeKey::Bytes(b) => {
                        out.extend_from_slice(b.len().to_string().as_bytes());
                        out.push(b':');
                        out.extend_from_slice(b);
                    }
                }
                encode_value(val, out);
            }
            out.push(b'e');
        }
    }
}

/// Decode a message. Rejects empty input and non-dict top-level values.
pub fn decode(data: &[u8]) -> Result<Bencode, DhtError> {
    if data.is_empty() {
        return Err(DhtError::Decode("cannot decode empty input".into()));
    }
    let (value, _) = parse(data, 0)?;
    if !matches!(value, Bencode::Dict(_)) {
        return Err(DhtError::Decode("top-level value must be a dict".into()));
    }
    Ok(value)
}

fn parse(data: &[u8], pos: usize) -> Result<(Bencode, usize), DhtError> {
    match data.get(pos) {
        Some(b'i') => {
            let end = find(data, pos, b'e')?;
            let n = parse_int(&data[pos + 1..end])?;
            Ok((Bencode::Int(n), end + 1))
        }
        Some(b'l') => {
            let mut items = Vec::new();
            let mut pos = pos + 1;
            while *data.get(pos).ok_or_else(truncated)? != b'e' {
                let (item, next) = parse(data, pos)?;
                items.push(item);
                pos = next;
            }
            Ok((Bencode::List(items), pos + 1))
        }
        Some(b'd') => {
            let mut entries = BTreeMap::new();
            let mut pos = pos + 1;
            while *data.get(pos).ok_or_else(truncated)? != b'e' {
                let (key, next) = parse(data, pos)?;
                let key = match key {
                    Bencode::Int(n) => BencodeKey::Int(n),
                    Bencode::Bytes(b) => BencodeKey::Bytes(b),
                    _ => return Err(DhtError::Decode("invalid dict key type".into())),
                };
                let (value, next) = parse(data, next)?;
                entries.insert(key, value);
                pos = next;
            }
            Ok((Bencode::Dict(entries), pos + 1))
        }
        Some(b'0'..=b'9') => {
            let sep = find(data, pos, b':')?;
            let length = parse_int(&data[pos..sep])?;
            let length = usize::try_from(length)
                .map_err(|_| DhtError::Decode("negative byte string length".into()))?;
            let start = sep + 1;
            let end = start + length;
            if end > data.len() {
                return Err(truncated());
            }
            Ok((Bencode::Bytes(data[start..end].to_vec()), end))
        }
        Some(other) => Err(DhtError::Decode(format!("unexpected byte 0x{other:02x}"))),
        None => Err(truncated()),
    }
}

fn find(data: &[u8], from: usize, needle: u8) -> Result<usize, DhtError> {
    data[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|offset| from + offset)
        .ok_or_else(truncated)
}

fn parse_int(digits: &[u8]) -> Result<i64, DhtError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DhtError::Decode("invalid integer".into()))
}

fn truncated() -> DhtError {
    DhtError::Decode("truncated input".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: Vec<(BencodeKey, Bencode)>) -> Bencode {
        Bencode::Dict(entries.into_iter().collect())
    }

    #[test]
    fn encode_positional_dict() {
        let msg = dict(vec![
            (BencodeKey::Int(0), Bencode::Int(0)),
            (BencodeKey::Int(1), Bencode::bytes(*b"abc")),
        ]);
        assert_eq!(encode(&msg).unwrap(), b"di0ei0ei1e3:abce");
    }

    #[test]
    fn encode_rejects_non_dict_top_level() {
        assert!(encode(&Bencode::Int(3)).is_err());
        assert!(encode(&Bencode::List(vec![])).is_err());
        assert!(encode(&Bencode::bytes(*b"x")).is_err());
    }

    #[test]
    fn decode_rejects_empty_and_non_dict() {
        assert!(decode(b"").is_err());
        assert!(decode(b"i42e").is_err());
        assert!(decode(b"l3:fooe").is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(b"d3:foo").is_err());
        assert!(decode(b"dxe").is_err());
        assert!(decode(b"d99:shorte").is_err());
        assert!(decode(b"di-e0ee").is_err());
    }

    #[test]
    fn round_trip_nested_message() {
        let msg = dict(vec![
            (BencodeKey::Int(0), Bencode::Int(1)),
            (BencodeKey::Bytes(b"token".to_vec()), Bencode::bytes(*b"\x01\x02")),
            (
                BencodeKey::Bytes(b"contacts".to_vec()),
                Bencode::List(vec![Bencode::List(vec![
                    Bencode::bytes(*b"id"),
                    Bencode::bytes(*b"1.2.3.4"),
                    Bencode::Int(4444),
                ])]),
            ),
            (
                BencodeKey::Bytes(b"inner".to_vec()),
                dict(vec![(
                    BencodeKey::Bytes(b"protocolVersion".to_vec()),
                    Bencode::Int(1),
                )]),
            ),
        ]);
        let encoded = encode(&msg).unwrap();
        assert_eq!(decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn round_trip_negative_int() {
        let msg = dict(vec![(BencodeKey::Int(0), Bencode::Int(-42))]);
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn dict_keys_encode_in_sorted_order() {
        let msg = dict(vec![
            (BencodeKey::Bytes(b"b".to_vec()), Bencode::Int(2)),
            (BencodeKey::Bytes(b"a".to_vec()), Bencode::Int(1)),
        ]);
        assert_eq!(encode(&msg).unwrap(), b"d1:ai1e1:bi2ee");
    }
}
