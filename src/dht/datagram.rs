//! Datagram framing for the four RPC methods.
//!
//! Every datagram is a bencoded dict whose positional integer keys 0..n carry
//! the fields in a fixed order. Three kinds exist: requests (kind 0) with a
//! method name and argument list, responses (kind 1) with a result value, and
//! errors (kind 2) with an exception name and message. Request argument lists
//! end with a dict carrying at least `protocolVersion`; the sender appends it
//! if the caller did not.
//!
//! Typed argument and reply shapes live here too, so the rest of the stack
//! never touches the generic bencode tree.

use super::bencode::{self, Bencode, BencodeKey};
use super::constants::{self, HASH_LENGTH, PROTOCOL_VERSION, RPC_ID_LENGTH};
use super::distance::{Id384, RpcId};
use super::error::DhtError;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

pub const REQUEST_TYPE: i64 = 0;
pub const RESPONSE_TYPE: i64 = 1;
pub const ERROR_TYPE: i64 = 2;

pub const PROTOCOL_VERSION_KEY: &[u8] = b"protocolVersion";
pub const CONTACTS_KEY: &[u8] = b"contacts";
pub const TOKEN_KEY: &[u8] = b"token";

/// Arguments of a request, one case per method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestArgs {
    Ping,
    Store {
        blob_hash: Id384,
        token: Vec<u8>,
        tcp_port: u16,
        publisher_id: Id384,
        age: u64,
    },
    FindNode {
        key: Id384,
    },
    FindValue {
        key: Id384,
    },
}

impl RequestArgs {
    pub fn method(&self) -> &'static [u8] {
        match self {
            RequestArgs::Ping => b"ping",
            RequestArgs::Store { .. } => b"store",
            RequestArgs::FindNode { .. } => b"findNode",
            RequestArgs::FindValue { .. } => b"findValue",
        }
    }

    fn to_values(&self) -> Vec<Bencode> {
        match self {
            RequestArgs::Ping => vec![],
            RequestArgs::Store {
                blob_hash,
                token,
                tcp_port,
                publisher_id,
                age,
            } => vec![
                Bencode::Bytes(blob_hash.to_vec()),
                Bencode::Bytes(token.clone()),
                Bencode::Int(*tcp_port as i64),
                Bencode::Bytes(publisher_id.to_vec()),
                Bencode::Int(*age as i64),
            ],
            RequestArgs::FindNode { key } | RequestArgs::FindValue { key } => {
                vec![Bencode::Bytes(key.to_vec())]
            }
        }
    }

    /// Convert the positional argument values of a decoded request back into
    /// the typed shape. Contract violations come back as protocol errors so
    /// the engine can answer with an error datagram.
    pub fn parse(method: &[u8], args: &[Bencode]) -> Result<RequestArgs, DhtError> {
        match method {
            b"ping" => {
                if !args.is_empty() {
                    return Err(DhtError::Protocol("ping takes no arguments".into()));
                }
                Ok(RequestArgs::Ping)
            }
            b"store" => {
                let [hash, token, port, publisher, age] = args else {
                    return Err(DhtError::Protocol(format!(
                        "store takes 5 arguments ({} given)",
                        args.len()
                    )));
                };
                Ok(RequestArgs::Store {
                    blob_hash: parse_key(hash)?,
                    token: token
                        .as_bytes()
                        .ok_or_else(|| DhtError::Protocol("token must be bytes".into()))?
                        .to_vec(),
                    tcp_port: parse_port(port)?,
                    publisher_id: parse_key(publisher)?,
                    age: port_free_int(age, "age")?,
                })
            }
            b"findNode" => Ok(RequestArgs::FindNode {
                key: single_key(args, "findNode")?,
            }),
            b"findValue" => Ok(RequestArgs::FindValue {
                key: single_key(args, "findValue")?,
            }),
            other => Err(DhtError::Protocol(format!(
                "invalid method: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

fn single_key(args: &[Bencode], method: &str) -> Result<Id384, DhtError> {
    let [key] = args else {
        return Err(DhtError::Protocol(format!(
            "{method} takes 1 argument ({} given)",
            args.len()
        )));
    };
    parse_key(key)
}

fn parse_key(value: &Bencode) -> Result<Id384, DhtError> {
    let bytes = value
        .as_bytes()
        .ok_or_else(|| DhtError::Protocol("key must be bytes".into()))?;
    Id384::from_slice(bytes).ok_or(DhtError::InvalidKeyLength(bytes.len()))
}

fn parse_port(value: &Bencode) -> Result<u16, DhtError> {
    let n = value
        .as_int()
        .ok_or_else(|| DhtError::Protocol("port must be an integer".into()))?;
    u16::try_from(n).map_err(|_| DhtError::Protocol(format!("invalid port: {n}")))
}

fn port_free_int(value: &Bencode, field: &str) -> Result<u64, DhtError> {
    let n = value
        .as_int()
        .ok_or_else(|| DhtError::Protocol(format!("{field} must be an integer")))?;
    u64::try_from(n).map_err(|_| DhtError::Protocol(format!("negative {field}")))
}

/// A request with its correlation ID and sender identity.
#[derive(Debug, Clone)]
pub struct RequestDatagram {
    pub rpc_id: RpcId,
    pub node_id: Id384,
    /// Version from the trailing argument dict; 0 when the sender omitted it.
    pub protocol_version: u64,
    pub method: Vec<u8>,
    pub args: Vec<Bencode>,
}

impl RequestDatagram {
    pub fn new(node_id: Id384, args: &RequestArgs) -> Self {
        Self {
            rpc_id: constants::generate_rpc_id(),
            node_id,
            protocol_version: PROTOCOL_VERSION,
            method: args.method().to_vec(),
            args: args.to_values(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseDatagram {
    pub rpc_id: RpcId,
    pub node_id: Id384,
    pub result: Bencode,
}

#[derive(Debug, Clone)]
pub struct ErrorDatagram {
    pub rpc_id: RpcId,
    pub node_id: Id384,
    pub exception_type: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum Datagram {
    Request(RequestDatagram),
    Response(ResponseDatagram),
    Error(ErrorDatagram),
}

impl Datagram {
    pub fn rpc_id(&self) -> &RpcId {
        match self {
            Datagram::Request(d) => &d.rpc_id,
            Datagram::Response(d) => &d.rpc_id,
            Datagram::Error(d) => &d.rpc_id,
        }
    }

    pub fn node_id(&self) -> &Id384 {
        match self {
            Datagram::Request(d) => &d.node_id,
            Datagram::Response(d) => &d.node_id,
            Datagram::Error(d) => &d.node_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        let mut fields: BTreeMap<BencodeKey, Bencode> = BTreeMap::new();
        match self {
            Datagram::Request(d) => {
                let mut args = d.args.clone();
                // The trailing dict is part of the frame; append it unless the
                // caller already supplied one.
                if !matches!(args.last(), Some(Bencode::Dict(_))) {
                    let mut trailer = BTreeMap::new();
                    trailer.insert(
                        BencodeKey::Bytes(PROTOCOL_VERSION_KEY.to_vec()),
                        Bencode::Int(d.protocol_version as i64),
                    );
                    args.push(Bencode::Dict(trailer));
                }
                fields.insert(BencodeKey::Int(0), Bencode::Int(REQUEST_TYPE));
                fields.insert(BencodeKey::Int(1), Bencode::Bytes(d.rpc_id.as_bytes().to_vec()));
                fields.insert(BencodeKey::Int(2), Bencode::Bytes(d.node_id.to_vec()));
                fields.insert(BencodeKey::Int(3), Bencode::Bytes(d.method.clone()));
                fields.insert(BencodeKey::Int(4), Bencode::List(args));
            }
            Datagram::Response(d) => {
                fields.insert(BencodeKey::Int(0), Bencode::Int(RESPONSE_TYPE));
                fields.insert(BencodeKey::Int(1), Bencode::Bytes(d.rpc_id.as_bytes().to_vec()));
                fields.insert(BencodeKey::Int(2), Bencode::Bytes(d.node_id.to_vec()));
                fields.insert(BencodeKey::Int(3), d.result.clone());
            }
            Datagram::Error(d) => {
                fields.insert(BencodeKey::Int(0), Bencode::Int(ERROR_TYPE));
                fields.insert(BencodeKey::Int(1), Bencode::Bytes(d.rpc_id.as_bytes().to_vec()));
                fields.insert(BencodeKey::Int(2), Bencode::Bytes(d.node_id.to_vec()));
                fields.insert(
                    BencodeKey::Int(3),
                    Bencode::Bytes(d.exception_type.as_bytes().to_vec()),
                );
                fields.insert(BencodeKey::Int(4), Bencode::Bytes(d.message.as_bytes().to_vec()));
            }
        }
        bencode::encode(&Bencode::Dict(fields))
    }

    pub fn decode(data: &[u8]) -> Result<Datagram, DhtError> {
        let value = bencode::decode(data)?;
        let fields = value.as_dict().expect("decode returns dicts");
        let kind = field(fields, 0)?
            .as_int()
            .ok_or_else(|| DhtError::Decode("packet type must be an integer".into()))?;
        let rpc_id = RpcId::from_slice(required_bytes(fields, 1)?).ok_or_else(|| {
            DhtError::Decode(format!("invalid rpc id length (expected {RPC_ID_LENGTH})"))
        })?;
        let node_id = Id384::from_slice(required_bytes(fields, 2)?).ok_or_else(|| {
            DhtError::Decode(format!("invalid node id length (expected {HASH_LENGTH})"))
        })?;

        match kind {
            REQUEST_TYPE => {
                let method = required_bytes(fields, 3)?.to_vec();
                let mut args = field(fields, 4)?
                    .as_list()
                    .ok_or_else(|| DhtError::Decode("request args must be a list".into()))?
                    .to_vec();
                // Strip the trailing options dict, tolerating extra entries
                // beyond protocolVersion.
                let mut protocol_version = 0;
                if matches!(args.last(), Some(Bencode::Dict(_)))
                    && let Some(Bencode::Dict(trailer)) = args.pop()
                {
                    if let Some(version) = trailer
                        .get(&BencodeKey::Bytes(PROTOCOL_VERSION_KEY.to_vec()))
                        .and_then(Bencode::as_int)
                    {
                        protocol_version = version.max(0) as u64;
                    }
                }
                Ok(Datagram::Request(RequestDatagram {
                    rpc_id,
                    node_id,
                    protocol_version,
                    method,
                    args,
                }))
            }
            RESPONSE_TYPE => Ok(Datagram::Response(ResponseDatagram {
                rpc_id,
                node_id,
                result: field(fields, 3)?.clone(),
            })),
            ERROR_TYPE => Ok(Datagram::Error(ErrorDatagram {
                rpc_id,
                node_id,
                exception_type: String::from_utf8_lossy(required_bytes(fields, 3)?).into_owned(),
                message: String::from_utf8_lossy(required_bytes(fields, 4)?).into_owned(),
            })),
            other => Err(DhtError::Decode(format!("invalid datagram type: {other}"))),
        }
    }
}

fn field(fields: &BTreeMap<BencodeKey, Bencode>, index: i64) -> Result<&Bencode, DhtError> {
    fields
        .get(&BencodeKey::Int(index))
        .ok_or_else(|| DhtError::Decode(format!("missing field {index}")))
}

fn required_bytes(fields: &BTreeMap<BencodeKey, Bencode>, index: i64) -> Result<&[u8], DhtError> {
    field(fields, index)?
        .as_bytes()
        .ok_or_else(|| DhtError::Decode(format!("field {index} must be bytes")))
}

// =============================================================================
// TYPED REPLY SHAPES
// =============================================================================

/// One close-contact entry of a findNode/findValue reply:
/// `(node_id, address_bytes, udp_port)` with the address as dotted-quad text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactTriple {
    pub node_id: Id384,
    pub address: Ipv4Addr,
    pub udp_port: u16,
}

impl ContactTriple {
    pub fn to_value(&self) -> Bencode {
        Bencode::List(vec![
            Bencode::Bytes(self.node_id.to_vec()),
            Bencode::Bytes(self.address.to_string().into_bytes()),
            Bencode::Int(self.udp_port as i64),
        ])
    }

    pub fn from_value(value: &Bencode) -> Result<Self, DhtError> {
        let items = value
            .as_list()
            .ok_or_else(|| DhtError::Decode("contact must be a list".into()))?;
        let [id, address, port] = items else {
            return Err(DhtError::Decode("contact must have 3 elements".into()));
        };
        let node_id = parse_key(id).map_err(|_| DhtError::Decode("invalid contact id".into()))?;
        let address = address
            .as_bytes()
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| DhtError::Decode("invalid contact address".into()))?;
        Ok(Self {
            node_id,
            address,
            udp_port: parse_port(port).map_err(|_| DhtError::Decode("invalid contact port".into()))?,
        })
    }
}

pub fn parse_contact_triples(value: &Bencode) -> Result<Vec<ContactTriple>, DhtError> {
    value
        .as_list()
        .ok_or_else(|| DhtError::Decode("contacts must be a list".into()))?
        .iter()
        .map(ContactTriple::from_value)
        .collect()
}

/// Parsed findValue result: always a fresh token, then either compact TCP
/// addresses of peers hosting the key or close contacts to keep walking.
#[derive(Debug, Clone)]
pub struct FindValueReply {
    pub token: Vec<u8>,
    pub protocol_version: Option<u64>,
    pub contacts: Vec<ContactTriple>,
    pub peers: Vec<Vec<u8>>,
}

impl FindValueReply {
    pub fn from_result(key: &Id384, result: &Bencode) -> Result<Self, DhtError> {
        let dict = result
            .as_dict()
            .ok_or_else(|| DhtError::Decode("findValue result must be a dict".into()))?;
        let token = dict
            .get(&BencodeKey::Bytes(TOKEN_KEY.to_vec()))
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| DhtError::Decode("findValue result is missing a token".into()))?
            .to_vec();
        let protocol_version = dict
            .get(&BencodeKey::Bytes(PROTOCOL_VERSION_KEY.to_vec()))
            .and_then(|v| v.as_int())
            .map(|n| n.max(0) as u64);
        let contacts = match dict.get(&BencodeKey::Bytes(CONTACTS_KEY.to_vec())) {
            Some(v) => parse_contact_triples(v)?,
            None => vec![],
        };
        let peers = match dict.get(&BencodeKey::Bytes(key.to_vec())) {
            Some(v) => v
                .as_list()
                .ok_or_else(|| DhtError::Decode("peer list must be a list".into()))?
                .iter()
                .map(|entry| {
                    entry
                        .as_bytes()
                        .map(<[u8]>::to_vec)
                        .ok_or_else(|| DhtError::Decode("compact address must be bytes".into()))
                })
                .collect::<Result<_, _>>()?,
            None => vec![],
        };
        Ok(Self {
            token,
            protocol_version,
            contacts,
            peers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> Id384 {
        Id384::new([byte; 48])
    }

    fn encode_decode(datagram: Datagram) -> Datagram {
        Datagram::decode(&datagram.encode().unwrap()).unwrap()
    }

    #[test]
    fn ping_request_round_trip() {
        let request = RequestDatagram::new(id(1), &RequestArgs::Ping);
        let rpc_id = request.rpc_id;
        let Datagram::Request(decoded) = encode_decode(Datagram::Request(request)) else {
            panic!("expected a request");
        };
        assert_eq!(decoded.rpc_id, rpc_id);
        assert_eq!(decoded.node_id, id(1));
        assert_eq!(decoded.protocol_version, PROTOCOL_VERSION);
        assert_eq!(RequestArgs::parse(&decoded.method, &decoded.args).unwrap(), RequestArgs::Ping);
    }

    #[test]
    fn store_request_round_trip() {
        let args = RequestArgs::Store {
            blob_hash: id(0x42),
            token: vec![1, 2, 3],
            tcp_port: 3333,
            publisher_id: id(7),
            age: 0,
        };
        let request = RequestDatagram::new(id(7), &args);
        let Datagram::Request(decoded) = encode_decode(Datagram::Request(request)) else {
            panic!("expected a request");
        };
        assert_eq!(RequestArgs::parse(&decoded.method, &decoded.args).unwrap(), args);
    }

    #[test]
    fn find_node_request_round_trip() {
        let args = RequestArgs::FindNode { key: id(0x99) };
        let request = RequestDatagram::new(id(2), &args);
        let Datagram::Request(decoded) = encode_decode(Datagram::Request(request)) else {
            panic!("expected a request");
        };
        assert_eq!(decoded.method, b"findNode");
        assert_eq!(RequestArgs::parse(&decoded.method, &decoded.args).unwrap(), args);
    }

    #[test]
    fn extra_entries_in_trailing_dict_are_tolerated() {
        let mut request = RequestDatagram::new(id(2), &RequestArgs::FindValue { key: id(0x11) });
        let mut trailer = BTreeMap::new();
        trailer.insert(BencodeKey::Bytes(PROTOCOL_VERSION_KEY.to_vec()), Bencode::Int(1));
        trailer.insert(BencodeKey::Bytes(b"someFutureOption".to_vec()), Bencode::Int(9));
        request.args.push(Bencode::Dict(trailer));
        let Datagram::Request(decoded) = encode_decode(Datagram::Request(request)) else {
            panic!("expected a request");
        };
        assert_eq!(decoded.protocol_version, 1);
        assert_eq!(
            RequestArgs::parse(&decoded.method, &decoded.args).unwrap(),
            RequestArgs::FindValue { key: id(0x11) }
        );
    }

    #[test]
    fn unknown_method_is_a_protocol_error() {
        assert!(matches!(
            RequestArgs::parse(b"announce", &[]),
            Err(DhtError::Protocol(_))
        ));
    }

    #[test]
    fn wrong_arg_count_is_a_protocol_error() {
        let args = vec![Bencode::bytes(*b"x"), Bencode::bytes(*b"y")];
        assert!(matches!(
            RequestArgs::parse(b"findNode", &args),
            Err(DhtError::Protocol(_))
        ));
    }

    #[test]
    fn short_key_is_rejected() {
        let args = vec![Bencode::bytes(*b"too short")];
        assert!(matches!(
            RequestArgs::parse(b"findValue", &args),
            Err(DhtError::InvalidKeyLength(9))
        ));
    }

    #[test]
    fn error_datagram_round_trip() {
        let error = ErrorDatagram {
            rpc_id: constants::generate_rpc_id(),
            node_id: id(3),
            exception_type: "ValueError".into(),
            message: "Invalid token".into(),
        };
        let Datagram::Error(decoded) = encode_decode(Datagram::Error(error)) else {
            panic!("expected an error");
        };
        assert_eq!(decoded.exception_type, "ValueError");
        assert_eq!(decoded.message, "Invalid token");
    }

    #[test]
    fn invalid_kind_is_rejected() {
        let mut fields = BTreeMap::new();
        fields.insert(BencodeKey::Int(0), Bencode::Int(7));
        fields.insert(BencodeKey::Int(1), Bencode::Bytes(vec![0; RPC_ID_LENGTH]));
        fields.insert(BencodeKey::Int(2), Bencode::Bytes(vec![0; HASH_LENGTH]));
        let data = bencode::encode(&Bencode::Dict(fields)).unwrap();
        assert!(Datagram::decode(&data).is_err());
    }

    #[test]
    fn wrong_rpc_id_length_is_rejected() {
        let mut fields = BTreeMap::new();
        fields.insert(BencodeKey::Int(0), Bencode::Int(RESPONSE_TYPE));
        fields.insert(BencodeKey::Int(1), Bencode::Bytes(vec![0; 4]));
        fields.insert(BencodeKey::Int(2), Bencode::Bytes(vec![0; HASH_LENGTH]));
        fields.insert(BencodeKey::Int(3), Bencode::bytes(*b"pong"));
        let data = bencode::encode(&Bencode::Dict(fields)).unwrap();
        assert!(Datagram::decode(&data).is_err());
    }

    #[test]
    fn contact_triple_round_trip() {
        let triple = ContactTriple {
            node_id: id(0xaa),
            address: Ipv4Addr::new(10, 0, 0, 1),
            udp_port: 4444,
        };
        assert_eq!(ContactTriple::from_value(&triple.to_value()).unwrap(), triple);
    }

    #[test]
    fn find_value_reply_with_peers() {
        let key = id(0x42);
        let mut dict = BTreeMap::new();
        dict.insert(BencodeKey::Bytes(TOKEN_KEY.to_vec()), Bencode::bytes(*b"tok"));
        dict.insert(BencodeKey::Bytes(PROTOCOL_VERSION_KEY.to_vec()), Bencode::Int(1));
        dict.insert(
            BencodeKey::Bytes(key.to_vec()),
            Bencode::List(vec![Bencode::bytes(*b"compact-address")]),
        );
        let reply = FindValueReply::from_result(&key, &Bencode::Dict(dict)).unwrap();
        assert_eq!(reply.token, b"tok");
        assert_eq!(reply.protocol_version, Some(1));
        assert_eq!(reply.peers, vec![b"compact-address".to_vec()]);
        assert!(reply.contacts.is_empty());
    }

    #[test]
    fn find_value_reply_with_contacts() {
        let key = id(0x42);
        let triple = ContactTriple {
            node_id: id(0x01),
            address: Ipv4Addr::new(127, 0, 0, 1),
            udp_port: 4444,
        };
        let mut dict = BTreeMap::new();
        dict.insert(BencodeKey::Bytes(TOKEN_KEY.to_vec()), Bencode::bytes(*b"tok"));
        dict.insert(
            BencodeKey::Bytes(CONTACTS_KEY.to_vec()),
            Bencode::List(vec![triple.to_value()]),
        );
        let reply = FindValueReply::from_result(&key, &Bencode::Dict(dict)).unwrap();
        assert!(reply.peers.is_empty());
        assert_eq!(reply.contacts, vec![triple]);
    }
}
