//! Attribute codec
//!
//! Converts between the key-value store's typed wire representation, as it
//! appears in export data files (`{"S": "abc"}`, `{"N": "12.50"}`,
//! `{"M": {...}}`, ...), and native in-memory [`Value`]s.
//!
//! Numbers decode to [`BigDecimal`] so large or precise values never pass
//! through floating point. Binary payloads are base64 on the wire. Unknown
//! tags are rejected with [`VaultError::Decode`], never coerced.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bigdecimal::BigDecimal;
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use tabvault_common::{Result, VaultError};

/// A decoded record: attribute name to native value.
pub type Item = BTreeMap<String, Value>;

/// Native value for every tag in the store's closed type set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Number(BigDecimal),
    Binary(Vec<u8>),
    Bool(bool),
    Null,
    Map(BTreeMap<String, Value>),
    List(Vec<Value>),
    StringSet(BTreeSet<String>),
    NumberSet(BTreeSet<BigDecimal>),
    BinarySet(BTreeSet<Vec<u8>>),
}

/// Wire tag of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    S,
    N,
    B,
    Bool,
    Null,
    M,
    L,
    Ss,
    Ns,
    Bs,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::S => "S",
            Tag::N => "N",
            Tag::B => "B",
            Tag::Bool => "BOOL",
            Tag::Null => "NULL",
            Tag::M => "M",
            Tag::L => "L",
            Tag::Ss => "SS",
            Tag::Ns => "NS",
            Tag::Bs => "BS",
        }
    }

    pub fn parse(tag: &str) -> Option<Tag> {
        match tag {
            "S" => Some(Tag::S),
            "N" => Some(Tag::N),
            "B" => Some(Tag::B),
            "BOOL" => Some(Tag::Bool),
            "NULL" => Some(Tag::Null),
            "M" => Some(Tag::M),
            "L" => Some(Tag::L),
            "SS" => Some(Tag::Ss),
            "NS" => Some(Tag::Ns),
            "BS" => Some(Tag::Bs),
            _ => None,
        }
    }
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::String(_) => Tag::S,
            Value::Number(_) => Tag::N,
            Value::Binary(_) => Tag::B,
            Value::Bool(_) => Tag::Bool,
            Value::Null => Tag::Null,
            Value::Map(_) => Tag::M,
            Value::List(_) => Tag::L,
            Value::StringSet(_) => Tag::Ss,
            Value::NumberSet(_) => Tag::Ns,
            Value::BinarySet(_) => Tag::Bs,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Parse a wire number string into an arbitrary-precision decimal.
pub fn parse_number(raw: &str) -> Result<BigDecimal> {
    BigDecimal::from_str(raw.trim())
        .map_err(|e| VaultError::Decode(format!("invalid number '{}': {}", raw, e)))
}

/// Decode one tagged wire value.
pub fn decode(wire: &Json) -> Result<Value> {
    let object = wire
        .as_object()
        .ok_or_else(|| VaultError::Decode(format!("expected tagged object, got {}", wire)))?;

    let mut entries = object.iter();
    let (tag, payload) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(VaultError::Decode(format!(
                "expected exactly one type tag, got {} keys",
                object.len()
            )))
        },
    };

    let tag = Tag::parse(tag)
        .ok_or_else(|| VaultError::Decode(format!("unknown attribute tag '{}'", tag)))?;

    match tag {
        Tag::S => Ok(Value::String(expect_str(tag, payload)?.to_string())),
        Tag::N => Ok(Value::Number(decode_number(payload)?)),
        Tag::B => Ok(Value::Binary(decode_binary(payload)?)),
        Tag::Bool => payload
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| mismatch(tag, payload)),
        Tag::Null => match payload.as_bool() {
            Some(true) => Ok(Value::Null),
            _ => Err(mismatch(tag, payload)),
        },
        Tag::M => {
            let map = payload.as_object().ok_or_else(|| mismatch(tag, payload))?;
            Ok(Value::Map(decode_map(map)?))
        },
        Tag::L => expect_array(tag, payload)?
            .iter()
            .map(decode)
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        Tag::Ss => expect_array(tag, payload)?
            .iter()
            .map(|v| expect_str(tag, v).map(str::to_string))
            .collect::<Result<BTreeSet<_>>>()
            .map(Value::StringSet),
        Tag::Ns => expect_array(tag, payload)?
            .iter()
            .map(decode_number)
            .collect::<Result<BTreeSet<_>>>()
            .map(Value::NumberSet),
        Tag::Bs => expect_array(tag, payload)?
            .iter()
            .map(decode_binary)
            .collect::<Result<BTreeSet<_>>>()
            .map(Value::BinarySet),
    }
}

/// Encode a native value back to its tagged wire form.
pub fn encode(value: &Value) -> Json {
    let payload = match value {
        Value::String(s) => Json::String(s.clone()),
        Value::Number(n) => Json::String(n.to_string()),
        Value::Binary(b) => Json::String(STANDARD.encode(b)),
        Value::Bool(b) => Json::Bool(*b),
        Value::Null => Json::Bool(true),
        Value::Map(map) => Json::Object(encode_map(map)),
        Value::List(list) => Json::Array(list.iter().map(encode).collect()),
        Value::StringSet(set) => Json::Array(set.iter().cloned().map(Json::String).collect()),
        Value::NumberSet(set) => Json::Array(set.iter().map(|n| Json::String(n.to_string())).collect()),
        Value::BinarySet(set) => Json::Array(
            set.iter()
                .map(|b| Json::String(STANDARD.encode(b)))
                .collect(),
        ),
    };

    let mut tagged = Map::with_capacity(1);
    tagged.insert(value.tag().as_str().to_string(), payload);
    Json::Object(tagged)
}

/// Decode a whole record (`{"attr": {"S": ...}, ...}`).
pub fn decode_item(wire: &Json) -> Result<Item> {
    let object = wire
        .as_object()
        .ok_or_else(|| VaultError::Decode("record is not a JSON object".to_string()))?;
    decode_map(object)
}

pub fn encode_item(item: &Item) -> Json {
    Json::Object(encode_map(item))
}

fn decode_map(map: &Map<String, Json>) -> Result<BTreeMap<String, Value>> {
    map.iter()
        .map(|(name, wire)| {
            decode(wire)
                .map(|value| (name.clone(), value))
                .map_err(|e| VaultError::Decode(format!("attribute '{}': {}", name, e)))
        })
        .collect()
}

fn encode_map(map: &BTreeMap<String, Value>) -> Map<String, Json> {
    map.iter()
        .map(|(name, value)| (name.clone(), encode(value)))
        .collect()
}

fn decode_number(payload: &Json) -> Result<BigDecimal> {
    match payload {
        Json::String(raw) => parse_number(raw),
        // Tolerated for hand-written fixtures; exports always quote numbers.
        Json::Number(n) => parse_number(&n.to_string()),
        other => Err(mismatch(Tag::N, other)),
    }
}

fn decode_binary(payload: &Json) -> Result<Vec<u8>> {
    let encoded = expect_str(Tag::B, payload)?;
    STANDARD
        .decode(encoded)
        .map_err(|e| VaultError::Decode(format!("invalid base64 binary: {}", e)))
}

fn expect_str(tag: Tag, payload: &Json) -> Result<&str> {
    payload.as_str().ok_or_else(|| mismatch(tag, payload))
}

fn expect_array(tag: Tag, payload: &Json) -> Result<&Vec<Json>> {
    payload.as_array().ok_or_else(|| mismatch(tag, payload))
}

fn mismatch(tag: Tag, payload: &Json) -> VaultError {
    VaultError::Decode(format!(
        "payload {} does not match tag '{}'",
        payload,
        tag.as_str()
    ))
}
