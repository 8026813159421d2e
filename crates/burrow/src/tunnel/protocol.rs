//! Control channel framing.
//!
//! Every message is a JSON object carried in one WebSocket text frame:
//!
//! - Registration `{"client_id": "..."}`, sent once by the client right after connecting.
//! - Request envelope, sent by the edge: `{"id", "method", "path", "headers", "body", "body_encoding"}`.
//! - Response envelope, sent by the client: `{"id"?, "status", "headers", "body", "body_encoding"?}`.
//!
//! Response decoding is deliberately lenient: a client that gets the schema
//! slightly wrong still produces an HTTP response (see [`ResponseEnvelope::from_value`]).

use std::borrow::Borrow;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use hyper::http::request::Parts;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::BodyEncoding;
use crate::error::ProtocolError;

/// Status used when a client response carries no usable status code.
pub const FALLBACK_STATUS: u16 = 502;

/// Identifier a client registers under. Opaque to the edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Returns `None` for an empty identifier.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Header mapping with case-insensitive (lowercased) keys, insertion order
/// preserved and repeated headers kept as a sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList(Vec<(String, Vec<String>)>);

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        match self.0.iter_mut().find(|(key, _)| *key == name) {
            Some((_, values)) => values.push(value.into()),
            None => self.0.push((name, vec![value.into()])),
        }
    }

    /// All values for `name`, compared case-insensitively.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |v| (key.as_str(), v.as_str())))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Snapshot of a hyper header map. Values that are not visible ASCII are
    /// carried byte-for-byte as latin1 text.
    pub fn from_header_map(headers: &hyper::HeaderMap) -> Self {
        let mut list = Self::new();
        for (name, value) in headers.iter() {
            let text = match value.to_str() {
                Ok(s) => s.to_string(),
                Err(_) => latin1_decode(value.as_bytes()),
            };
            list.append(name.as_str(), text);
        }
        list
    }
}

impl Serialize for HeaderList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, values) in &self.0 {
            map.serialize_entry(key, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderListVisitor;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }

        impl<'de> Visitor<'de> for HeaderListVisitor {
            type Value = HeaderList;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of header names to a string or a list of strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<HeaderList, A::Error> {
                let mut list = HeaderList::new();
                while let Some((key, value)) = access.next_entry::<String, OneOrMany>()? {
                    match value {
                        OneOrMany::One(v) => list.append(&key, v),
                        OneOrMany::Many(vs) => {
                            for v in vs {
                                list.append(&key, v);
                            }
                        }
                    }
                }
                Ok(list)
            }
        }

        deserializer.deserialize_map(HeaderListVisitor)
    }
}

/// Sent once by the client immediately after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub client_id: String,
}

impl Registration {
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Immutable snapshot of a public HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Correlation id echoed back by the client
    pub id: String,
    pub method: String,
    /// Path including the query string
    pub path: String,
    pub headers: HeaderList,
    pub body: Bytes,
}

#[derive(Serialize, Deserialize)]
struct RequestFrame {
    id: String,
    method: String,
    path: String,
    headers: HeaderList,
    body: String,
    #[serde(default)]
    body_encoding: BodyEncoding,
}

impl RequestEnvelope {
    /// Build an envelope with a fresh correlation id.
    pub fn new(method: impl Into<String>, path: impl Into<String>, headers: HeaderList, body: Bytes) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            path: path.into(),
            headers,
            body,
        }
    }

    pub fn from_parts(parts: &Parts, body: Bytes) -> Self {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        Self::new(
            parts.method.as_str(),
            path,
            HeaderList::from_header_map(&parts.headers),
            body,
        )
    }

    pub fn encode(&self, encoding: BodyEncoding) -> Result<String, ProtocolError> {
        let frame = RequestFrame {
            id: self.id.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            headers: self.headers.clone(),
            body: encode_body(&self.body, encoding),
            body_encoding: encoding,
        };
        Ok(serde_json::to_string(&frame)?)
    }

    /// Client-side decode of a request frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: RequestFrame = serde_json::from_str(text)?;
        Ok(Self {
            body: decode_body(&frame.body, frame.body_encoding)?,
            id: frame.id,
            method: frame.method,
            path: frame.path,
            headers: frame.headers,
        })
    }
}

/// A client's answer to one request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    /// Correlation id; absent for clients that predate correlation ids
    pub id: Option<String>,
    pub status: u16,
    /// Name/value pairs in the order the client sent them
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ResponseEnvelope {
    pub fn new(status: u16) -> Self {
        Self {
            id: None,
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Interpret a decoded JSON object as a response.
    ///
    /// Missing or unusable fields degrade instead of failing: no status
    /// becomes 502, no headers becomes an empty list, no body becomes empty,
    /// and a non-string body is relayed as its JSON text. Only an undecodable
    /// body (bad base64, unknown encoding) is an error.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let id = match object.remove("id") {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let status = object.get("status").and_then(status_from_value).unwrap_or(FALLBACK_STATUS);
        let headers = object.get("headers").map(headers_from_value).unwrap_or_default();

        let encoding = match object.get("body_encoding") {
            None | Some(Value::Null) => BodyEncoding::Utf8,
            Some(Value::String(name)) => {
                BodyEncoding::from_name(name).ok_or_else(|| ProtocolError::InvalidField {
                    field: "body_encoding",
                    reason: format!("unknown encoding '{name}'"),
                })?
            }
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "body_encoding",
                    reason: format!("expected a string, got {other}"),
                })
            }
        };

        let body = match object.remove("body") {
            None | Some(Value::Null) => Bytes::new(),
            Some(Value::String(text)) => decode_body(&text, encoding)?,
            Some(other) => Bytes::from(other.to_string()),
        };

        Ok(Self {
            id,
            status,
            headers,
            body,
        })
    }

    /// Client-side encode; bodies are sent as base64.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut headers = Map::new();
        for (name, value) in &self.headers {
            match headers.get_mut(name) {
                Some(Value::Array(values)) => values.push(Value::String(value.clone())),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, Value::String(value.clone())]);
                }
                None => {
                    headers.insert(name.clone(), Value::String(value.clone()));
                }
            }
        }

        let mut object = Map::new();
        if let Some(ref id) = self.id {
            object.insert("id".into(), Value::String(id.clone()));
        }
        object.insert("status".into(), Value::from(self.status));
        object.insert("headers".into(), Value::Object(headers));
        object.insert("body".into(), Value::String(BASE64.encode(&self.body)));
        object.insert("body_encoding".into(), Value::String("base64".into()));
        Ok(serde_json::to_string(&Value::Object(object))?)
    }
}

/// Messages a client may send over the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Register(Registration),
    Response(ResponseEnvelope),
}

/// Decode one client frame. An object with a `client_id` key is a
/// registration; anything else is treated as a response envelope.
pub fn decode_client_frame(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(object) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    match object.get("client_id") {
        Some(Value::String(client_id)) => Ok(ClientMessage::Register(Registration {
            client_id: client_id.clone(),
        })),
        Some(Value::Null) => Ok(ClientMessage::Register(Registration {
            client_id: String::new(),
        })),
        Some(other) => Err(ProtocolError::InvalidField {
            field: "client_id",
            reason: format!("expected a string, got {other}"),
        }),
        None => ResponseEnvelope::from_value(Value::Object(object)).map(ClientMessage::Response),
    }
}

fn status_from_value(value: &Value) -> Option<u16> {
    let code = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    // Same range hyper's StatusCode accepts
    if (100..=999).contains(&code) {
        Some(code as u16)
    } else {
        None
    }
}

fn headers_from_value(value: &Value) -> Vec<(String, String)> {
    let object = match value {
        Value::Object(object) => object,
        Value::Null => return Vec::new(),
        other => {
            warn!(headers = %other, "Ignoring response headers that are not a mapping");
            return Vec::new();
        }
    };

    let mut headers = Vec::new();
    for (name, value) in object {
        let values = match value {
            Value::Array(values) => values.as_slice(),
            other => std::slice::from_ref(other),
        };
        for value in values {
            match scalar_text(value) {
                Some(v) => headers.push((name.clone(), v)),
                None => warn!(header = %name, "Skipping response header value that is not text"),
            }
        }
    }
    headers
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn encode_body(body: &[u8], encoding: BodyEncoding) -> String {
    match encoding {
        BodyEncoding::Latin1 => latin1_decode(body),
        BodyEncoding::Base64 => BASE64.encode(body),
        BodyEncoding::Utf8 => String::from_utf8_lossy(body).into_owned(),
    }
}

pub fn decode_body(text: &str, encoding: BodyEncoding) -> Result<Bytes, ProtocolError> {
    match encoding {
        BodyEncoding::Latin1 => text
            .chars()
            .map(|c| {
                u8::try_from(u32::from(c)).map_err(|_| ProtocolError::InvalidField {
                    field: "body",
                    reason: format!("character {c:?} is outside latin1"),
                })
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(Bytes::from),
        BodyEncoding::Base64 => Ok(Bytes::from(BASE64.decode(text.as_bytes())?)),
        BodyEncoding::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
    }
}

fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}
