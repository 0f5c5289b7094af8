//! Request, response and authentication envelopes.
//!
//! Every message payload is laid out as
//!
//! ```text
//! +-------------+------------------------+------+
//! | header_len  | header (MessagePack)   | body |
//! | 4 bytes LE  | header_len bytes       |      |
//! +-------------+------------------------+------+
//! ```
//!
//! The header is always MessagePack regardless of the body content type, so
//! the connection can route a message before the body codec is known.

use crate::error::ProtocolError;
use crate::PROTOCOL_VERSION;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Message type tags carried in the header.
pub mod message_type {
    pub const REQUEST: u32 = 1;
    pub const RESPONSE: u32 = 2;
    pub const AUTHENTICATION: u32 = 1000;
}

/// Header naming the content type of the body.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Header naming the content type the client accepts.
pub const ACCEPT_HEADER: &str = "accept";

/// Request methods with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Delete,
    Get,
    Post,
    Put,
    Head,
    Patch,
    Options,
}

impl Method {
    pub fn code(&self) -> u8 {
        match self {
            Method::Delete => 0,
            Method::Get => 1,
            Method::Post => 2,
            Method::Put => 3,
            Method::Head => 4,
            Method::Patch => 5,
            Method::Options => 6,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        Ok(match code {
            0 => Method::Delete,
            1 => Method::Get,
            2 => Method::Post,
            3 => Method::Put,
            4 => Method::Head,
            5 => Method::Patch,
            6 => Method::Options,
            other => return Err(ProtocolError::UnknownMethod(other)),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Delete => "DELETE",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "DELETE" => Method::Delete,
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "HEAD" => Method::Head,
            "PATCH" => Method::Patch,
            "OPTIONS" => Method::Options,
            _ => return Err(ProtocolError::InvalidHeader(format!("unknown method {s:?}"))),
        })
    }
}

/// A logical request against one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub database: String,
    pub method: Method,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Request {
    pub fn new(database: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            method,
            path: path.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Encodes header and body into a message payload.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let header = RequestHeader {
            version: PROTOCOL_VERSION,
            message_type: message_type::REQUEST,
            database: self.database.clone(),
            method: self.method.code(),
            path: self.path.clone(),
            query: self.query.clone(),
            headers: self.headers.clone(),
        };
        join_payload(&rmp_serde::to_vec(&header)?, &self.body)
    }
}

/// A reassembled response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    /// Message id of the request this answers.
    pub message_id: u64,
}

impl Response {
    pub fn new(message_id: u64, status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Bytes::new(),
            message_id,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Encodes header and body into a message payload.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let header = ResponseHeader {
            version: PROTOCOL_VERSION,
            message_type: message_type::RESPONSE,
            status: self.status,
            headers: self.headers.clone(),
        };
        join_payload(&rmp_serde::to_vec(&header)?, &self.body)
    }

    /// Decodes a response payload received under `message_id`.
    pub fn decode(message_id: u64, payload: Bytes) -> Result<Self, ProtocolError> {
        let (header, body) = split_payload(payload)?;
        let value = read_header(&header)?;
        expect_type(&value, message_type::RESPONSE)?;
        let header: ResponseHeader = from_header(value)?;
        Ok(Self {
            status: header.status,
            headers: header.headers,
            body,
            message_id,
        })
    }
}

/// Credential handed to the connection for its authentication exchange.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { user: String, password: String },
    Jwt(String),
}

impl Credential {
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn jwt(token: impl Into<String>) -> Self {
        Credential::Jwt(token.into())
    }

    /// Encodes the authentication message payload.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let header = match self {
            Credential::Basic { user, password } => rmp_serde::to_vec(&(
                PROTOCOL_VERSION,
                message_type::AUTHENTICATION,
                "plain",
                user,
                password,
            ))?,
            Credential::Jwt(token) => rmp_serde::to_vec(&(
                PROTOCOL_VERSION,
                message_type::AUTHENTICATION,
                "jwt",
                token,
            ))?,
        };
        join_payload(&header, &[])
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Basic { user, .. } => f
                .debug_struct("Basic")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
            Credential::Jwt(_) => f.debug_tuple("Jwt").field(&"<redacted>").finish(),
        }
    }
}

/// A client-to-server message, as seen by the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingMessage {
    Request(Request),
    Authentication(Credential),
}

impl IncomingMessage {
    /// Decodes a client-to-server payload.
    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let (header, body) = split_payload(payload)?;
        let value = read_header(&header)?;
        match header_type(&value)? {
            message_type::REQUEST => {
                let header: RequestHeader = from_header(value)?;
                Ok(IncomingMessage::Request(Request {
                    database: header.database,
                    method: Method::from_code(header.method)?,
                    path: header.path,
                    headers: header.headers,
                    query: header.query,
                    body,
                }))
            }
            message_type::AUTHENTICATION => {
                let fields = match value {
                    rmpv::Value::Array(fields) => fields,
                    _ => return Err(ProtocolError::InvalidHeader("expected array".into())),
                };
                let text = |i: usize| -> Result<String, ProtocolError> {
                    fields
                        .get(i)
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .ok_or_else(|| {
                            ProtocolError::InvalidHeader(format!("missing auth field {i}"))
                        })
                };
                match text(2)?.as_str() {
                    "plain" => Ok(IncomingMessage::Authentication(Credential::Basic {
                        user: text(3)?,
                        password: text(4)?,
                    })),
                    "jwt" => Ok(IncomingMessage::Authentication(Credential::Jwt(text(3)?))),
                    other => Err(ProtocolError::InvalidHeader(format!(
                        "unknown auth encryption {other:?}"
                    ))),
                }
            }
            other => Err(ProtocolError::UnexpectedMessageType(other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestHeader {
    version: u32,
    message_type: u32,
    database: String,
    method: u8,
    path: String,
    query: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponseHeader {
    version: u32,
    message_type: u32,
    status: u16,
    headers: BTreeMap<String, String>,
}

fn join_payload(header: &[u8], body: &[u8]) -> Result<Bytes, ProtocolError> {
    let header_len = u32::try_from(header.len())
        .map_err(|_| ProtocolError::InvalidHeader("header too large".into()))?;
    let mut buf = BytesMut::with_capacity(4 + header.len() + body.len());
    buf.put_u32_le(header_len);
    buf.put_slice(header);
    buf.put_slice(body);
    Ok(buf.freeze())
}

fn split_payload(mut payload: Bytes) -> Result<(Bytes, Bytes), ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::Truncated {
            needed: 4,
            available: payload.len(),
        });
    }
    let header_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if payload.len() - 4 < header_len {
        return Err(ProtocolError::Truncated {
            needed: 4 + header_len,
            available: payload.len(),
        });
    }
    payload.advance(4);
    let header = payload.split_to(header_len);
    Ok((header, payload))
}

fn read_header(header: &[u8]) -> Result<rmpv::Value, ProtocolError> {
    let mut rd = header;
    let value = rmpv::decode::read_value(&mut rd)
        .map_err(|e| ProtocolError::InvalidHeader(e.to_string()))?;
    let version = header_field(&value, 0)
        .and_then(rmpv::Value::as_u64)
        .ok_or_else(|| ProtocolError::InvalidHeader("missing version".into()))?;
    if version != u64::from(PROTOCOL_VERSION) {
        return Err(ProtocolError::UnsupportedVersion(version as u32));
    }
    Ok(value)
}

fn header_field(value: &rmpv::Value, index: usize) -> Option<&rmpv::Value> {
    value.as_array().and_then(|fields| fields.get(index))
}

fn header_type(value: &rmpv::Value) -> Result<u32, ProtocolError> {
    header_field(value, 1)
        .and_then(rmpv::Value::as_u64)
        .map(|t| t as u32)
        .ok_or_else(|| ProtocolError::InvalidHeader("missing message type".into()))
}

fn expect_type(value: &rmpv::Value, expected: u32) -> Result<(), ProtocolError> {
    match header_type(value)? {
        t if t == expected => Ok(()),
        other => Err(ProtocolError::UnexpectedMessageType(other)),
    }
}

fn from_header<T: serde::de::DeserializeOwned>(value: rmpv::Value) -> Result<T, ProtocolError> {
    rmpv::ext::from_value(value).map_err(|e| ProtocolError::InvalidHeader(e.to_string()))
}
