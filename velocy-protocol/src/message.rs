//! Message envelopes carried inside reassembled chunk payloads.
//!
//! A message payload is a self-delimiting JSON head followed directly by the
//! optional body bytes:
//!
//! ```text
//! request:        [1, 1, database, request_type, path, {params}, {headers}] body?
//! response:       [1, 2, response_code, {meta}] body?
//! authentication: [1, 1000, "plain", user, password] | [1, 1000, "jwt", token]
//! ```
//!
//! Bodies are opaque to this crate.

use crate::error::ProtocolError;
use crate::ENVELOPE_VERSION;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;

/// Header marking a request as allowed to be served by a follower.
pub const ALLOW_DIRTY_READ_HEADER: &str = "x-arango-allow-dirty-read";

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub payload: Bytes,
}

impl Message {
    pub fn new(id: u64, payload: Bytes) -> Self {
        Self { id, payload }
    }
}

/// Envelope type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
    Authentication,
}

impl MessageType {
    pub fn code(self) -> u16 {
        match self {
            MessageType::Request => 1,
            MessageType::Response => 2,
            MessageType::Authentication => 1000,
        }
    }
}

/// Request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Delete,
    Get,
    Post,
    Put,
    Head,
    Patch,
    Options,
}

impl RequestType {
    pub fn code(self) -> u8 {
        match self {
            RequestType::Delete => 0,
            RequestType::Get => 1,
            RequestType::Post => 2,
            RequestType::Put => 3,
            RequestType::Head => 4,
            RequestType::Patch => 5,
            RequestType::Options => 6,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(RequestType::Delete),
            1 => Ok(RequestType::Get),
            2 => Ok(RequestType::Post),
            3 => Ok(RequestType::Put),
            4 => Ok(RequestType::Head),
            5 => Ok(RequestType::Patch),
            6 => Ok(RequestType::Options),
            other => Err(ProtocolError::UnknownRequestType(other)),
        }
    }

    /// HTTP method name.
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Delete => "DELETE",
            RequestType::Get => "GET",
            RequestType::Post => "POST",
            RequestType::Put => "PUT",
            RequestType::Head => "HEAD",
            RequestType::Patch => "PATCH",
            RequestType::Options => "OPTIONS",
        }
    }

    /// Whether the method only reads.
    pub fn is_read(self) -> bool {
        matches!(self, RequestType::Get | RequestType::Head)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a JSON head off the front of `payload`, returning the head and the
/// remaining bytes as body.
fn split_head<T: DeserializeOwned>(payload: &[u8]) -> Result<(T, Option<Bytes>), ProtocolError> {
    let mut stream = serde_json::Deserializer::from_slice(payload).into_iter::<T>();
    let head = stream.next().ok_or(ProtocolError::MissingHead)??;
    let rest = &payload[stream.byte_offset()..];
    let body = if rest.is_empty() {
        None
    } else {
        Some(Bytes::copy_from_slice(rest))
    };
    Ok((head, body))
}

fn check_type(expected: MessageType, actual: u16) -> Result<(), ProtocolError> {
    if actual != expected.code() {
        return Err(ProtocolError::UnexpectedMessageType {
            expected: expected.code(),
            actual,
        });
    }
    Ok(())
}

type RequestHead = (
    u8,
    u16,
    String,
    u8,
    String,
    BTreeMap<String, String>,
    BTreeMap<String, String>,
);

/// A request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Target database.
    pub database: String,
    /// Request method.
    pub request_type: RequestType,
    /// Request path, relative to the database.
    pub path: String,
    /// Query parameters.
    pub query_params: BTreeMap<String, String>,
    /// Headers, keys lowercased.
    pub headers: BTreeMap<String, String>,
    /// Serialized body.
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(
        database: impl Into<String>,
        request_type: RequestType,
        path: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            request_type,
            path: path.into(),
            query_params: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Marks the request as servable by a follower.
    pub fn with_dirty_read(self, allow: bool) -> Self {
        self.with_header(ALLOW_DIRTY_READ_HEADER, allow.to_string())
    }

    pub fn allows_dirty_read(&self) -> bool {
        self.headers
            .get(ALLOW_DIRTY_READ_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Encodes the request into payload buffers (head, then body if any).
    pub fn encode(&self) -> Result<Vec<Bytes>, ProtocolError> {
        let head = serde_json::to_vec(&(
            ENVELOPE_VERSION,
            MessageType::Request.code(),
            &self.database,
            self.request_type.code(),
            &self.path,
            &self.query_params,
            &self.headers,
        ))?;

        let mut buffers = vec![Bytes::from(head)];
        if let Some(ref body) = self.body {
            buffers.push(body.clone());
        }
        Ok(buffers)
    }

    /// Decodes a request from a message payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let ((_, kind, database, request_type, path, query_params, headers), body) =
            split_head::<RequestHead>(payload)?;
        check_type(MessageType::Request, kind)?;

        Ok(Self {
            database,
            request_type: RequestType::from_code(request_type)?,
            path,
            query_params,
            headers,
            body,
        })
    }
}

/// A response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Envelope version.
    pub version: u8,
    /// HTTP-style status code.
    pub response_code: u16,
    /// Meta headers, keys lowercased.
    pub meta: BTreeMap<String, String>,
    /// Serialized body.
    pub body: Option<Bytes>,
}

impl Response {
    pub fn new(response_code: u16) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            response_code,
            meta: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_meta(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.meta.insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Looks up a meta header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.meta
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.response_code)
    }

    /// Encodes the response into payload buffers (head, then body if any).
    pub fn encode(&self) -> Result<Vec<Bytes>, ProtocolError> {
        let head = serde_json::to_vec(&(
            self.version,
            MessageType::Response.code(),
            self.response_code,
            &self.meta,
        ))?;

        let mut buffers = vec![Bytes::from(head)];
        if let Some(ref body) = self.body {
            buffers.push(body.clone());
        }
        Ok(buffers)
    }

    /// Decodes a response from a message payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let ((version, kind, response_code, meta), body) =
            split_head::<(u8, u16, u16, BTreeMap<String, String>)>(payload)?;
        check_type(MessageType::Response, kind)?;

        Ok(Self {
            version,
            response_code,
            meta,
            body,
        })
    }
}

/// Credentials sent once per connection, right after the protocol header.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthenticationRequest {
    Plain { user: String, password: String },
    Jwt { token: String },
}

impl fmt::Debug for AuthenticationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthenticationRequest::Plain { user, .. } => f
                .debug_struct("Plain")
                .field("user", user)
                .field("password", &"***")
                .finish(),
            AuthenticationRequest::Jwt { .. } => {
                f.debug_struct("Jwt").field("token", &"***").finish()
            }
        }
    }
}

impl AuthenticationRequest {
    pub fn encode(&self) -> Result<Vec<Bytes>, ProtocolError> {
        let kind = MessageType::Authentication.code();
        let head = match self {
            AuthenticationRequest::Plain { user, password } => {
                serde_json::to_vec(&(ENVELOPE_VERSION, kind, "plain", user, password))?
            }
            AuthenticationRequest::Jwt { token } => {
                serde_json::to_vec(&(ENVELOPE_VERSION, kind, "jwt", token))?
            }
        };
        Ok(vec![Bytes::from(head)])
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (fields, _) = split_head::<Vec<serde_json::Value>>(payload)?;
        let kind = fields
            .get(1)
            .and_then(|v| v.as_u64())
            .ok_or(ProtocolError::MissingHead)?;
        check_type(MessageType::Authentication, kind as u16)?;

        let text = |i: usize| {
            fields
                .get(i)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or(ProtocolError::MissingHead)
        };
        match text(2)?.as_str() {
            "jwt" => Ok(AuthenticationRequest::Jwt { token: text(3)? }),
            _ => Ok(AuthenticationRequest::Plain {
                user: text(3)?,
                password: text(4)?,
            }),
        }
    }

    /// Peeks at the message type of a payload without decoding the rest.
    pub fn is_authentication(payload: &[u8]) -> bool {
        split_head::<Vec<serde_json::Value>>(payload)
            .ok()
            .and_then(|(fields, _)| fields.get(1).and_then(|v| v.as_u64()))
            == Some(u64::from(MessageType::Authentication.code()))
    }
}
