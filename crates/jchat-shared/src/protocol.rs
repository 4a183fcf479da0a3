use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};

use crate::codec;
use crate::constants::{headers, PROTOCOL_VERSION};
use crate::error::ProtocolError;

/// Header name → value. Duplicate names overwrite; iteration (and therefore
/// the encoded header order) is lexicographic.
pub type Headers = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Method
// ---------------------------------------------------------------------------

/// First token of the initial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Client request
    Req,
    /// Response to a request
    Res,
    /// Server-initiated notification
    Inf,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Req => "REQ",
            Method::Res => "RES",
            Method::Inf => "INF",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQ" => Ok(Method::Req),
            "RES" => Ok(Method::Res),
            "INF" => Ok(Method::Inf),
            other => Err(ProtocolError::UnknownMethod(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Request family, selected by the first digit of the status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Account,
    DirectMessage,
    Group,
    File,
    Error,
    Unknown,
}

/// Three-digit status code. Leading zeros are significant on the wire
/// (`010` is sign-up), so the code is always rendered with three digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const SIGN_UP: Self = Self(10);
    pub const SIGN_UP_RESULT: Self = Self(11);
    pub const SIGN_IN: Self = Self(20);
    pub const SIGN_IN_RESULT: Self = Self(21);
    pub const SIGN_OUT: Self = Self(30);
    pub const SIGN_OUT_RESULT: Self = Self(31);

    pub const SEND_MESSAGE: Self = Self(110);
    pub const SEND_MESSAGE_RESULT: Self = Self(111);
    pub const MESSAGE_NOTICE: Self = Self(150);

    pub const CREATE_GROUP: Self = Self(210);
    pub const CREATE_GROUP_RESULT: Self = Self(211);
    pub const GROUP_MESSAGE: Self = Self(220);
    pub const GROUP_MESSAGE_RESULT: Self = Self(221);
    pub const GROUP_CREATED_NOTICE: Self = Self(250);
    pub const GROUP_MESSAGE_NOTICE: Self = Self(252);

    pub const UPLOAD_FILE: Self = Self(310);
    pub const UPLOAD_FILE_RESULT: Self = Self(311);
    pub const FILE_NOTICE: Self = Self(320);
    pub const DOWNLOAD_FILE: Self = Self(330);
    pub const DOWNLOAD_FILE_RESULT: Self = Self(331);

    pub const MALFORMED: Self = Self(401);
    pub const NOT_FOUND: Self = Self(402);
    pub const NOT_AUTHENTICATED: Self = Self(403);

    /// Build a status code; anything above `999` cannot be written in three
    /// digits and is rejected.
    pub const fn new(code: u16) -> Option<Self> {
        if code <= 999 {
            Some(Self(code))
        } else {
            None
        }
    }

    pub const fn code(self) -> u16 {
        self.0
    }

    pub fn category(self) -> Category {
        match self.0 / 100 {
            0 => Category::Account,
            1 => Category::DirectMessage,
            2 => Category::Group,
            3 => Category::File,
            4 => Category::Error,
            _ => Category::Unknown,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

impl FromStr for StatusCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::InvalidStatus(s.to_string()));
        }
        s.parse::<u16>()
            .map(Self)
            .map_err(|_| ProtocolError::InvalidStatus(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One wire record: initial line, headers, blank line and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub method: Method,
    pub status: StatusCode,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Message {
    /// A message with the current protocol version, no body and
    /// `Content-Length: 0`.
    pub fn new(method: Method, status: StatusCode) -> Self {
        let mut map = Headers::new();
        map.insert(headers::CONTENT_LENGTH.to_string(), "0".to_string());
        Self {
            method,
            status,
            version: PROTOCOL_VERSION.to_string(),
            headers: map,
            body: Bytes::new(),
        }
    }

    pub fn request(status: StatusCode) -> Self {
        Self::new(Method::Req, status)
    }

    pub fn response(status: StatusCode) -> Self {
        Self::new(Method::Res, status)
    }

    pub fn notification(status: StatusCode) -> Self {
        Self::new(Method::Inf, status)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_string(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Replace the body and keep `Content-Length` in step with it.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.set_body(body);
        self
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        self.set_header(headers::CONTENT_LENGTH, self.body.len().to_string());
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        codec::encode(self, &mut dst);
        dst.freeze()
    }

    /// Exact number of bytes [`Message::to_bytes`] produces.
    pub fn encoded_len(&self) -> usize {
        let initial = self.method.as_str().len() + 1 + 3 + 1 + self.version.len() + 2;
        let header_lines: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + 2 + value.len() + 2)
            .sum();
        initial + header_lines + 2 + self.body.len()
    }
}
