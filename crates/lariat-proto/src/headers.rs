//! Message headers and protocol status codes.
//!
//! The header block carried by `HMSG`/`HPUB` frames is:
//!
//! ```text
//! NATS/1.0[ <code> <description>]\r\n
//! Key: value\r\n
//! ...\r\n
//! \r\n
//! ```
//!
//! Header keys are case-sensitive and may repeat; insertion order is
//! preserved because the block is re-encoded byte-for-byte.  The optional
//! status line turns a message into a status carrier (no-messages, request
//! timeout, idle heartbeat, ...).

use bytes::{BufMut, BytesMut};

use crate::DecodeError;

const VERSION_LINE: &[u8] = b"NATS/1.0";

// ---------------------------------------------------------------------------
// StatusCode
// ---------------------------------------------------------------------------

/// A numeric protocol status carried on a headers-only message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const FLOW_CONTROL_OR_HEARTBEAT: StatusCode = StatusCode(100);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NO_MESSAGES: StatusCode = StatusCode(404);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const CONFLICT: StatusCode = StatusCode(409);
    pub const NO_RESPONDERS: StatusCode = StatusCode(503);

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Well-known status descriptions, as emitted by the server.
pub mod status_text {
    pub const IDLE_HEARTBEAT: &str = "Idle Heartbeat";
    pub const FLOW_CONTROL_REQUEST: &str = "FlowControl Request";
    pub const NO_MESSAGES: &str = "No Messages";
    pub const REQUEST_TIMEOUT: &str = "Request Timeout";
    pub const EXCEEDED_MAX_WAITING: &str = "Exceeded MaxWaiting";
    pub const EXCEEDED_MAX_REQUEST_BATCH: &str = "Exceeded MaxRequestBatch";
    pub const EXCEEDED_MAX_REQUEST_EXPIRES: &str = "Exceeded MaxRequestExpires";
    pub const EXCEEDED_MAX_REQUEST_MAX_BYTES: &str = "Exceeded MaxRequestMaxBytes";
    pub const MESSAGE_SIZE_EXCEEDS_MAX_BYTES: &str = "Message Size Exceeds MaxBytes";
    pub const CONSUMER_DELETED: &str = "Consumer Deleted";
    pub const CONSUMER_IS_PUSH_BASED: &str = "Consumer is push based";
    pub const BAD_REQUEST: &str = "Bad Request";
    pub const NO_RESPONDERS: &str = "No Responders Available For Request";
}

// ---------------------------------------------------------------------------
// HeaderMap
// ---------------------------------------------------------------------------

/// An ordered multimap of header names to values, plus the optional status
/// line.
///
/// Lookup is linear; header blocks are tiny and order preservation matters
/// more than lookup speed on this path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
    status: Option<StatusCode>,
    description: Option<String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A headers-only status block, as the server would send it.
    pub fn for_status(code: StatusCode, description: impl Into<String>) -> Self {
        HeaderMap {
            entries: Vec::new(),
            status: Some(code),
            description: Some(description.into()),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Replace all values of `name` with a single value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        for (k, vs) in &mut self.entries {
            if *k == name {
                vs.clear();
                vs.push(value);
                return;
            }
        }
        self.entries.push((name, vec![value]));
    }

    /// Add a value to `name`, keeping existing values.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        for (k, vs) in &mut self.entries {
            if *k == name {
                vs.push(value);
                return;
            }
        }
        self.entries.push((name, vec![value]));
    }

    /// First value of `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, vs)| vs.first().map(String::as_str))
    }

    /// All values of `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map_or(&[], |(_, vs)| vs.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(k, vs)| (k.as_str(), vs.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.status.is_none()
    }

    /// Parse a complete header block, including the blank-line terminator.
    pub fn parse(block: &[u8]) -> Result<HeaderMap, DecodeError> {
        let text = std::str::from_utf8(block)
            .map_err(|_| DecodeError::Headers("header block is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");

        let version_line = lines
            .next()
            .ok_or(DecodeError::Headers("empty header block"))?;
        let rest = version_line
            .strip_prefix("NATS/1.0")
            .ok_or(DecodeError::Headers("missing NATS/1.0 version line"))?;

        let mut map = HeaderMap::new();
        let rest = rest.trim_start();
        if !rest.is_empty() {
            let (code_str, description) = match rest.split_once(' ') {
                Some((c, d)) => (c, Some(d.trim().to_owned())),
                None => (rest, None),
            };
            let code: u16 = code_str
                .parse()
                .map_err(|_| DecodeError::Headers("status code is not numeric"))?;
            map.status = Some(StatusCode(code));
            map.description = description;
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(DecodeError::Headers("header line missing ':'"))?;
            if name.is_empty() || name.contains(' ') || name.contains('\t') {
                return Err(DecodeError::Headers("invalid header name"));
            }
            map.append(name, value.trim_start());
        }
        Ok(map)
    }

    /// Encode the block including the blank-line terminator.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(VERSION_LINE);
        if let Some(code) = self.status {
            buf.put_slice(format!(" {code}").as_bytes());
            if let Some(desc) = &self.description {
                buf.put_u8(b' ');
                buf.put_slice(desc.as_bytes());
            }
        }
        buf.put_slice(b"\r\n");
        for (name, values) in &self.entries {
            for value in values {
                buf.put_slice(name.as_bytes());
                buf.put_slice(b": ");
                buf.put_slice(value.as_bytes());
                buf.put_slice(b"\r\n");
            }
        }
        buf.put_slice(b"\r\n");
    }

    /// Encoded size in bytes, as counted by the `HPUB`/`HMSG` length fields.
    pub fn encoded_len(&self) -> usize {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.len()
    }
}
