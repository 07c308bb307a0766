//! Server -> client frames: the wire reader half of the protocol.
//!
//! The protocol is line-oriented.  Every frame starts with an ASCII verb and
//! ends with CRLF; `MSG`/`HMSG` are followed by a payload block whose exact
//! byte length is declared on the control line and which is itself terminated
//! by CRLF:
//!
//! ```text
//! MSG  <subject> <sid> [reply] <payload-len>\r\n<payload>\r\n
//! HMSG <subject> <sid> [reply] <hdr-len> <total-len>\r\n<hdrs><payload>\r\n
//! PING\r\n    PONG\r\n    +OK\r\n    -ERR '<reason>'\r\n    INFO <json>\r\n
//! ```
//!
//! [`ServerDecoder`] is incremental: feed it the read buffer as bytes arrive
//! and it yields one frame at a time, keeping partial state across calls.
//! Frames that fail length or charset validation are fatal; the caller is
//! expected to tear the connection down.

use bytes::{BufMut, Bytes, BytesMut};

use crate::headers::HeaderMap;
use crate::info::ServerInfo;
use crate::{DecodeError, StatusCode};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A decoded data message, shared between `MSG` and `HMSG`.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: Bytes,
    /// Wire-level size of the message (subject + reply + headers + payload),
    /// used for pending-byte accounting.
    pub length: usize,
}

impl Message {
    pub fn new(
        subject: impl Into<String>,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Self {
        let subject = subject.into();
        let header_len = headers.as_ref().map_or(0, HeaderMap::encoded_len);
        let length = subject.len()
            + reply.as_ref().map_or(0, String::len)
            + header_len
            + payload.len();
        Message {
            subject,
            reply,
            headers,
            payload,
            length,
        }
    }

    /// The protocol status, when this message carries one.
    pub fn status(&self) -> Option<StatusCode> {
        self.headers.as_ref().and_then(HeaderMap::status)
    }

    pub fn status_description(&self) -> Option<&str> {
        self.headers.as_ref().and_then(HeaderMap::description)
    }

    /// A status carrier has headers, a status code, and no payload.
    pub fn is_status(&self) -> bool {
        self.payload.is_empty() && self.status().is_some()
    }
}

// ---------------------------------------------------------------------------
// ServerOp
// ---------------------------------------------------------------------------

/// One decoded server frame.
#[derive(Debug, Clone)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg { sid: u64, message: Message },
    Ping,
    Pong,
    Ok,
    Err(String),
}

impl ServerOp {
    /// Encode this frame exactly as the server would emit it.
    ///
    /// Used by in-process mock servers; the client only decodes this
    /// direction.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), serde_json::Error> {
        match self {
            ServerOp::Info(info) => {
                buf.put_slice(b"INFO ");
                buf.put_slice(&serde_json::to_vec(info)?);
                buf.put_slice(b"\r\n");
            }
            ServerOp::Msg { sid, message } => encode_msg(*sid, message, buf),
            ServerOp::Ping => buf.put_slice(b"PING\r\n"),
            ServerOp::Pong => buf.put_slice(b"PONG\r\n"),
            ServerOp::Ok => buf.put_slice(b"+OK\r\n"),
            ServerOp::Err(reason) => {
                buf.put_slice(b"-ERR '");
                buf.put_slice(reason.as_bytes());
                buf.put_slice(b"'\r\n");
            }
        }
        Ok(())
    }
}

fn encode_msg(sid: u64, message: &Message, buf: &mut BytesMut) {
    match &message.headers {
        None => {
            buf.put_slice(b"MSG ");
            buf.put_slice(message.subject.as_bytes());
            buf.put_slice(format!(" {sid}").as_bytes());
            if let Some(reply) = &message.reply {
                buf.put_u8(b' ');
                buf.put_slice(reply.as_bytes());
            }
            buf.put_slice(format!(" {}\r\n", message.payload.len()).as_bytes());
            buf.put_slice(&message.payload);
            buf.put_slice(b"\r\n");
        }
        Some(headers) => {
            let mut header_block = BytesMut::new();
            headers.encode(&mut header_block);
            let header_len = header_block.len();
            let total_len = header_len + message.payload.len();

            buf.put_slice(b"HMSG ");
            buf.put_slice(message.subject.as_bytes());
            buf.put_slice(format!(" {sid}").as_bytes());
            if let Some(reply) = &message.reply {
                buf.put_u8(b' ');
                buf.put_slice(reply.as_bytes());
            }
            buf.put_slice(format!(" {header_len} {total_len}\r\n").as_bytes());
            buf.put_slice(&header_block);
            buf.put_slice(&message.payload);
            buf.put_slice(b"\r\n");
        }
    }
}

// ---------------------------------------------------------------------------
// ServerDecoder
// ---------------------------------------------------------------------------

/// Control-line fields held while waiting for a payload block to arrive.
#[derive(Debug)]
struct PendingMsg {
    subject: String,
    sid: u64,
    reply: Option<String>,
    header_len: usize,
    total_len: usize,
}

/// Incremental decoder for the server -> client direction.
#[derive(Debug, Default)]
pub struct ServerDecoder {
    pending: Option<PendingMsg>,
}

impl ServerDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode at most one frame from `buf`, consuming its bytes.
    ///
    /// Returns `Ok(None)` when more bytes are needed.  Call in a loop until
    /// it returns `None` to drain a read buffer.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ServerOp>, DecodeError> {
        loop {
            if let Some(pending) = self.pending.take() {
                let needed = pending.total_len + 2;
                if buf.len() < needed {
                    self.pending = Some(pending);
                    return Ok(None);
                }
                let mut block = buf.split_to(needed);
                if &block[pending.total_len..] != b"\r\n" {
                    return Err(DecodeError::PayloadTerminator);
                }
                block.truncate(pending.total_len);
                let block = block.freeze();

                let headers = if pending.header_len > 0 {
                    Some(HeaderMap::parse(&block[..pending.header_len])?)
                } else {
                    None
                };
                let payload = block.slice(pending.header_len..);
                let length = pending.subject.len()
                    + pending.reply.as_ref().map_or(0, String::len)
                    + pending.total_len;
                return Ok(Some(ServerOp::Msg {
                    sid: pending.sid,
                    message: Message {
                        subject: pending.subject,
                        reply: pending.reply,
                        headers,
                        payload,
                        length,
                    },
                }));
            }

            let Some(line_end) = find_crlf(buf) else {
                return Ok(None);
            };
            let line = buf.split_to(line_end + 2);
            let line = std::str::from_utf8(&line[..line_end])
                .map_err(|_| DecodeError::ControlLine("control line is not valid UTF-8"))?;
            if line.is_empty() {
                continue;
            }

            let (verb, args) = match line.split_once(' ') {
                Some((v, a)) => (v, a.trim()),
                None => (line, ""),
            };

            if verb.eq_ignore_ascii_case("MSG") {
                self.pending = Some(parse_msg_args(args)?);
                continue;
            }
            if verb.eq_ignore_ascii_case("HMSG") {
                self.pending = Some(parse_hmsg_args(args)?);
                continue;
            }
            if verb.eq_ignore_ascii_case("PING") {
                return Ok(Some(ServerOp::Ping));
            }
            if verb.eq_ignore_ascii_case("PONG") {
                return Ok(Some(ServerOp::Pong));
            }
            if verb == "+OK" {
                return Ok(Some(ServerOp::Ok));
            }
            if verb == "-ERR" {
                let reason = args.trim_matches('\'').to_owned();
                return Ok(Some(ServerOp::Err(reason)));
            }
            if verb.eq_ignore_ascii_case("INFO") {
                let info: ServerInfo = serde_json::from_str(args)?;
                return Ok(Some(ServerOp::Info(info)));
            }
            return Err(DecodeError::UnknownVerb(verb.to_owned()));
        }
    }
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_msg_args(args: &str) -> Result<PendingMsg, DecodeError> {
    let tokens: Vec<&str> = args.split_whitespace().collect();
    let (subject, sid, reply, len) = match tokens.as_slice() {
        [subject, sid, len] => (*subject, *sid, None, *len),
        [subject, sid, reply, len] => (*subject, *sid, Some((*reply).to_owned()), *len),
        _ => return Err(DecodeError::ControlLine("MSG expects 3 or 4 arguments")),
    };
    let sid: u64 = sid
        .parse()
        .map_err(|_| DecodeError::ControlLine("MSG sid is not numeric"))?;
    let total_len: usize = len
        .parse()
        .map_err(|_| DecodeError::ControlLine("MSG payload length is not numeric"))?;
    Ok(PendingMsg {
        subject: subject.to_owned(),
        sid,
        reply,
        header_len: 0,
        total_len,
    })
}

fn parse_hmsg_args(args: &str) -> Result<PendingMsg, DecodeError> {
    let tokens: Vec<&str> = args.split_whitespace().collect();
    let (subject, sid, reply, header_len, total_len) = match tokens.as_slice() {
        [subject, sid, hdr, total] => (*subject, *sid, None, *hdr, *total),
        [subject, sid, reply, hdr, total] => {
            (*subject, *sid, Some((*reply).to_owned()), *hdr, *total)
        }
        _ => return Err(DecodeError::ControlLine("HMSG expects 4 or 5 arguments")),
    };
    let sid: u64 = sid
        .parse()
        .map_err(|_| DecodeError::ControlLine("HMSG sid is not numeric"))?;
    let header_len: usize = header_len
        .parse()
        .map_err(|_| DecodeError::ControlLine("HMSG header length is not numeric"))?;
    let total_len: usize = total_len
        .parse()
        .map_err(|_| DecodeError::ControlLine("HMSG total length is not numeric"))?;
    if header_len > total_len {
        return Err(DecodeError::ControlLine("HMSG header length exceeds total"));
    }
    Ok(PendingMsg {
        subject: subject.to_owned(),
        sid,
        reply,
        header_len,
        total_len,
    })
}
