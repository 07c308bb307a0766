//! Client -> server frames: publishes, subscribes, and keepalives.
//!
//! ```text
//! SUB <subject> [queue] <sid>\r\n
//! UNSUB <sid> [max_msgs]\r\n
//! PUB <subject> [reply] <payload-len>\r\n<payload>\r\n
//! HPUB <subject> [reply] <hdr-len> <total-len>\r\n<hdrs><payload>\r\n
//! PING\r\n    PONG\r\n
//! ```
//!
//! The encoder is what the client's writer task drains onto the socket; the
//! decoder exists for in-process mock servers and for round-trip tests.

use bytes::{BufMut, Bytes, BytesMut};

use crate::headers::HeaderMap;
use crate::DecodeError;

/// One client frame.
#[derive(Debug, Clone)]
pub enum ClientOp {
    Pub {
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    },
    Sub {
        sid: u64,
        subject: String,
        queue: Option<String>,
    },
    Unsub {
        sid: u64,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

impl ClientOp {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ClientOp::Pub {
                subject,
                reply,
                headers,
                payload,
            } => encode_pub(subject, reply.as_deref(), headers.as_ref(), payload, buf),
            ClientOp::Sub {
                sid,
                subject,
                queue,
            } => {
                buf.put_slice(b"SUB ");
                buf.put_slice(subject.as_bytes());
                if let Some(queue) = queue {
                    buf.put_u8(b' ');
                    buf.put_slice(queue.as_bytes());
                }
                buf.put_slice(format!(" {sid}\r\n").as_bytes());
            }
            ClientOp::Unsub { sid, max } => {
                match max {
                    Some(max) => buf.put_slice(format!("UNSUB {sid} {max}\r\n").as_bytes()),
                    None => buf.put_slice(format!("UNSUB {sid}\r\n").as_bytes()),
                };
            }
            ClientOp::Ping => buf.put_slice(b"PING\r\n"),
            ClientOp::Pong => buf.put_slice(b"PONG\r\n"),
        }
    }
}

fn encode_pub(
    subject: &str,
    reply: Option<&str>,
    headers: Option<&HeaderMap>,
    payload: &Bytes,
    buf: &mut BytesMut,
) {
    match headers {
        None => {
            buf.put_slice(b"PUB ");
            buf.put_slice(subject.as_bytes());
            if let Some(reply) = reply {
                buf.put_u8(b' ');
                buf.put_slice(reply.as_bytes());
            }
            buf.put_slice(format!(" {}\r\n", payload.len()).as_bytes());
            buf.put_slice(payload);
            buf.put_slice(b"\r\n");
        }
        Some(headers) => {
            let mut header_block = BytesMut::new();
            headers.encode(&mut header_block);
            let header_len = header_block.len();
            let total_len = header_len + payload.len();

            buf.put_slice(b"HPUB ");
            buf.put_slice(subject.as_bytes());
            if let Some(reply) = reply {
                buf.put_u8(b' ');
                buf.put_slice(reply.as_bytes());
            }
            buf.put_slice(format!(" {header_len} {total_len}\r\n").as_bytes());
            buf.put_slice(&header_block);
            buf.put_slice(payload);
            buf.put_slice(b"\r\n");
        }
    }
}

// ---------------------------------------------------------------------------
// ClientDecoder
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingPub {
    subject: String,
    reply: Option<String>,
    header_len: usize,
    total_len: usize,
}

/// Incremental decoder for the client -> server direction.
#[derive(Debug, Default)]
pub struct ClientDecoder {
    pending: Option<PendingPub>,
}

impl ClientDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode at most one frame from `buf`; `Ok(None)` means more bytes are
    /// needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ClientOp>, DecodeError> {
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
                return Ok(Some(ClientOp::Pub {
                    subject: pending.subject,
                    reply: pending.reply,
                    headers,
                    payload: block.slice(pending.header_len..),
                }));
            }

            let Some(line_end) = buf.windows(2).position(|w| w == b"\r\n") else {
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

            if verb.eq_ignore_ascii_case("PUB") {
                self.pending = Some(parse_pub_args(args, false)?);
                continue;
            }
            if verb.eq_ignore_ascii_case("HPUB") {
                self.pending = Some(parse_pub_args(args, true)?);
                continue;
            }
            if verb.eq_ignore_ascii_case("SUB") {
                let tokens: Vec<&str> = args.split_whitespace().collect();
                let (subject, queue, sid) = match tokens.as_slice() {
                    [subject, sid] => (*subject, None, *sid),
                    [subject, queue, sid] => (*subject, Some((*queue).to_owned()), *sid),
                    _ => return Err(DecodeError::ControlLine("SUB expects 2 or 3 arguments")),
                };
                let sid: u64 = sid
                    .parse()
                    .map_err(|_| DecodeError::ControlLine("SUB sid is not numeric"))?;
                return Ok(Some(ClientOp::Sub {
                    sid,
                    subject: subject.to_owned(),
                    queue,
                }));
            }
            if verb.eq_ignore_ascii_case("UNSUB") {
                let tokens: Vec<&str> = args.split_whitespace().collect();
                let (sid, max) = match tokens.as_slice() {
                    [sid] => (*sid, None),
                    [sid, max] => (*sid, Some(*max)),
                    _ => return Err(DecodeError::ControlLine("UNSUB expects 1 or 2 arguments")),
                };
                let sid: u64 = sid
                    .parse()
                    .map_err(|_| DecodeError::ControlLine("UNSUB sid is not numeric"))?;
                let max = match max {
                    Some(m) => Some(
                        m.parse()
                            .map_err(|_| DecodeError::ControlLine("UNSUB max is not numeric"))?,
                    ),
                    None => None,
                };
                return Ok(Some(ClientOp::Unsub { sid, max }));
            }
            if verb.eq_ignore_ascii_case("PING") {
                return Ok(Some(ClientOp::Ping));
            }
            if verb.eq_ignore_ascii_case("PONG") {
                return Ok(Some(ClientOp::Pong));
            }
            return Err(DecodeError::UnknownVerb(verb.to_owned()));
        }
    }
}

fn parse_pub_args(args: &str, with_headers: bool) -> Result<PendingPub, DecodeError> {
    let tokens: Vec<&str> = args.split_whitespace().collect();
    if with_headers {
        let (subject, reply, hdr, total) = match tokens.as_slice() {
            [subject, hdr, total] => (*subject, None, *hdr, *total),
            [subject, reply, hdr, total] => (*subject, Some((*reply).to_owned()), *hdr, *total),
            _ => return Err(DecodeError::ControlLine("HPUB expects 3 or 4 arguments")),
        };
        let header_len: usize = hdr
            .parse()
            .map_err(|_| DecodeError::ControlLine("HPUB header length is not numeric"))?;
        let total_len: usize = total
            .parse()
            .map_err(|_| DecodeError::ControlLine("HPUB total length is not numeric"))?;
        if header_len > total_len {
            return Err(DecodeError::ControlLine("HPUB header length exceeds total"));
        }
        Ok(PendingPub {
            subject: subject.to_owned(),
            reply,
            header_len,
            total_len,
        })
    } else {
        let (subject, reply, len) = match tokens.as_slice() {
            [subject, len] => (*subject, None, *len),
            [subject, reply, len] => (*subject, Some((*reply).to_owned()), *len),
            _ => return Err(DecodeError::ControlLine("PUB expects 2 or 3 arguments")),
        };
        let total_len: usize = len
            .parse()
            .map_err(|_| DecodeError::ControlLine("PUB payload length is not numeric"))?;
        Ok(PendingPub {
            subject: subject.to_owned(),
            reply,
            header_len: 0,
            total_len,
        })
    }
}
