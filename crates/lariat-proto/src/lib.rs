// lariat-proto: NATS wire protocol types, framing, and JetStream encodings.
//
// Everything in this crate is transport-agnostic: decoders consume a byte
// buffer filled by whoever owns the socket, encoders append to a byte buffer
// drained by whoever owns the socket.  The frozen wire grammar lives in
// `client_op` (client -> server) and `server_op` (server -> client).

pub mod client_op;
pub mod headers;
pub mod info;
pub mod jetstream;
pub mod server_op;
pub mod subject;

pub use client_op::{ClientDecoder, ClientOp};
pub use headers::{HeaderMap, StatusCode};
pub use info::ServerInfo;
pub use jetstream::{AckKind, AckMetadata, PullRequest};
pub use server_op::{Message, ServerDecoder, ServerOp};

/// Errors raised while decoding either direction of the wire protocol.
///
/// Any decode error is fatal to the connection that produced the bytes;
/// recovery (reconnect) is the transport owner's concern.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed control line: {0}")]
    ControlLine(&'static str),
    #[error("unknown protocol verb: {0}")]
    UnknownVerb(String),
    #[error("malformed headers: {0}")]
    Headers(&'static str),
    #[error("payload block missing CRLF terminator")]
    PayloadTerminator,
    #[error("invalid INFO payload: {0}")]
    Info(#[from] serde_json::Error),
    #[error("invalid ack reply subject: {0}")]
    AckReply(&'static str),
}
