//! The client error taxonomy.
//!
//! Validation and configuration problems are raised synchronously at the call
//! site, before any wire activity.  Status and heartbeat conditions are both
//! observable from the consumer APIs and reported on the event channel;
//! transport errors surface to whoever is blocked on the connection.

use lariat_proto::DecodeError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection driver has shut down; no further wire activity is
    /// possible.
    #[error("connection closed")]
    ConnectionClosed,
    /// The transport failed underneath us.  Reconnecting is the transport
    /// owner's concern.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    /// A malformed frame.  Fatal to the connection.
    #[error("protocol: {0}")]
    Protocol(#[from] DecodeError),
    /// Invalid arguments, rejected before anything is sent.
    #[error("invalid argument: {0}")]
    Validation(&'static str),
    /// A blocking operation did not complete within its deadline.
    #[error("timed out")]
    Timeout,
    /// A request got a 503 back: nothing is subscribed to that subject.
    #[error("no responders available for request")]
    NoResponders,
    /// A pull or request ended with an unrecoverable server status.
    #[error("server status {code}: {description}")]
    Status { code: u16, description: String },
    /// No heartbeat or data arrived within the alarm period.
    #[error("missed idle heartbeats from the server")]
    HeartbeatsMissed,
    /// Consumer sequence discontinuity.  The subscription continues from the
    /// newly observed sequence.
    #[error("consumer sequence gap: expected {expected}, observed {observed}")]
    SequenceGap { expected: u64, observed: u64 },
    /// Publish rejected because the outbound queue is full and the client is
    /// configured to discard rather than wait.
    #[error("outbound queue full")]
    OutboundQueueFull,
    /// Publish rejected because the payload exceeds the server limit.
    #[error("payload exceeds server max_payload of {max} bytes")]
    MaxPayloadExceeded { max: usize },
    /// The pull subscription has failed or been unsubscribed; no further
    /// pulls may be issued.
    #[error("pull subscription terminated")]
    Terminated,
}

pub type Result<T> = std::result::Result<T, Error>;
