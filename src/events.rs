//! Out-of-band client events.
//!
//! Conditions that have no blocked caller to return to (slow consumers,
//! pull warnings, heartbeat alarms on handler-dispatched subscriptions, ...)
//! are broadcast here.  Subscribe with [`crate::Client::events`]; slow
//! receivers lose the oldest events, never block the reader.

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A subscription's pending queue overflowed and a message was dropped.
    /// Fires once per threshold crossing.
    SlowConsumer { sid: u64, subject: String },
    /// A pull ended with a non-fatal 409 variant; consuming may continue.
    StatusWarning {
        sid: u64,
        code: u16,
        description: String,
    },
    /// An error was routed to a handler-dispatched subscription.
    SubscriptionError { sid: u64, error: String },
    /// No heartbeat or data within the alarm period on a pull subscription.
    HeartbeatsMissed { sid: u64 },
    /// Consumer sequence discontinuity observed on a stream message.
    SequenceGap {
        sid: u64,
        expected: u64,
        observed: u64,
    },
    /// The server sent `-ERR`.
    ServerError(String),
    /// The connection died on a malformed frame or transport failure.
    ConnectionError(String),
    /// The server announced lame duck mode; expect a shutdown.
    LameDuckMode,
}
