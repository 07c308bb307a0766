//! Client and subscription configuration.
//!
//! Plain records with explicit defaults and a free-standing `validate`;
//! construct with struct-update syntax:
//!
//! ```rust
//! use lariat::ClientOptions;
//! let options = ClientOptions {
//!     discard_when_full: true,
//!     ..ClientOptions::default()
//! };
//! ```

use std::time::Duration;

use lariat_proto::subject::validate_publish_subject;

use crate::error::{Error, Result};

/// Connection-wide configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Outbound frame queue capacity.  `publish` applies backpressure once
    /// the queue is full.
    pub outbound_capacity: usize,
    /// When set, a full outbound queue fails publishes with
    /// [`Error::OutboundQueueFull`] instead of waiting.
    pub discard_when_full: bool,
    /// Default per-subscription pending-message limit.
    pub max_pending_messages: usize,
    /// Default per-subscription pending-byte limit.
    pub max_pending_bytes: usize,
    /// Prefix for generated reply inboxes.
    pub inbox_prefix: String,
    /// How long `connect` waits for the server's `INFO`.
    pub info_timeout: Duration,
    /// Accept UTF-8 subjects on publish instead of requiring ASCII.
    pub utf8_subjects: bool,
    /// Overrides the heartbeat alarm period when larger than the default of
    /// three missed heartbeats.
    pub message_alarm: Option<Duration>,
    /// Event broadcast channel capacity.
    pub events_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            outbound_capacity: 512,
            discard_when_full: false,
            max_pending_messages: 65_536,
            max_pending_bytes: 64 * 1024 * 1024,
            inbox_prefix: "_INB".to_owned(),
            info_timeout: Duration::from_secs(5),
            utf8_subjects: false,
            message_alarm: None,
            events_capacity: 256,
        }
    }
}

impl ClientOptions {
    pub fn validate(&self) -> Result<()> {
        if self.outbound_capacity == 0 {
            return Err(Error::Validation("outbound_capacity must be at least 1"));
        }
        if self.max_pending_messages == 0 {
            return Err(Error::Validation("max_pending_messages must be at least 1"));
        }
        if self.events_capacity == 0 {
            return Err(Error::Validation("events_capacity must be at least 1"));
        }
        validate_publish_subject(&self.inbox_prefix, false).map_err(Error::Validation)?;
        Ok(())
    }
}

/// Per-subscription overrides.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Queue group for server-side load balancing.
    pub queue: Option<String>,
    /// Pending-message limit; the client default when `None`.
    pub max_pending_messages: Option<usize>,
    /// Pending-byte limit; the client default when `None`.
    pub max_pending_bytes: Option<usize>,
}
