//! JetStream: durable streams consumed through pull subscriptions.
//!
//! [`Context`] binds a connection to the JetStream API prefix.  A
//! [`Consumer`] names a stream + consumer pair and hands out the consuming
//! shapes: the raw [`pull::PullSubscription`] protocol, bounded
//! [`consume::FetchBatch`]es, and the long-running [`consume::Messages`]
//! loop.  Stream and consumer administration is somebody else's RPC; only
//! names travel here.

pub mod consume;
pub mod message;
pub mod pull;

use lariat_proto::jetstream::DEFAULT_API_PREFIX;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::managers::{new_activity_clock, Manager};
use crate::options::SubscribeOptions;
use crate::subscription::Subscriber;

pub use consume::{ConsumeOptions, FetchBatch, FetchOptions, Messages, StopHandle};
pub use message::JsMessage;
pub use pull::{EndReason, PullOutcome, PullSubscription};

/// Entry point to JetStream on one connection.
#[derive(Debug, Clone)]
pub struct Context {
    client: Client,
    prefix: String,
}

impl Context {
    pub(crate) fn new(client: Client) -> Self {
        Context {
            client,
            prefix: DEFAULT_API_PREFIX.to_owned(),
        }
    }

    /// Use a non-default API prefix (accounts, domains).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Bind a named stream + pull consumer pair.
    pub fn consumer(
        &self,
        stream: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Consumer> {
        let stream = stream.into();
        let consumer = consumer.into();
        validate_name(&stream)?;
        validate_name(&consumer)?;
        Ok(Consumer {
            client: self.client.clone(),
            prefix: self.prefix.clone(),
            stream,
            name: consumer,
        })
    }

    /// Subscribe to a push consumer's deliver subject.
    ///
    /// The returned subscription answers flow-control requests, absorbs idle
    /// heartbeats, and reports consumer-sequence gaps; everything else
    /// reaches the caller.  The chain matches the pull side: status filter,
    /// then the activity touch (any frame resets the liveness clock), then
    /// the gap detector.
    pub async fn push_subscription(
        &self,
        deliver_subject: impl Into<String>,
    ) -> Result<Subscriber> {
        let activity = new_activity_clock();
        let chain = vec![
            Manager::push_status(activity.clone()),
            Manager::HeartbeatTouch {
                last: activity.clone(),
            },
            Manager::gap_detect(),
        ];
        self.client
            .subscribe_inner(deliver_subject.into(), SubscribeOptions::default(), chain)
            .await
    }
}

/// A named stream + consumer binding.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub(crate) client: Client,
    pub(crate) prefix: String,
    pub(crate) stream: String,
    pub(crate) name: String,
}

impl Consumer {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Stream and consumer names are single tokens: no dots, spaces, or
/// wildcards.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("name must not be empty"));
    }
    if name
        .chars()
        .any(|c| c == '.' || c == '*' || c == '>' || c == ' ' || c == '\t' || c == '\r' || c == '\n')
    {
        return Err(Error::Validation("name contains illegal characters"));
    }
    Ok(())
}
