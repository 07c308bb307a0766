//! Stream messages and the ack protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use lariat_proto::jetstream::{AckKind, AckMetadata};
use lariat_proto::Message;

use crate::client::Client;
use crate::error::{Error, Result};

/// A message delivered from a stream, with its `$JS.ACK` metadata parsed and
/// the ack verbs attached.
///
/// The ack state is a terminal latch: the first terminal verb (`ack`, `nak`,
/// `term`, ack-next) wins and every later ack attempt on the same message is
/// a no-op.
#[derive(Debug)]
pub struct JsMessage {
    message: Message,
    metadata: AckMetadata,
    client: Client,
    acked: AtomicBool,
}

impl std::ops::Deref for JsMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl JsMessage {
    pub(crate) fn from_message(message: Message, client: Client) -> Result<Self> {
        let reply = message
            .reply
            .as_deref()
            .ok_or(Error::Validation("stream message has no reply subject"))?;
        let metadata = AckMetadata::parse(reply)?;
        Ok(JsMessage {
            message,
            metadata,
            client,
            acked: AtomicBool::new(false),
        })
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn metadata(&self) -> &AckMetadata {
        &self.metadata
    }

    /// Positive acknowledgement; the message will not be redelivered.
    pub async fn ack(&self) -> Result<()> {
        self.send_ack(AckKind::Ack).await
    }

    /// Negative acknowledgement; redelivery per consumer policy.
    pub async fn nak(&self) -> Result<()> {
        self.send_ack(AckKind::Nak).await
    }

    /// Negative acknowledgement with a redelivery delay.
    pub async fn nak_with_delay(&self, delay: Duration) -> Result<()> {
        self.send_ack(AckKind::NakWithDelay(delay)).await
    }

    /// Stop redelivery without counting the message as processed.
    pub async fn term(&self) -> Result<()> {
        self.send_ack(AckKind::Term).await
    }

    /// Reset the ack-wait timer; processing continues.
    pub async fn in_progress(&self) -> Result<()> {
        self.send_ack(AckKind::InProgress).await
    }

    /// Acknowledge and wait for the server's confirmation.
    ///
    /// Fails with [`Error::Timeout`] when no confirmation arrives in time;
    /// the latch is set regardless, so the ack is not retried implicitly.
    pub async fn ack_sync(&self, timeout: Duration) -> Result<()> {
        let Some(reply) = self.message.reply.clone() else {
            return Err(Error::Validation("message has no reply subject"));
        };
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client
            .request(reply, Bytes::from_static(b"+ACK"), timeout)
            .await?;
        Ok(())
    }

    pub(crate) async fn send_ack(&self, kind: AckKind) -> Result<()> {
        let Some(reply) = self.message.reply.clone() else {
            return Err(Error::Validation("message has no reply subject"));
        };
        if kind.is_terminal() {
            if self.acked.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        } else if self.acked.load(Ordering::SeqCst) {
            return Ok(());
        }
        let payload = kind
            .payload()
            .map_err(|_| Error::Validation("unencodable ack payload"))?;
        self.client.publish(reply, payload).await
    }

    /// Whether a terminal ack has been sent for this message.
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    /// Publish an ack verb with an explicit reply subject.  Used by the
    /// ack-next composite, which wants the next batch delivered to the pull
    /// inbox.
    pub(crate) async fn send_ack_with_reply(&self, kind: AckKind, reply_to: &str) -> Result<()> {
        let Some(reply) = self.message.reply.clone() else {
            return Err(Error::Validation("message has no reply subject"));
        };
        if kind.is_terminal() && self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let payload = kind
            .payload()
            .map_err(|_| Error::Validation("unencodable ack payload"))?;
        self.client
            .publish_with_reply(reply, reply_to.to_owned(), payload)
            .await
    }
}
