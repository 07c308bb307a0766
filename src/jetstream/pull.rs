//! The pull consumer protocol.
//!
//! A pull subscription listens on a unique inbox and publishes pull requests
//! to `$JS.API.CONSUMER.MSG.NEXT.<stream>.<consumer>` with that inbox as the
//! reply subject.  The subscription tracks the outstanding message budget
//! (and byte budget when requested), classifies server statuses, and watches
//! for idle-heartbeat loss:
//!
//! ```text
//! IDLE ──pull()──▶ ACTIVE
//! ACTIVE ──data──▶ ACTIVE (budget decremented)
//! ACTIVE ──budget drained──▶ IDLE
//! ACTIVE ──404/408──▶ IDLE (quiet end)
//! ACTIVE ──409 warning──▶ IDLE (warning event)
//! ACTIVE ──409 error / heartbeat alarm──▶ FAILED
//! any ──unsubscribe──▶ TERMINATED
//! ```

use std::time::Duration;

use lariat_proto::headers::status_text;
use lariat_proto::jetstream::{msg_next_subject, AckKind, PullRequest};
use lariat_proto::{Message, StatusCode};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::message::JsMessage;
use super::Consumer;
use crate::client::Client;
use crate::dispatcher::Delivery;
use crate::error::{Error, Result};
use crate::events::ClientEvent;
use crate::managers::{last_activity, new_activity_clock, ActivityClock, Manager};
use crate::options::SubscribeOptions;
use crate::subscription::Subscriber;

/// Heartbeat alarms never fire more often than this, regardless of
/// configuration.
const MIN_ALARM_PERIOD: Duration = Duration::from_millis(100);

/// The tagged result of [`PullSubscription::next`].
#[derive(Debug)]
pub enum PullOutcome {
    /// A stream message; budgets already decremented.
    Message(JsMessage),
    /// The current pull (or the subscription) is over; see the reason.
    End(EndReason),
    /// Sequence gaps leave the subscription usable; everything else means
    /// the subscription has failed and no further pulls may be issued.
    Error(Error),
}

/// Why `next` returned no message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// No pull outstanding; issue one and call `next` again.
    Drained,
    /// 404: a no-wait pull found the stream empty.
    NoMessages,
    /// 408: the pull waited out its expiry on the server.
    Expired,
    /// A benign 409 ended the pull; a warning event was emitted and pulling
    /// may continue.
    Warning,
    /// 409 "message size exceeds max bytes": the next message would cross
    /// the byte budget.  Expected; not an error.
    MaxBytes,
    /// The subscription is finished (failed, unsubscribed, or connection
    /// closed).
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Active,
    Failed,
    Terminated,
}

impl Consumer {
    /// Open the raw pull protocol for this consumer.
    pub async fn pull_subscription(&self) -> Result<PullSubscription> {
        let inbox = self.client.new_inbox();
        let activity = new_activity_clock();
        let chain = vec![
            Manager::PullStatus,
            Manager::HeartbeatTouch {
                last: activity.clone(),
            },
            Manager::gap_detect(),
        ];
        let sub = self
            .client
            .subscribe_inner(inbox.clone(), SubscribeOptions::default(), chain)
            .await?;
        Ok(PullSubscription {
            client: self.client.clone(),
            sub,
            inbox,
            next_subject: msg_next_subject(&self.prefix, &self.stream, &self.name),
            activity,
            pending_messages: 0,
            pending_bytes: 0,
            tracking_bytes: false,
            idle_heartbeat: None,
            phase: Phase::Idle,
        })
    }
}

/// A bound pull subscription; see the module docs for the state machine.
#[derive(Debug)]
pub struct PullSubscription {
    client: Client,
    sub: Subscriber,
    inbox: String,
    next_subject: String,
    activity: ActivityClock,
    pending_messages: usize,
    pending_bytes: usize,
    tracking_bytes: bool,
    idle_heartbeat: Option<Duration>,
    phase: Phase,
}

impl PullSubscription {
    /// Request `batch` messages with the server's default expiry.
    pub async fn pull(&mut self, batch: usize) -> Result<()> {
        self.pull_with(PullRequest::batch(batch)).await
    }

    /// Request `batch` messages, waiting at most `expires` on the server.
    pub async fn pull_expires(&mut self, batch: usize, expires: Duration) -> Result<()> {
        self.pull_with(PullRequest {
            batch,
            expires: Some(expires),
            ..PullRequest::default()
        })
        .await
    }

    /// Request up to `batch` messages without waiting: the server sends what
    /// it has and ends the pull with a 404.
    pub async fn pull_no_wait(&mut self, batch: usize) -> Result<()> {
        self.pull_with(PullRequest {
            batch,
            no_wait: true,
            ..PullRequest::default()
        })
        .await
    }

    /// Issue a pull request.  Budgets accumulate, so overlapping pulls are
    /// fine; that is how a consume loop keeps the pipeline full.
    pub async fn pull_with(&mut self, request: PullRequest) -> Result<()> {
        validate_pull(&request)?;
        match self.phase {
            Phase::Failed | Phase::Terminated => return Err(Error::Terminated),
            Phase::Idle | Phase::Active => {}
        }
        let payload =
            serde_json::to_vec(&request).map_err(|_| Error::Validation("unencodable pull request"))?;
        self.client
            .publish_with_reply(self.next_subject.clone(), self.inbox.clone(), payload)
            .await?;

        self.pending_messages += request.batch;
        if request.max_bytes > 0 {
            self.tracking_bytes = true;
            self.pending_bytes += request.max_bytes;
        }
        self.idle_heartbeat = request.idle_heartbeat;
        crate::managers::touch(&self.activity);
        self.phase = Phase::Active;
        debug!(
            subject = %self.next_subject,
            batch = request.batch,
            pending = self.pending_messages,
            "pull issued"
        );
        Ok(())
    }

    /// Messages still expected from outstanding pulls.
    pub fn pending_messages(&self) -> usize {
        self.pending_messages
    }

    /// Bytes still expected from outstanding pulls.  Only meaningful while
    /// [`is_tracking_bytes`](Self::is_tracking_bytes) is true.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Whether the outstanding pulls carry a byte budget.
    pub fn is_tracking_bytes(&self) -> bool {
        self.tracking_bytes
    }

    /// Whether every issued pull has been consumed; a new pull may be
    /// issued.
    pub fn is_drained(&self) -> bool {
        self.pending_messages == 0
    }

    /// Await the next outcome: a message, an end-of-pull marker, or an
    /// error.  Idle heartbeats are absorbed here; heartbeat loss fires the
    /// alarm after three missed periods.
    pub async fn next(&mut self) -> PullOutcome {
        loop {
            match self.phase {
                Phase::Failed | Phase::Terminated => return PullOutcome::End(EndReason::Closed),
                Phase::Idle => return PullOutcome::End(EndReason::Drained),
                Phase::Active => {}
            }

            enum Waited {
                Delivery(Option<Delivery>),
                Alarm,
            }
            let waited = {
                let alarm = self.alarm_deadline();
                let recv = self.sub.recv_delivery();
                tokio::pin!(recv);
                match alarm {
                    Some(deadline) => tokio::select! {
                        delivery = &mut recv => Waited::Delivery(delivery),
                        () = tokio::time::sleep_until(deadline) => Waited::Alarm,
                    },
                    None => Waited::Delivery(recv.await),
                }
            };

            match waited {
                Waited::Alarm => {
                    warn!(subject = %self.next_subject, "idle heartbeats missed");
                    let _ = self.client.inner.events.send(ClientEvent::HeartbeatsMissed {
                        sid: self.sub.sid(),
                    });
                    self.end_pull();
                    self.phase = Phase::Failed;
                    return PullOutcome::Error(Error::HeartbeatsMissed);
                }
                Waited::Delivery(None) => {
                    self.phase = Phase::Terminated;
                    return PullOutcome::End(EndReason::Closed);
                }
                Waited::Delivery(Some(Delivery::Error(error))) => {
                    return PullOutcome::Error(error);
                }
                Waited::Delivery(Some(Delivery::Message(message))) => {
                    if message.is_status() {
                        if let Some(outcome) = self.on_status(&message) {
                            return outcome;
                        }
                        continue;
                    }
                    self.note_message(&message);
                    match JsMessage::from_message(message, self.client.clone()) {
                        Ok(js_message) => return PullOutcome::Message(js_message),
                        Err(error) => return PullOutcome::Error(error),
                    }
                }
            }
        }
    }

    /// Ack `message` and request the next batch in a single publish
    /// (`+ACKNXT`), keeping the pipeline full between batches.
    pub async fn ack_next(&mut self, message: &JsMessage, request: PullRequest) -> Result<()> {
        validate_pull(&request)?;
        match self.phase {
            Phase::Failed | Phase::Terminated => return Err(Error::Terminated),
            Phase::Idle | Phase::Active => {}
        }
        message
            .send_ack_with_reply(AckKind::AckNext(request.clone()), &self.inbox)
            .await?;
        self.pending_messages += request.batch;
        if request.max_bytes > 0 {
            self.tracking_bytes = true;
            self.pending_bytes += request.max_bytes;
        }
        self.idle_heartbeat = request.idle_heartbeat;
        crate::managers::touch(&self.activity);
        self.phase = Phase::Active;
        Ok(())
    }

    /// End the subscription.  No further pulls or messages.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        self.phase = Phase::Terminated;
        self.sub.unsubscribe().await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn alarm_deadline(&self) -> Option<Instant> {
        let heartbeat = self.idle_heartbeat?;
        let mut period = heartbeat.saturating_mul(3);
        if let Some(alarm) = self.client.inner.options.message_alarm {
            if alarm > period {
                period = alarm;
            }
        }
        if period < MIN_ALARM_PERIOD {
            period = MIN_ALARM_PERIOD;
        }
        last_activity(&self.activity).checked_add(period)
    }

    fn note_message(&mut self, message: &Message) {
        self.pending_messages = self.pending_messages.saturating_sub(1);
        if self.tracking_bytes {
            self.pending_bytes = self.pending_bytes.saturating_sub(message.length);
        }
        if self.pending_messages == 0 {
            self.end_pull();
        }
    }

    /// Zero the budgets and go idle; a new pull may follow.
    fn end_pull(&mut self) {
        self.pending_messages = 0;
        self.pending_bytes = 0;
        self.tracking_bytes = false;
        self.idle_heartbeat = None;
        if self.phase == Phase::Active {
            self.phase = Phase::Idle;
        }
    }

    /// Classify a status message.  `None` means "absorbed, keep waiting".
    fn on_status(&mut self, message: &Message) -> Option<PullOutcome> {
        let code = message.status().unwrap_or(StatusCode(0));
        let description = message.status_description().unwrap_or_default().to_owned();
        match code {
            // Idle heartbeat: the activity clock was already touched by the
            // manager chain.
            StatusCode::FLOW_CONTROL_OR_HEARTBEAT => None,
            StatusCode::NO_MESSAGES => {
                self.end_pull();
                Some(PullOutcome::End(EndReason::NoMessages))
            }
            StatusCode::REQUEST_TIMEOUT => {
                self.end_pull();
                Some(PullOutcome::End(EndReason::Expired))
            }
            StatusCode::CONFLICT => {
                if description == status_text::MESSAGE_SIZE_EXCEEDS_MAX_BYTES {
                    self.end_pull();
                    Some(PullOutcome::End(EndReason::MaxBytes))
                } else if description.starts_with("Exceeded Max") {
                    // Warning event already emitted by the status manager.
                    self.end_pull();
                    Some(PullOutcome::End(EndReason::Warning))
                } else {
                    self.end_pull();
                    self.phase = Phase::Failed;
                    Some(PullOutcome::Error(Error::Status {
                        code: code.as_u16(),
                        description,
                    }))
                }
            }
            StatusCode::NO_RESPONDERS => {
                self.end_pull();
                self.phase = Phase::Failed;
                Some(PullOutcome::Error(Error::NoResponders))
            }
            other => {
                self.end_pull();
                self.phase = Phase::Failed;
                Some(PullOutcome::Error(Error::Status {
                    code: other.as_u16(),
                    description,
                }))
            }
        }
    }
}

/// Local validation, mirroring what the server would reject.
fn validate_pull(request: &PullRequest) -> Result<()> {
    if request.batch == 0 {
        return Err(Error::Validation("pull batch must be at least 1"));
    }
    if request.no_wait && request.idle_heartbeat.is_some() {
        return Err(Error::Validation(
            "idle heartbeat cannot be combined with no_wait",
        ));
    }
    if let (Some(heartbeat), Some(expires)) = (request.idle_heartbeat, request.expires) {
        if heartbeat > expires / 2 {
            return Err(Error::Validation(
                "idle heartbeat must be at most half of expires",
            ));
        }
    }
    Ok(())
}
