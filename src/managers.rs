//! Per-subscription message managers.
//!
//! A subscription's chain is a fixed-order list of interceptors assembled at
//! subscribe time.  Each sees every inbound message for the subscription and
//! decides whether the message continues toward the pending queue:
//!
//! 1. status filter (pull or push flavour)
//! 2. heartbeat touch (mere arrival resets the liveness clock)
//! 3. gap detector
//!
//! The chain runs on the reader task; no user code executes here.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lariat_proto::headers::status_text;
use lariat_proto::jetstream::{AckMetadata, ACK_REPLY_PREFIX};
use lariat_proto::{ClientOp, Message, StatusCode};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::Error;
use crate::events::ClientEvent;

/// Outcome of one manager looking at one message.
pub(crate) enum Verdict {
    /// Continue down the chain and toward the pending queue.
    Pass,
    /// Fully consumed; the user never sees it.
    Handled,
    /// Replace the message with an in-band error (thrown from `next` in sync
    /// mode, routed to the event channel by handler workers).
    Error(Error),
}

/// Reader-side context handed to the chain.
pub(crate) struct DispatchCtx<'a> {
    pub sid: u64,
    pub out_tx: &'a mpsc::Sender<ClientOp>,
    pub events: &'a broadcast::Sender<ClientEvent>,
}

/// Shared last-activity clock, reset on every frame for the subscription.
pub(crate) type ActivityClock = Arc<Mutex<Instant>>;

pub(crate) fn new_activity_clock() -> ActivityClock {
    Arc::new(Mutex::new(Instant::now()))
}

pub(crate) fn touch(clock: &ActivityClock) {
    *lock_unpoisoned(clock) = Instant::now();
}

pub(crate) fn last_activity(clock: &ActivityClock) -> Instant {
    *lock_unpoisoned(clock)
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub(crate) enum Manager {
    /// Pull-mode status filter: emits warnings for the benign 409 variants
    /// and lets every status travel in-band so the pull state machine can
    /// observe end-of-pull conditions.
    PullStatus,
    /// Push-mode status filter: answers flow-control requests (once per
    /// distinct reply subject), absorbs idle heartbeats, and converts any
    /// other status into an in-band error.
    PushStatus {
        heartbeat: ActivityClock,
        flow_replied: HashSet<String>,
    },
    /// Resets the subscription's activity clock on every frame.
    HeartbeatTouch { last: ActivityClock },
    /// Watches the consumer sequence embedded in `$JS.ACK` replies and
    /// records discontinuities.
    GapDetect {
        last_seq: Option<u64>,
        gap: Option<(u64, u64)>,
    },
}

impl Manager {
    pub fn gap_detect() -> Self {
        Manager::GapDetect {
            last_seq: None,
            gap: None,
        }
    }

    pub fn push_status(heartbeat: ActivityClock) -> Self {
        Manager::PushStatus {
            heartbeat,
            flow_replied: HashSet::new(),
        }
    }

    pub fn process(&mut self, message: &Message, ctx: &DispatchCtx<'_>) -> Verdict {
        match self {
            Manager::PullStatus => pull_status(message, ctx),
            Manager::PushStatus {
                heartbeat,
                flow_replied,
            } => push_status(message, ctx, heartbeat, flow_replied),
            Manager::HeartbeatTouch { last } => {
                touch(last);
                Verdict::Pass
            }
            Manager::GapDetect { last_seq, gap } => gap_detect(message, ctx, last_seq, gap),
        }
    }

    /// A gap recorded by the most recent `process` call, if any.
    pub fn take_gap(&mut self) -> Option<(u64, u64)> {
        match self {
            Manager::GapDetect { gap, .. } => gap.take(),
            _ => None,
        }
    }
}

fn pull_status(message: &Message, ctx: &DispatchCtx<'_>) -> Verdict {
    if !message.is_status() {
        return Verdict::Pass;
    }
    let code = message.status().unwrap_or(StatusCode(0));
    let description = message.status_description().unwrap_or_default();
    if code == StatusCode::CONFLICT && description.starts_with("Exceeded Max") {
        debug!(sid = ctx.sid, %code, description, "pull warning");
        let _ = ctx.events.send(ClientEvent::StatusWarning {
            sid: ctx.sid,
            code: code.as_u16(),
            description: description.to_owned(),
        });
    }
    // End-of-pull handling needs the budget state, which lives with the pull
    // subscription; statuses travel in-band to it.
    Verdict::Pass
}

fn push_status(
    message: &Message,
    ctx: &DispatchCtx<'_>,
    heartbeat: &ActivityClock,
    flow_replied: &mut HashSet<String>,
) -> Verdict {
    if !message.is_status() {
        return Verdict::Pass;
    }
    let code = message.status().unwrap_or(StatusCode(0));
    let description = message.status_description().unwrap_or_default();
    if code == StatusCode::FLOW_CONTROL_OR_HEARTBEAT {
        if description == status_text::FLOW_CONTROL_REQUEST {
            if let Some(reply) = &message.reply {
                if flow_replied.insert(reply.clone()) {
                    trace!(sid = ctx.sid, reply = %reply, "answering flow control request");
                    let _ = ctx.out_tx.try_send(ClientOp::Pub {
                        subject: reply.clone(),
                        reply: None,
                        headers: None,
                        payload: Bytes::new(),
                    });
                }
            }
            return Verdict::Handled;
        }
        // Idle heartbeat, or an unknown 100: liveness signal either way.
        touch(heartbeat);
        return Verdict::Handled;
    }
    Verdict::Error(Error::Status {
        code: code.as_u16(),
        description: description.to_owned(),
    })
}

fn gap_detect(
    message: &Message,
    ctx: &DispatchCtx<'_>,
    last_seq: &mut Option<u64>,
    gap: &mut Option<(u64, u64)>,
) -> Verdict {
    if message.is_status() {
        return Verdict::Pass;
    }
    let Some(reply) = &message.reply else {
        return Verdict::Pass;
    };
    if !reply.starts_with(ACK_REPLY_PREFIX) {
        return Verdict::Pass;
    }
    let Ok(metadata) = AckMetadata::parse(reply) else {
        return Verdict::Pass;
    };
    if let Some(last) = *last_seq {
        let expected = last + 1;
        if metadata.consumer_sequence != expected {
            debug!(
                sid = ctx.sid,
                expected,
                observed = metadata.consumer_sequence,
                "consumer sequence gap"
            );
            let _ = ctx.events.send(ClientEvent::SequenceGap {
                sid: ctx.sid,
                expected,
                observed: metadata.consumer_sequence,
            });
            *gap = Some((expected, metadata.consumer_sequence));
        }
    }
    *last_seq = Some(metadata.consumer_sequence);
    Verdict::Pass
}
