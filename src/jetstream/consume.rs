//! The simplified consuming shapes: bounded fetches and the long-running
//! consume loop with threshold repulling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use lariat_proto::jetstream::PullRequest;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::message::JsMessage;
use super::pull::{EndReason, PullOutcome, PullSubscription};
use super::Consumer;
use crate::error::{Error, Result};

const MAX_DERIVED_HEARTBEAT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Configuration for a bounded [`FetchBatch`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// At most this many messages are delivered.
    pub max_messages: usize,
    /// Byte budget for the fetch; 0 means unbounded.
    pub max_bytes: usize,
    /// How long the server may hold the pull open waiting for messages.
    pub expires: Duration,
    /// Return immediately with whatever is available instead of waiting.
    pub no_wait: bool,
    /// Ask the server for liveness heartbeats while waiting.
    pub idle_heartbeat: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            max_messages: 100,
            max_bytes: 0,
            expires: Duration::from_secs(30),
            no_wait: false,
            idle_heartbeat: None,
        }
    }
}

impl FetchOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_messages == 0 {
            return Err(Error::Validation("max_messages must be at least 1"));
        }
        if !self.no_wait && self.expires < Duration::from_secs(1) {
            return Err(Error::Validation("expires must be at least one second"));
        }
        if self.no_wait && self.idle_heartbeat.is_some() {
            return Err(Error::Validation(
                "idle heartbeat cannot be combined with no_wait",
            ));
        }
        if let Some(heartbeat) = self.idle_heartbeat {
            if heartbeat > self.expires / 2 {
                return Err(Error::Validation(
                    "idle heartbeat must be at most half of expires",
                ));
            }
        }
        Ok(())
    }
}

/// Configuration for the long-running [`Messages`] loop.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Target number of outstanding messages.
    pub batch: usize,
    /// Per-pull byte budget; 0 means unbounded.
    pub batch_bytes: usize,
    /// Server-side expiry of each pull.
    pub expires: Duration,
    /// Repull once the outstanding budget falls to `batch * (100 - T) / 100`
    /// messages, or analogously `batch_bytes * (100 - T) / 100` bytes when a
    /// byte budget is set.
    pub threshold_percent: u8,
    /// Liveness heartbeat period; derived as `min(expires / 2, 30s)` when
    /// unset.
    pub idle_heartbeat: Option<Duration>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            batch: 500,
            batch_bytes: 0,
            expires: Duration::from_secs(30),
            threshold_percent: 25,
            idle_heartbeat: None,
        }
    }
}

impl ConsumeOptions {
    pub fn validate(&self) -> Result<()> {
        if self.batch == 0 {
            return Err(Error::Validation("batch must be at least 1"));
        }
        if self.expires < Duration::from_secs(1) {
            return Err(Error::Validation("expires must be at least one second"));
        }
        if self.threshold_percent == 0 || self.threshold_percent > 100 {
            return Err(Error::Validation(
                "threshold_percent must be between 1 and 100",
            ));
        }
        if let Some(heartbeat) = self.idle_heartbeat {
            if heartbeat > self.expires / 2 {
                return Err(Error::Validation(
                    "idle heartbeat must be at most half of expires",
                ));
            }
        }
        Ok(())
    }

    fn heartbeat(&self) -> Duration {
        self.idle_heartbeat
            .unwrap_or_else(|| (self.expires / 2).min(MAX_DERIVED_HEARTBEAT))
    }

    fn repull_threshold(&self) -> usize {
        self.batch * (100 - usize::from(self.threshold_percent)) / 100
    }

    fn repull_byte_threshold(&self) -> usize {
        self.batch_bytes * (100 - usize::from(self.threshold_percent)) / 100
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

impl Consumer {
    /// Issue one bounded pull and return the batch.
    pub async fn fetch(&self, options: FetchOptions) -> Result<FetchBatch> {
        options.validate()?;
        let mut sub = self.pull_subscription().await?;
        let request = PullRequest {
            batch: options.max_messages,
            max_bytes: options.max_bytes,
            expires: if options.no_wait {
                None
            } else {
                Some(options.expires)
            },
            idle_heartbeat: options.idle_heartbeat,
            no_wait: options.no_wait,
        };
        sub.pull_with(request).await?;
        let deadline = Instant::now() + options.expires + expiry_grace(options.expires);
        Ok(FetchBatch {
            sub,
            deadline,
            finished: false,
        })
    }

    /// Fetch up to `max_messages` with the default options.
    pub async fn fetch_max(&self, max_messages: usize) -> Result<FetchBatch> {
        self.fetch(FetchOptions {
            max_messages,
            ..FetchOptions::default()
        })
        .await
    }

    /// Start the long-running consume loop.
    pub async fn messages(&self, options: ConsumeOptions) -> Result<Messages> {
        options.validate()?;
        let sub = self.pull_subscription().await?;
        Ok(Messages {
            sub,
            options,
            stop: Arc::new(StopSignal::default()),
            draining: false,
            finished: false,
        })
    }
}

/// Wall-clock slack past the server-side expiry before a fetch gives up
/// locally.
fn expiry_grace(expires: Duration) -> Duration {
    (expires / 10).clamp(Duration::from_millis(100), Duration::from_secs(1))
}

/// One bounded batch: `next` yields until the batch, the byte budget, or the
/// expiry is exhausted, then `None` forever.
#[derive(Debug)]
pub struct FetchBatch {
    sub: PullSubscription,
    deadline: Instant,
    finished: bool,
}

impl FetchBatch {
    /// The next message, or `None` once the fetch is complete.
    pub async fn next(&mut self) -> Result<Option<JsMessage>> {
        loop {
            if self.finished {
                return Ok(None);
            }

            enum Waited {
                Outcome(PullOutcome),
                Deadline,
            }
            let waited = {
                let deadline = self.deadline;
                let next = self.sub.next();
                tokio::pin!(next);
                tokio::select! {
                    outcome = &mut next => Waited::Outcome(outcome),
                    () = tokio::time::sleep_until(deadline) => Waited::Deadline,
                }
            };

            match waited {
                Waited::Deadline => {
                    self.finish().await;
                    return Ok(None);
                }
                Waited::Outcome(PullOutcome::Message(message)) => return Ok(Some(message)),
                Waited::Outcome(PullOutcome::End(_)) => {
                    self.finish().await;
                    return Ok(None);
                }
                Waited::Outcome(PullOutcome::Error(error)) => {
                    if matches!(error, Error::SequenceGap { .. }) {
                        // Reported; the batch continues from the new
                        // baseline.
                        return Err(error);
                    }
                    self.finish().await;
                    return Err(error);
                }
            }
        }
    }

    async fn finish(&mut self) {
        self.finished = true;
        let _ = self.sub.unsubscribe().await;
    }
}

// ---------------------------------------------------------------------------
// Long-running consume
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

/// Stops a [`Messages`] loop from any task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    signal: Arc<StopSignal>,
}

impl StopHandle {
    /// Stop issuing pulls.  The loop drains the outstanding pull, then
    /// unsubscribes and ends.
    pub fn stop(&self) {
        self.signal.stopped.store(true, Ordering::SeqCst);
        self.signal.notify.notify_waiters();
    }
}

/// The long-running consume loop.
///
/// Keeps the server-side pipeline topped up: once the outstanding budget
/// falls to the configured threshold, the consumed amount is repulled before
/// the current pull drains, so delivery never pauses between batches.
#[derive(Debug)]
pub struct Messages {
    sub: PullSubscription,
    options: ConsumeOptions,
    stop: Arc<StopSignal>,
    draining: bool,
    finished: bool,
}

impl Messages {
    /// A handle that stops this loop from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            signal: self.stop.clone(),
        }
    }

    /// Stop issuing pulls and drain the outstanding one.
    pub fn stop(&mut self) {
        self.stop.stopped.store(true, Ordering::SeqCst);
        self.draining = true;
    }

    /// The next message, an in-band error, or `None` once stopped and
    /// drained (or failed).
    pub async fn next(&mut self) -> Option<Result<JsMessage>> {
        loop {
            if self.finished {
                return None;
            }
            if !self.draining && self.stop.stopped.load(Ordering::SeqCst) {
                self.draining = true;
            }
            if !self.draining {
                let pending = self.sub.pending_messages();
                let pending_bytes = self.sub.pending_bytes();
                let messages_low = pending <= self.options.repull_threshold();
                let bytes_low = self.options.batch_bytes > 0
                    && self.sub.is_tracking_bytes()
                    && pending_bytes <= self.options.repull_byte_threshold();
                if messages_low || bytes_low {
                    // Repull the consumed amounts, topping both budgets back
                    // up to their configured targets.
                    let request = PullRequest {
                        batch: self.options.batch.saturating_sub(pending).max(1),
                        max_bytes: if self.options.batch_bytes > 0 {
                            self.options.batch_bytes.saturating_sub(pending_bytes).max(1)
                        } else {
                            0
                        },
                        expires: Some(self.options.expires),
                        idle_heartbeat: Some(self.options.heartbeat()),
                        no_wait: false,
                    };
                    debug!(
                        batch = request.batch,
                        max_bytes = request.max_bytes,
                        pending,
                        pending_bytes,
                        "topping up consume pipeline"
                    );
                    if let Err(error) = self.sub.pull_with(request).await {
                        self.finished = true;
                        return Some(Err(error));
                    }
                }
            }

            enum Waited {
                Outcome(PullOutcome),
                Stopped,
            }
            let waited = {
                let signal = self.stop.clone();
                let next = self.sub.next();
                tokio::pin!(next);
                if self.draining {
                    Waited::Outcome(next.await)
                } else {
                    tokio::select! {
                        outcome = &mut next => Waited::Outcome(outcome),
                        () = signal.notify.notified() => Waited::Stopped,
                    }
                }
            };

            match waited {
                Waited::Stopped => {
                    self.draining = true;
                }
                Waited::Outcome(PullOutcome::Message(message)) => return Some(Ok(message)),
                Waited::Outcome(PullOutcome::End(reason)) => {
                    if self.draining || reason == EndReason::Closed {
                        self.finished = true;
                        let _ = self.sub.unsubscribe().await;
                        return None;
                    }
                    // Quiet end of the current pull (drained, 404, 408, or a
                    // warning variant): the loop repulls at the top.
                }
                Waited::Outcome(PullOutcome::Error(error)) => {
                    if matches!(error, Error::SequenceGap { .. }) {
                        return Some(Err(error));
                    }
                    self.finished = true;
                    let _ = self.sub.unsubscribe().await;
                    return Some(Err(error));
                }
            }
        }
    }

    /// Adapt the loop into a `futures` stream.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<JsMessage>> {
        async_stream::stream! {
            while let Some(item) = self.next().await {
                yield item;
            }
        }
    }
}
