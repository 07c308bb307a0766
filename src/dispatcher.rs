//! The sid -> subscription registry and the inbound dispatch path.
//!
//! Registration and removal take the write lock; the reader task only ever
//! takes the read lock and the per-entry state mutex, both uncontended in
//! steady state.  Each subscription's pending queue is a bounded mpsc channel
//! (producer: reader task, consumer: one user task), with a byte counter
//! alongside it.  Overflow drops the message, marks the subscription slow,
//! and emits one event per threshold crossing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use lariat_proto::Message;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::events::ClientEvent;
use crate::managers::{DispatchCtx, Manager, Verdict};

/// One item on a subscription's pending queue.
#[derive(Debug)]
pub(crate) enum Delivery {
    Message(Message),
    Error(Error),
}

/// Follow-up work the reader must do after a dispatch.
#[derive(Debug)]
pub(crate) enum PostAction {
    /// Remove the subscription; optionally tell the server.
    Remove { sid: u64, send_unsub: bool },
}

pub(crate) struct SubEntry {
    pub subject: String,
    pub queue: Option<String>,
    pub tx: mpsc::Sender<Delivery>,
    pub pending_bytes: Arc<AtomicUsize>,
    pub max_pending_bytes: usize,
    pub state: Mutex<SubState>,
}

pub(crate) struct SubState {
    pub delivered: u64,
    /// Deliveries left before auto-unsubscribe, when set.
    pub remaining: Option<u64>,
    /// Currently over a pending limit; cleared on the next successful
    /// enqueue.
    pub slow: bool,
    /// Draining: no further local enqueues.
    pub draining: bool,
    pub chain: Vec<Manager>,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub(crate) struct Registry {
    subs: RwLock<HashMap<u64, Arc<SubEntry>>>,
    next_sid: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            subs: RwLock::new(HashMap::new()),
            next_sid: AtomicU64::new(1),
        }
    }

    pub fn next_sid(&self) -> u64 {
        self.next_sid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, sid: u64, entry: Arc<SubEntry>) {
        self.subs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sid, entry);
    }

    pub fn remove(&self, sid: u64) -> Option<Arc<SubEntry>> {
        self.subs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sid)
    }

    pub fn get(&self, sid: u64) -> Option<Arc<SubEntry>> {
        self.subs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sid)
            .cloned()
    }

    /// Drop every entry; pending-queue senders close and consumers observe
    /// end-of-stream.
    pub fn clear(&self) {
        self.subs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Route one inbound data frame.  Runs on the reader task only.
    pub fn dispatch(
        &self,
        sid: u64,
        message: Message,
        ctx: &DispatchCtx<'_>,
    ) -> Option<PostAction> {
        let Some(entry) = self.get(sid) else {
            trace!(sid, subject = %message.subject, "frame for unknown sid, discarding");
            return None;
        };
        let mut state = lock_unpoisoned(&entry.state);

        if state.draining {
            return None;
        }
        if state.remaining == Some(0) {
            // Auto-unsub threshold already reached; the entry is on its way
            // out.
            return Some(PostAction::Remove {
                sid,
                send_unsub: true,
            });
        }

        for manager in &mut state.chain {
            match manager.process(&message, ctx) {
                Verdict::Pass => {}
                Verdict::Handled => return None,
                Verdict::Error(error) => {
                    let _ = entry.tx.try_send(Delivery::Error(error));
                    return None;
                }
            }
        }
        for manager in &mut state.chain {
            if let Some((expected, observed)) = manager.take_gap() {
                let _ = entry
                    .tx
                    .try_send(Delivery::Error(Error::SequenceGap { expected, observed }));
            }
        }

        let length = message.length;
        let over_bytes = entry.max_pending_bytes > 0
            && entry.pending_bytes.load(Ordering::Relaxed) + length > entry.max_pending_bytes;
        if over_bytes {
            self.note_slow(&entry, &mut state, sid, ctx);
            return None;
        }

        match entry.tx.try_send(Delivery::Message(message)) {
            Ok(()) => {
                entry.pending_bytes.fetch_add(length, Ordering::Relaxed);
                state.slow = false;
                state.delivered += 1;
                if let Some(remaining) = &mut state.remaining {
                    *remaining -= 1;
                    if *remaining == 0 {
                        debug!(sid, "auto-unsubscribe threshold reached");
                        // The server already saw `UNSUB sid n`; local removal
                        // only.
                        return Some(PostAction::Remove {
                            sid,
                            send_unsub: false,
                        });
                    }
                }
                None
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.note_slow(&entry, &mut state, sid, ctx);
                None
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Some(PostAction::Remove {
                sid,
                send_unsub: true,
            }),
        }
    }

    fn note_slow(
        &self,
        entry: &SubEntry,
        state: &mut SubState,
        sid: u64,
        ctx: &DispatchCtx<'_>,
    ) {
        if !state.slow {
            state.slow = true;
            warn!(
                sid,
                subject = %entry.subject,
                queue = ?entry.queue,
                "slow consumer, dropping message"
            );
            let _ = ctx.events.send(ClientEvent::SlowConsumer {
                sid,
                subject: entry.subject.clone(),
            });
        }
    }
}
