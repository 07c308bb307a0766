//! Reply inbox generation.
//!
//! Inboxes are `<prefix>.<connection-id>.<n>`: one random connection id per
//! client, one atomic counter.  Uniqueness needs no coordination and no
//! per-request randomness.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

#[derive(Debug)]
pub(crate) struct InboxSeries {
    prefix: String,
    next: AtomicU64,
}

impl InboxSeries {
    pub fn new(prefix: &str) -> Self {
        InboxSeries {
            prefix: format!("{prefix}.{}", Uuid::new_v4().simple()),
            next: AtomicU64::new(1),
        }
    }

    pub fn next_inbox(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}.{n}", self.prefix)
    }
}
