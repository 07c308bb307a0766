//! Subscription handles.
//!
//! [`Subscriber`] is the synchronous shape: the caller pulls messages with
//! `recv`/`next_timeout` from one task at a time.  [`HandlerSubscription`]
//! is the dispatched shape: a single worker task invokes the user's closure
//! serially; errors go to the client event channel instead.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lariat_proto::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::Client;
use crate::dispatcher::Delivery;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// A subscription consumed by calling `recv`.
///
/// Messages for one subscription arrive in wire order.  `recv` may be called
/// from any task but from at most one at a time (it takes `&mut self`).
#[derive(Debug)]
pub struct Subscriber {
    sid: u64,
    subject: String,
    rx: mpsc::Receiver<Delivery>,
    pending_bytes: Arc<AtomicUsize>,
    client: Client,
    closed: bool,
}

impl Subscriber {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        rx: mpsc::Receiver<Delivery>,
        pending_bytes: Arc<AtomicUsize>,
        client: Client,
    ) -> Self {
        Subscriber {
            sid,
            subject,
            rx,
            pending_bytes,
            client,
            closed: false,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub(crate) fn sid(&self) -> u64 {
        self.sid
    }

    /// Await the next message.
    ///
    /// `Ok(None)` means the subscription is finished (unsubscribed, drained,
    /// or the connection closed).  In-band errors (unknown statuses, sequence
    /// gaps) are returned as `Err`; the subscription stays usable afterwards.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.recv_delivery().await {
            None => Ok(None),
            Some(Delivery::Message(message)) => Ok(Some(message)),
            Some(Delivery::Error(error)) => Err(error),
        }
    }

    /// Like [`recv`](Self::recv) but bounded.  A zero duration means "no
    /// wait"; an elapsed deadline returns [`Error::Timeout`].
    pub async fn next_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        if timeout.is_zero() {
            if self.closed {
                return Ok(None);
            }
            return match self.rx.try_recv() {
                Ok(Delivery::Message(message)) => {
                    self.pending_bytes.fetch_sub(message.length, Ordering::Relaxed);
                    Ok(Some(message))
                }
                Ok(Delivery::Error(error)) => Err(error),
                Err(mpsc::error::TryRecvError::Empty) => Err(Error::Timeout),
                Err(mpsc::error::TryRecvError::Disconnected) => Ok(None),
            };
        }
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    pub(crate) async fn recv_delivery(&mut self) -> Option<Delivery> {
        if self.closed {
            return None;
        }
        let delivery = self.rx.recv().await;
        if let Some(Delivery::Message(message)) = &delivery {
            self.pending_bytes.fetch_sub(message.length, Ordering::Relaxed);
        }
        delivery
    }

    /// Stop the subscription immediately.  Buffered messages are discarded.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.client.unsubscribe_sid(self.sid).await
    }

    /// Ask the server to end the subscription after `max` total deliveries.
    /// If that many messages have already been delivered the subscription
    /// ends now.
    pub async fn unsubscribe_after(&mut self, max: u64) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.client.unsubscribe_after_sid(self.sid, max).await
    }

    /// Drain the subscription: unsubscribe server-side, stop local
    /// enqueueing, then wait until the pending queue empties or `timeout`
    /// elapses.  Remaining buffered messages are consumed by the drain;
    /// in-band errors are discarded.  Returns [`Error::Timeout`] when the
    /// queue did not empty in time; the subscription is finished either way.
    pub async fn drain(&mut self, timeout: Duration) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.client.drain_sid(self.sid).await?;
        let emptied = tokio::time::timeout(timeout, async {
            while self.recv_delivery().await.is_some() {}
        })
        .await;
        self.closed = true;
        match emptied {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::Timeout),
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if !self.closed {
            self.client.forget_sid(self.sid);
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerSubscription
// ---------------------------------------------------------------------------

/// A subscription whose messages are delivered to a user closure by a
/// dedicated worker task.  Handlers for one subscription run serially;
/// handlers for different subscriptions run in parallel.
#[derive(Debug)]
pub struct HandlerSubscription {
    sid: u64,
    client: Client,
    worker: JoinHandle<()>,
}

impl HandlerSubscription {
    pub(crate) fn spawn<F>(mut subscriber: Subscriber, mut handler: F) -> Self
    where
        F: FnMut(Message) + Send + 'static,
    {
        let sid = subscriber.sid;
        let client = subscriber.client.clone();
        let events = client.event_sender();
        let worker = tokio::spawn(async move {
            while let Some(delivery) = subscriber.recv_delivery().await {
                match delivery {
                    Delivery::Message(message) => handler(message),
                    Delivery::Error(error) => {
                        let _ = events.send(crate::events::ClientEvent::SubscriptionError {
                            sid,
                            error: error.to_string(),
                        });
                    }
                }
            }
            debug!(sid, "handler worker finished");
        });
        HandlerSubscription {
            sid,
            client,
            worker,
        }
    }

    /// Stop immediately; buffered messages are not handed to the handler.
    pub async fn unsubscribe(self) -> Result<()> {
        self.client.unsubscribe_sid(self.sid).await?;
        self.worker.abort();
        Ok(())
    }

    /// Drain: unsubscribe server-side, let the worker finish the buffered
    /// messages, and wait for it up to `timeout`.
    pub async fn drain(self, timeout: Duration) -> Result<()> {
        self.client.drain_sid(self.sid).await?;
        match tokio::time::timeout(timeout, self.worker).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::Timeout),
        }
    }
}
