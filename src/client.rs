//! The client handle.
//!
//! `Client` is a cheaply cloneable handle over one connection.  It owns no
//! I/O itself: `connect` splits the provided duplex transport into a reader
//! task and a writer task and everything else talks to them through shared
//! state and the outbound frame queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use lariat_proto::subject::{validate_publish_subject, validate_subject};
use lariat_proto::{ClientOp, HeaderMap, Message, ServerInfo, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

use crate::connection::{run_reader, run_writer};
use crate::dispatcher::{Registry, SubEntry, SubState};
use crate::error::{Error, Result};
use crate::events::ClientEvent;
use crate::inbox::InboxSeries;
use crate::jetstream;
use crate::managers::Manager;
use crate::options::{ClientOptions, SubscribeOptions};
use crate::subscription::{HandlerSubscription, Subscriber};

pub(crate) struct ClientInner {
    pub(crate) out_tx: mpsc::Sender<ClientOp>,
    pub(crate) registry: Registry,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) server_info: RwLock<ServerInfo>,
    pub(crate) pong_waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
    pub(crate) info_ready: Mutex<Option<oneshot::Sender<()>>>,
    pub(crate) inboxes: InboxSeries,
    pub(crate) options: ClientOptions,
    pub(crate) shutdown: watch::Sender<bool>,
}

/// A handle to one connection.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// Drive the given duplex transport as a connection.
    ///
    /// Spawns the reader and writer tasks and waits for the server's `INFO`
    /// (up to `options.info_timeout`).  The transport is anything
    /// `AsyncRead + AsyncWrite`; reconnection is the caller's concern.
    pub async fn connect<S>(io: S, options: ClientOptions) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        options.validate()?;

        let (out_tx, out_rx) = mpsc::channel(options.outbound_capacity);
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(options.events_capacity);
        let (info_tx, info_rx) = oneshot::channel();

        let inner = Arc::new(ClientInner {
            out_tx,
            registry: Registry::new(),
            events,
            server_info: RwLock::new(ServerInfo::default()),
            pong_waiters: Mutex::new(VecDeque::new()),
            info_ready: Mutex::new(Some(info_tx)),
            inboxes: InboxSeries::new(&options.inbox_prefix),
            options,
            shutdown,
        });

        let (read_half, write_half) = tokio::io::split(io);
        tokio::spawn(run_writer(write_half, out_rx, inner.clone()));
        tokio::spawn(run_reader(read_half, inner.clone()));

        let client = Client { inner };
        match tokio::time::timeout(client.inner.options.info_timeout, info_rx).await {
            Ok(Ok(())) => Ok(client),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                client.close();
                Err(Error::Timeout)
            }
        }
    }

    /// Subscribe to client events (slow consumers, warnings, alarms, ...).
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// The event channel as a `Stream`.  A lagging consumer loses the oldest
    /// events rather than blocking the reader.
    pub fn event_stream(&self) -> tokio_stream::wrappers::BroadcastStream<ClientEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.inner.events.subscribe())
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<ClientEvent> {
        self.inner.events.clone()
    }

    /// The most recent `INFO` from the server.
    pub fn server_info(&self) -> ServerInfo {
        self.inner
            .server_info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A unique reply subject for this connection.
    pub fn new_inbox(&self) -> String {
        self.inner.inboxes.next_inbox()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Stop the driver tasks.  Subscriptions observe end-of-stream.
    pub fn close(&self) {
        let _ = self.inner.shutdown.send_replace(true);
    }

    /// Entry point to the JetStream APIs on this connection.
    pub fn jetstream(&self) -> jetstream::Context {
        jetstream::Context::new(self.clone())
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    pub async fn publish(&self, subject: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_message(subject.into(), None, None, payload.into())
            .await
    }

    pub async fn publish_with_reply(
        &self,
        subject: impl Into<String>,
        reply: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_message(subject.into(), Some(reply.into()), None, payload.into())
            .await
    }

    pub async fn publish_with_headers(
        &self,
        subject: impl Into<String>,
        headers: HeaderMap,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_message(subject.into(), None, Some(headers), payload.into())
            .await
    }

    async fn publish_message(
        &self,
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<()> {
        let utf8 = self.inner.options.utf8_subjects;
        validate_publish_subject(&subject, utf8).map_err(Error::Validation)?;
        if let Some(reply) = &reply {
            validate_publish_subject(reply, utf8).map_err(Error::Validation)?;
        }
        let max_payload = self
            .inner
            .server_info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .max_payload;
        if payload.len() > max_payload {
            return Err(Error::MaxPayloadExceeded { max: max_payload });
        }
        self.enqueue(ClientOp::Pub {
            subject,
            reply,
            headers,
            payload,
        })
        .await
    }

    /// Push one frame onto the outbound queue.
    ///
    /// Applies backpressure when the queue is full, unless the client is
    /// configured to discard, in which case it fails fast.
    pub(crate) async fn enqueue(&self, op: ClientOp) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if self.inner.options.discard_when_full {
            self.inner.out_tx.try_send(op).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::OutboundQueueFull,
                mpsc::error::TrySendError::Closed(_) => Error::ConnectionClosed,
            })
        } else {
            self.inner
                .out_tx
                .send(op)
                .await
                .map_err(|_| Error::ConnectionClosed)
        }
    }

    // -----------------------------------------------------------------------
    // Request / reply and flush
    // -----------------------------------------------------------------------

    /// Publish `payload` and await a single reply on a fresh inbox.
    ///
    /// A 503 status reply means nothing is subscribed on `subject` and maps
    /// to [`Error::NoResponders`].
    pub async fn request(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        let subject = subject.into();
        let inbox = self.new_inbox();
        let mut sub = self
            .subscribe_inner(inbox.clone(), SubscribeOptions::default(), Vec::new())
            .await?;
        sub.unsubscribe_after(1).await?;
        self.publish_with_reply(subject, inbox, payload).await?;

        match tokio::time::timeout(timeout, sub.recv()).await {
            Err(_) => {
                sub.unsubscribe().await.ok();
                Err(Error::Timeout)
            }
            Ok(Ok(None)) => Err(Error::ConnectionClosed),
            Ok(Ok(Some(message))) => {
                if message.status() == Some(StatusCode::NO_RESPONDERS) {
                    return Err(Error::NoResponders);
                }
                Ok(message)
            }
            Ok(Err(error)) => Err(error),
        }
    }

    /// Round-trip a PING through the outbound queue; resolves once the
    /// matching PONG arrives, i.e. everything enqueued before the flush has
    /// reached the server.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .pong_waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(tx);
        self.enqueue(ClientOp::Ping).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::Timeout),
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub async fn subscribe(&self, subject: impl Into<String>) -> Result<Subscriber> {
        self.subscribe_with(subject, SubscribeOptions::default())
            .await
    }

    pub async fn subscribe_with(
        &self,
        subject: impl Into<String>,
        options: SubscribeOptions,
    ) -> Result<Subscriber> {
        self.subscribe_inner(subject.into(), options, Vec::new())
            .await
    }

    /// Subscribe with a handler closure invoked serially by a worker task.
    pub async fn subscribe_with_handler<F>(
        &self,
        subject: impl Into<String>,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<HandlerSubscription>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let subscriber = self
            .subscribe_inner(subject.into(), options, Vec::new())
            .await?;
        Ok(HandlerSubscription::spawn(subscriber, handler))
    }

    pub(crate) async fn subscribe_inner(
        &self,
        subject: String,
        options: SubscribeOptions,
        chain: Vec<Manager>,
    ) -> Result<Subscriber> {
        let utf8 = self.inner.options.utf8_subjects;
        validate_subject(&subject, true, utf8).map_err(Error::Validation)?;
        if let Some(queue) = &options.queue {
            validate_publish_subject(queue, utf8).map_err(Error::Validation)?;
        }
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let sid = self.inner.registry.next_sid();
        let capacity = options
            .max_pending_messages
            .unwrap_or(self.inner.options.max_pending_messages);
        let max_pending_bytes = options
            .max_pending_bytes
            .unwrap_or(self.inner.options.max_pending_bytes);
        let (tx, rx) = mpsc::channel(capacity);
        let pending_bytes = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let entry = Arc::new(SubEntry {
            subject: subject.clone(),
            queue: options.queue.clone(),
            tx,
            pending_bytes: pending_bytes.clone(),
            max_pending_bytes,
            state: Mutex::new(SubState {
                delivered: 0,
                remaining: None,
                slow: false,
                draining: false,
                chain,
            }),
        });
        // Register before SUB goes out so the first reply cannot race the
        // registry.
        self.inner.registry.insert(sid, entry);

        let sub_op = ClientOp::Sub {
            sid,
            subject: subject.clone(),
            queue: options.queue,
        };
        if let Err(error) = self.enqueue(sub_op).await {
            self.inner.registry.remove(sid);
            return Err(error);
        }
        debug!(sid, subject = %subject, "subscribed");
        Ok(Subscriber::new(sid, subject, rx, pending_bytes, self.clone()))
    }

    pub(crate) async fn unsubscribe_sid(&self, sid: u64) -> Result<()> {
        self.inner.registry.remove(sid);
        // Losing the race with connection teardown is fine; the server side
        // is gone anyway.
        self.enqueue(ClientOp::Unsub { sid, max: None }).await.ok();
        Ok(())
    }

    pub(crate) async fn unsubscribe_after_sid(&self, sid: u64, max: u64) -> Result<()> {
        let Some(entry) = self.inner.registry.get(sid) else {
            return Ok(());
        };
        let reached = {
            let mut state = entry
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.delivered >= max {
                true
            } else {
                state.remaining = Some(max - state.delivered);
                false
            }
        };
        if reached {
            return self.unsubscribe_sid(sid).await;
        }
        self.enqueue(ClientOp::Unsub {
            sid,
            max: Some(max),
        })
        .await
    }

    /// Server-side unsubscribe plus local removal; the pending queue closes
    /// after its buffered messages, so the holder drains naturally.  The
    /// draining mark stops a dispatch that is already holding the entry.
    pub(crate) async fn drain_sid(&self, sid: u64) -> Result<()> {
        if let Some(entry) = self.inner.registry.get(sid) {
            entry
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .draining = true;
        }
        self.inner.registry.remove(sid);
        self.enqueue(ClientOp::Unsub { sid, max: None }).await.ok();
        Ok(())
    }

    /// Best-effort cleanup from `Drop` contexts.
    pub(crate) fn forget_sid(&self, sid: u64) {
        if self.inner.registry.remove(sid).is_some() {
            let _ = self.inner.out_tx.try_send(ClientOp::Unsub { sid, max: None });
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
