//! Connection driver tasks.
//!
//! One reader task decodes frames off the transport and dispatches them; no
//! user code runs there.  One writer task drains the outbound frame queue,
//! coalescing whatever is ready into a single write.  Both watch the shared
//! shutdown channel; either side failing tears the connection down and wakes
//! every blocked caller.
//!
//! The transport is any `AsyncRead + AsyncWrite` duplex (TCP, TLS, or an
//! in-process pipe).  Reconnecting is the transport owner's concern.

use std::sync::{Arc, PoisonError};

use bytes::BytesMut;
use lariat_proto::{ClientOp, ServerDecoder, ServerOp};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::client::ClientInner;
use crate::dispatcher::PostAction;
use crate::error::Error;
use crate::events::ClientEvent;
use crate::managers::DispatchCtx;

const READ_CHUNK: usize = 16 * 1024;

pub(crate) async fn run_reader<R>(mut io: R, inner: Arc<ClientInner>)
where
    R: AsyncRead + Unpin,
{
    let mut shutdown = inner.shutdown.subscribe();
    let mut decoder = ServerDecoder::new();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let result: Result<(), Error> = async {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                read = io.read_buf(&mut buf) => {
                    if read? == 0 {
                        return Err(Error::ConnectionClosed);
                    }
                    while let Some(op) = decoder.decode(&mut buf)? {
                        handle_op(&inner, op).await?;
                    }
                    buf.reserve(READ_CHUNK);
                }
            }
        }
    }
    .await;

    match result {
        Ok(()) => debug!("reader task stopped"),
        Err(e) => {
            warn!(error = %e, "connection failed");
            let _ = inner.events.send(ClientEvent::ConnectionError(e.to_string()));
        }
    }
    teardown(&inner);
}

async fn handle_op(inner: &Arc<ClientInner>, op: ServerOp) -> Result<(), Error> {
    match op {
        ServerOp::Info(server_info) => {
            trace!(server_id = %server_info.server_id, "INFO received");
            if server_info.lame_duck_mode {
                info!("server entered lame duck mode");
                let _ = inner.events.send(ClientEvent::LameDuckMode);
            }
            *inner
                .server_info
                .write()
                .unwrap_or_else(PoisonError::into_inner) = server_info;
            let ready = inner
                .info_ready
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(ready) = ready {
                let _ = ready.send(());
            }
        }
        ServerOp::Ping => {
            inner
                .out_tx
                .send(ClientOp::Pong)
                .await
                .map_err(|_| Error::ConnectionClosed)?;
        }
        ServerOp::Pong => {
            let waiter = inner
                .pong_waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            if let Some(waiter) = waiter {
                let _ = waiter.send(());
            }
        }
        ServerOp::Ok => {}
        ServerOp::Err(reason) => {
            warn!(reason = %reason, "server reported an error");
            let _ = inner.events.send(ClientEvent::ServerError(reason));
        }
        ServerOp::Msg { sid, message } => {
            let ctx = DispatchCtx {
                sid,
                out_tx: &inner.out_tx,
                events: &inner.events,
            };
            if let Some(PostAction::Remove { sid, send_unsub }) =
                inner.registry.dispatch(sid, message, &ctx)
            {
                inner.registry.remove(sid);
                if send_unsub {
                    let _ = inner.out_tx.try_send(ClientOp::Unsub { sid, max: None });
                }
            }
        }
    }
    Ok(())
}

/// Wake every blocked caller and close every subscription.
fn teardown(inner: &Arc<ClientInner>) {
    let _ = inner.shutdown.send_replace(true);
    inner.registry.clear();
    inner
        .pong_waiters
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

pub(crate) async fn run_writer<W>(
    mut io: W,
    mut out_rx: mpsc::Receiver<ClientOp>,
    inner: Arc<ClientInner>,
) where
    W: AsyncWrite + Unpin,
{
    let mut shutdown = inner.shutdown.subscribe();
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            op = out_rx.recv() => {
                let Some(op) = op else { break };
                op.encode(&mut buf);
                // Coalesce whatever else is already queued into one write.
                while let Ok(more) = out_rx.try_recv() {
                    more.encode(&mut buf);
                }
                if let Err(e) = io.write_all(&buf).await {
                    warn!(error = %e, "write failed");
                    let _ = inner.events.send(ClientEvent::ConnectionError(e.to_string()));
                    break;
                }
                buf.clear();
                if io.flush().await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = inner.shutdown.send_replace(true);
    debug!("writer task stopped");
}
