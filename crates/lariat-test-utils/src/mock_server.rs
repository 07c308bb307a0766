// mock_server: A mock NATS server for testing clients.
//
// Binds to port 0 (random) and exposes the bound address; each test spins up
// its own isolated instance.  Core behavior: sends INFO on connect, answers
// PING, routes PUB to matching SUBs (wildcards and queue groups included),
// and emits a 503 status when a request finds no responder.  JetStream
// behavior: streams capture matching publishes, and pull requests against a
// registered consumer are served with batch/expires/no-wait/max-bytes/
// idle-heartbeat semantics, ack tracking, and ack-wait redelivery.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use lariat_proto::headers::status_text;
use lariat_proto::jetstream::{AckKind, AckMetadata, PullRequest};
use lariat_proto::subject::subject_matches;
use lariat_proto::{ClientDecoder, ClientOp, HeaderMap, Message, ServerInfo, ServerOp, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const SWEEP_INTERVAL: Duration = Duration::from_millis(5);
const DEFAULT_PULL_EXPIRES: Duration = Duration::from_secs(30);

/// Per-consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// How long a delivered, unacked message waits before redelivery.
    pub ack_wait: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            ack_wait: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

struct SubRec {
    conn: u64,
    sid: u64,
    subject: String,
    queue: Option<String>,
    delivered: u64,
    remaining: Option<u64>,
    out: mpsc::Sender<Bytes>,
}

#[derive(Debug, Default)]
struct MsgState {
    delivered: u64,
    acked: bool,
    termed: bool,
    redeliver_at: Option<Instant>,
}

struct ConsumerState {
    ack_wait: Duration,
    next_consumer_seq: u64,
    pulls: u64,
    states: HashMap<u64, MsgState>,
}

struct StoredMessage {
    seq: u64,
    subject: String,
    headers: Option<HeaderMap>,
    payload: Bytes,
}

struct StreamState {
    subjects: Vec<String>,
    next_seq: u64,
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
}

struct State {
    subs: Mutex<Vec<SubRec>>,
    streams: Mutex<HashMap<String, StreamState>>,
    frozen: AtomicBool,
    next_conn: AtomicU64,
}

// ---------------------------------------------------------------------------
// MockServer
// ---------------------------------------------------------------------------

/// The mock server handle; the listener dies with it.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<State>,
    _accept: tokio::task::JoinHandle<()>,
}

impl MockServer {
    /// Start on a random port.
    pub async fn start() -> std::io::Result<MockServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(State {
            subs: Mutex::new(Vec::new()),
            streams: Mutex::new(HashMap::new()),
            frozen: AtomicBool::new(false),
            next_conn: AtomicU64::new(1),
        });

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let conn = accept_state.next_conn.fetch_add(1, Ordering::Relaxed);
                        let state = accept_state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(state, stream, conn).await {
                                // Client drops are routine in tests.
                                trace!(conn, error = %e, "connection ended");
                            }
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockServer {
            addr,
            state,
            _accept: accept,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open a plain TCP connection to the server.
    pub async fn connect(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect(self.addr).await
    }

    /// Register a stream capturing publishes on `subjects`.
    pub async fn add_stream(&self, name: &str, subjects: &[&str]) {
        self.state.streams.lock().await.insert(
            name.to_owned(),
            StreamState {
                subjects: subjects.iter().map(|s| (*s).to_owned()).collect(),
                next_seq: 1,
                messages: Vec::new(),
                consumers: HashMap::new(),
            },
        );
    }

    /// Register a pull consumer on `stream`.
    pub async fn add_consumer(&self, stream: &str, name: &str, config: ConsumerConfig) {
        if let Some(stream_state) = self.state.streams.lock().await.get_mut(stream) {
            stream_state.consumers.insert(
                name.to_owned(),
                ConsumerState {
                    ack_wait: config.ack_wait,
                    next_consumer_seq: 1,
                    pulls: 0,
                    states: HashMap::new(),
                },
            );
        }
    }

    /// Freeze JetStream: pending pulls stop sending messages, heartbeats,
    /// and terminal statuses, as a dead server would.
    pub fn freeze_jetstream(&self, frozen: bool) {
        self.state.frozen.store(frozen, Ordering::SeqCst);
    }

    /// How many pull requests have been issued against the consumer.
    pub async fn pull_requests(&self, stream: &str, consumer: &str) -> u64 {
        let streams = self.state.streams.lock().await;
        streams
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .map_or(0, |c| c.pulls)
    }

    /// Messages captured by the stream so far.
    pub async fn stream_messages(&self, stream: &str) -> usize {
        let streams = self.state.streams.lock().await;
        streams.get(stream).map_or(0, |s| s.messages.len())
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn handle_connection(
    state: Arc<State>,
    stream: TcpStream,
    conn: u64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(1024);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let info = ServerOp::Info(ServerInfo {
        server_id: uuid::Uuid::new_v4().to_string(),
        server_name: "mock".to_owned(),
        version: "0.0.0-mock".to_owned(),
        headers: true,
        ..ServerInfo::default()
    });
    out_tx.send(encode(&info)?).await?;

    let mut decoder = ClientDecoder::new();
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        let read = read_half.read_buf(&mut buf).await?;
        if read == 0 {
            break;
        }
        while let Some(op) = decoder.decode(&mut buf)? {
            handle_client_op(&state, conn, &out_tx, op).await?;
        }
    }

    state.subs.lock().await.retain(|s| s.conn != conn);
    Ok(())
}

async fn handle_client_op(
    state: &Arc<State>,
    conn: u64,
    out_tx: &mpsc::Sender<Bytes>,
    op: ClientOp,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match op {
        ClientOp::Ping => {
            out_tx.send(encode(&ServerOp::Pong)?).await?;
        }
        ClientOp::Pong => {}
        ClientOp::Sub {
            sid,
            subject,
            queue,
        } => {
            debug!(conn, sid, subject = %subject, "SUB");
            state.subs.lock().await.push(SubRec {
                conn,
                sid,
                subject,
                queue,
                delivered: 0,
                remaining: None,
                out: out_tx.clone(),
            });
        }
        ClientOp::Unsub { sid, max } => {
            let mut subs = state.subs.lock().await;
            match max {
                None => subs.retain(|s| !(s.conn == conn && s.sid == sid)),
                Some(max) => {
                    let mut drop_now = false;
                    if let Some(rec) = subs.iter_mut().find(|s| s.conn == conn && s.sid == sid) {
                        if rec.delivered >= max {
                            drop_now = true;
                        } else {
                            rec.remaining = Some(max - rec.delivered);
                        }
                    }
                    if drop_now {
                        subs.retain(|s| !(s.conn == conn && s.sid == sid));
                    }
                }
            }
        }
        ClientOp::Pub {
            subject,
            reply,
            headers,
            payload,
        } => {
            handle_publish(state, subject, reply, headers, payload).await;
        }
    }
    Ok(())
}

async fn handle_publish(
    state: &Arc<State>,
    subject: String,
    reply: Option<String>,
    headers: Option<HeaderMap>,
    payload: Bytes,
) {
    // Pull request?
    if let Some(rest) = subject.strip_prefix("$JS.API.CONSUMER.MSG.NEXT.") {
        let Some((stream, consumer)) = rest.split_once('.') else {
            return;
        };
        let Some(inbox) = reply else { return };
        let Ok(request) = serde_json::from_slice::<PullRequest>(&payload) else {
            send_status(state, &inbox, StatusCode::CONFLICT, status_text::BAD_REQUEST).await;
            return;
        };
        tokio::spawn(serve_pull(
            state.clone(),
            inbox,
            stream.to_owned(),
            consumer.to_owned(),
            request,
        ));
        return;
    }

    // Ack?
    if subject.starts_with("$JS.ACK.") {
        handle_ack(state, &subject, reply, &payload).await;
        return;
    }

    // Plain publish: fan out to core subscriptions and capture into streams.
    let message = Message::new(subject.clone(), reply.clone(), headers.clone(), payload.clone());
    let delivered = deliver(state, &subject, &message).await;
    if !delivered {
        if let Some(reply) = &reply {
            send_status(
                state,
                reply,
                StatusCode::NO_RESPONDERS,
                status_text::NO_RESPONDERS,
            )
            .await;
        }
    }

    let mut streams = state.streams.lock().await;
    for stream in streams.values_mut() {
        if stream
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, &subject))
        {
            let seq = stream.next_seq;
            stream.next_seq += 1;
            stream.messages.push(StoredMessage {
                seq,
                subject: subject.clone(),
                headers: headers.clone(),
                payload: payload.clone(),
            });
        }
    }
}

/// Deliver `message` to every subscription matching `route_subject`.
/// Queue groups get one member each.  Returns whether anyone got it.
async fn deliver(state: &Arc<State>, route_subject: &str, message: &Message) -> bool {
    let mut sends: Vec<(mpsc::Sender<Bytes>, Bytes)> = Vec::new();
    {
        let mut subs = state.subs.lock().await;
        let mut queues_taken: Vec<String> = Vec::new();
        let mut exhausted: Vec<(u64, u64)> = Vec::new();
        for rec in subs.iter_mut() {
            if !subject_matches(&rec.subject, route_subject) {
                continue;
            }
            if let Some(queue) = &rec.queue {
                if queues_taken.contains(queue) {
                    continue;
                }
                queues_taken.push(queue.clone());
            }
            let op = ServerOp::Msg {
                sid: rec.sid,
                message: message.clone(),
            };
            let Ok(frame) = encode(&op) else { continue };
            rec.delivered += 1;
            if let Some(remaining) = &mut rec.remaining {
                *remaining -= 1;
                if *remaining == 0 {
                    exhausted.push((rec.conn, rec.sid));
                }
            }
            sends.push((rec.out.clone(), frame));
        }
        subs.retain(|s| !exhausted.contains(&(s.conn, s.sid)));
    }
    let any = !sends.is_empty();
    for (tx, frame) in sends {
        let _ = tx.send(frame).await;
    }
    any
}

async fn send_status(state: &Arc<State>, inbox: &str, code: StatusCode, text: &str) {
    let message = Message::new(
        inbox.to_owned(),
        None,
        Some(HeaderMap::for_status(code, text)),
        Bytes::new(),
    );
    deliver(state, inbox, &message).await;
}

// ---------------------------------------------------------------------------
// JetStream: acks
// ---------------------------------------------------------------------------

async fn handle_ack(state: &Arc<State>, ack_subject: &str, reply: Option<String>, payload: &Bytes) {
    if state.frozen.load(Ordering::SeqCst) {
        // Dead server: the ack is lost and no confirmation comes back.
        return;
    }
    let Ok(metadata) = AckMetadata::parse(ack_subject) else {
        warn!(subject = %ack_subject, "unparseable ack subject");
        return;
    };
    let Some(kind) = AckKind::parse(payload) else {
        warn!("unparseable ack payload");
        return;
    };

    let mut next_pull: Option<PullRequest> = None;
    {
        let mut streams = state.streams.lock().await;
        let Some(stream) = streams.get_mut(&metadata.stream) else {
            return;
        };
        let Some(consumer) = stream.consumers.get_mut(&metadata.consumer) else {
            return;
        };
        let ack_wait = consumer.ack_wait;
        let msg_state = consumer.states.entry(metadata.stream_sequence).or_default();
        match kind {
            AckKind::Ack => msg_state.acked = true,
            AckKind::Term => msg_state.termed = true,
            AckKind::Nak => msg_state.redeliver_at = Some(Instant::now()),
            AckKind::NakWithDelay(delay) => {
                msg_state.redeliver_at = Some(Instant::now() + delay);
            }
            AckKind::InProgress => {
                msg_state.redeliver_at = Some(Instant::now() + ack_wait);
            }
            AckKind::AckNext(request) => {
                msg_state.acked = true;
                next_pull = Some(request);
            }
        }
    }

    match (next_pull, reply) {
        (Some(request), Some(inbox)) => {
            tokio::spawn(serve_pull(
                state.clone(),
                inbox,
                metadata.stream,
                metadata.consumer,
                request,
            ));
        }
        (None, Some(reply)) => {
            // Sync-ack confirmation: an empty message back to the requester.
            let confirmation = Message::new(reply.clone(), None, None, Bytes::new());
            deliver(state, &reply, &confirmation).await;
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// JetStream: pull serving
// ---------------------------------------------------------------------------

async fn serve_pull(
    state: Arc<State>,
    inbox: String,
    stream_name: String,
    consumer_name: String,
    request: PullRequest,
) {
    {
        let mut streams = state.streams.lock().await;
        let Some(consumer) = streams
            .get_mut(&stream_name)
            .and_then(|s| s.consumers.get_mut(&consumer_name))
        else {
            send_status(
                &state,
                &inbox,
                StatusCode::CONFLICT,
                status_text::CONSUMER_DELETED,
            )
            .await;
            return;
        };
        consumer.pulls += 1;
    }

    if request.no_wait && request.idle_heartbeat.is_some() {
        send_status(&state, &inbox, StatusCode::CONFLICT, status_text::BAD_REQUEST).await;
        return;
    }

    let deadline = Instant::now() + request.expires.unwrap_or(DEFAULT_PULL_EXPIRES);
    let mut remaining = request.batch;
    let mut bytes_left = request.max_bytes;
    let mut last_send = Instant::now();
    let mut swept_once = false;

    debug!(stream = %stream_name, consumer = %consumer_name, batch = request.batch, "serving pull");
    loop {
        if state.frozen.load(Ordering::SeqCst) {
            // Dead server: no data, no heartbeats, no terminal status.
            tokio::time::sleep(SWEEP_INTERVAL).await;
            continue;
        }

        let (delivered, over_bytes) = sweep_and_deliver(
            &state,
            &inbox,
            &stream_name,
            &consumer_name,
            remaining,
            request.max_bytes > 0,
            &mut bytes_left,
        )
        .await;
        if delivered > 0 {
            remaining -= delivered;
            last_send = Instant::now();
        }
        if over_bytes {
            send_status(
                &state,
                &inbox,
                StatusCode::CONFLICT,
                status_text::MESSAGE_SIZE_EXCEEDS_MAX_BYTES,
            )
            .await;
            return;
        }
        if remaining == 0 {
            return;
        }
        if request.no_wait && swept_once {
            send_status(&state, &inbox, StatusCode::NO_MESSAGES, status_text::NO_MESSAGES).await;
            return;
        }
        swept_once = true;
        if Instant::now() >= deadline {
            send_status(
                &state,
                &inbox,
                StatusCode::REQUEST_TIMEOUT,
                status_text::REQUEST_TIMEOUT,
            )
            .await;
            return;
        }
        if let Some(heartbeat) = request.idle_heartbeat {
            if last_send.elapsed() >= heartbeat {
                send_status(
                    &state,
                    &inbox,
                    StatusCode::FLOW_CONTROL_OR_HEARTBEAT,
                    status_text::IDLE_HEARTBEAT,
                )
                .await;
                last_send = Instant::now();
            }
        }
        tokio::time::sleep(SWEEP_INTERVAL).await;
    }
}

/// One sweep: pick deliverable messages, mark them delivered, and send them
/// while still holding the streams lock, so concurrent pulls for the same
/// consumer cannot interleave deliveries out of order.
/// Returns the delivered count plus whether the byte budget was crossed.
async fn sweep_and_deliver(
    state: &Arc<State>,
    inbox: &str,
    stream_name: &str,
    consumer_name: &str,
    want: usize,
    track_bytes: bool,
    bytes_left: &mut usize,
) -> (usize, bool) {
    let mut out = Vec::new();
    let mut over = false;

    let mut streams = state.streams.lock().await;
    let Some(stream) = streams.get_mut(stream_name) else {
        return (0, false);
    };
    let StreamState {
        messages,
        consumers,
        ..
    } = stream;
    let Some(consumer) = consumers.get_mut(consumer_name) else {
        return (0, false);
    };

    let now = Instant::now();
    for stored in messages.iter() {
        if out.len() == want {
            break;
        }
        let msg_state = consumer.states.entry(stored.seq).or_default();
        let ready = !msg_state.acked
            && !msg_state.termed
            && (msg_state.delivered == 0
                || msg_state.redeliver_at.is_some_and(|at| now >= at));
        if !ready {
            continue;
        }

        let pending = messages.iter().filter(|m| m.seq > stored.seq).count() as u64;
        let metadata = AckMetadata {
            domain: None,
            stream: stream_name.to_owned(),
            consumer: consumer_name.to_owned(),
            delivered: msg_state.delivered + 1,
            stream_sequence: stored.seq,
            consumer_sequence: consumer.next_consumer_seq,
            timestamp_nanos: unix_nanos(),
            pending,
        };
        let message = Message::new(
            stored.subject.clone(),
            Some(metadata.encode_reply()),
            stored.headers.clone(),
            stored.payload.clone(),
        );
        if track_bytes {
            if message.length > *bytes_left {
                over = true;
                break;
            }
            *bytes_left -= message.length;
        }
        consumer.next_consumer_seq += 1;
        msg_state.delivered += 1;
        msg_state.redeliver_at = Some(now + consumer.ack_wait);
        out.push(message);
    }

    let delivered = out.len();
    for message in out {
        deliver(state, inbox, &message).await;
    }
    (delivered, over)
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

fn encode(op: &ServerOp) -> Result<Bytes, serde_json::Error> {
    let mut buf = BytesMut::new();
    op.encode(&mut buf)?;
    Ok(buf.freeze())
}
