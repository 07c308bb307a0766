// Idle-heartbeat liveness: alarms on a dead server, heartbeats keeping slow
// pulls alive, and the push-mode status filter (flow control + heartbeats).

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use lariat::jetstream::ConsumeOptions;
use lariat::{Client, ClientEvent, ClientOptions};
use lariat_proto::{ClientOp, HeaderMap, StatusCode};
use lariat_test_utils::{ConsumerConfig, MockServer};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

const STREAM: &str = "LIVE";
const CONSUMER: &str = "watcher";

async fn setup() -> (MockServer, Client) {
    lariat_test_utils::init_tracing();
    let server = MockServer::start().await.expect("mock server");
    server.add_stream(STREAM, &["live.>"]).await;
    server
        .add_consumer(
            STREAM,
            CONSUMER,
            ConsumerConfig {
                ack_wait: Duration::from_secs(30),
            },
        )
        .await;
    let socket = server.connect().await.expect("connect");
    let client = Client::connect(socket, ClientOptions::default())
        .await
        .expect("handshake");
    (server, client)
}

#[tokio::test]
async fn heartbeat_loss_finishes_the_consume() {
    let (server, client) = setup().await;
    let consumer = client.jetstream().consumer(STREAM, CONSUMER).unwrap();
    let mut events = client.events();

    client.publish("live.a", "first").await.unwrap();
    client.flush(Duration::from_secs(1)).await.unwrap();

    let mut messages = consumer
        .messages(ConsumeOptions {
            batch: 5,
            expires: Duration::from_secs(2),
            idle_heartbeat: Some(Duration::from_millis(500)),
            ..ConsumeOptions::default()
        })
        .await
        .unwrap();

    let first = messages.next().await.unwrap().unwrap();
    assert_eq!(first.payload, "first");
    first.ack().await.unwrap();

    // The server goes silent: no data, no heartbeats, no statuses.
    server.freeze_jetstream(true);

    let started = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(4), messages.next())
        .await
        .expect("alarm fires in time");
    assert!(matches!(
        outcome,
        Some(Err(lariat::Error::HeartbeatsMissed))
    ));
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1200) && elapsed <= Duration::from_millis(2500),
        "alarm after about three missed heartbeats, took {elapsed:?}"
    );

    // Finished: the consume is over.
    assert!(messages.next().await.is_none());

    // And the condition was reported out-of-band too.
    let event = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::HeartbeatsMissed { .. }) => break,
                Ok(_) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await;
    assert!(event.is_ok(), "heartbeat alarm event emitted");
}

#[tokio::test]
async fn heartbeats_keep_an_idle_pull_alive() {
    let (_server, client) = setup().await;
    let consumer = client.jetstream().consumer(STREAM, CONSUMER).unwrap();

    let mut messages = consumer
        .messages(ConsumeOptions {
            batch: 5,
            expires: Duration::from_secs(3),
            idle_heartbeat: Some(Duration::from_millis(200)),
            ..ConsumeOptions::default()
        })
        .await
        .unwrap();

    // Publish only after well over three heartbeat periods of idleness.
    let publisher = client.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1200)).await;
        publisher.publish("live.later", "late").await.unwrap();
    });

    let message = tokio::time::timeout(Duration::from_secs(3), messages.next())
        .await
        .expect("no alarm while heartbeats flow")
        .unwrap()
        .unwrap();
    assert_eq!(message.payload, "late");
    message.ack().await.unwrap();
}

/// A second raw connection that writes protocol frames directly, standing in
/// for a server pushing status messages at a push consumer.
async fn raw_publisher(server: &MockServer) -> tokio::net::TcpStream {
    server.connect().await.expect("raw connection")
}

async fn raw_publish(
    conn: &mut tokio::net::TcpStream,
    subject: &str,
    reply: Option<&str>,
    headers: Option<HeaderMap>,
    payload: &[u8],
) {
    let op = ClientOp::Pub {
        subject: subject.to_owned(),
        reply: reply.map(str::to_owned),
        headers,
        payload: Bytes::copy_from_slice(payload),
    };
    let mut buf = BytesMut::new();
    op.encode(&mut buf);
    conn.write_all(&buf).await.expect("raw write");
}

#[tokio::test]
async fn flow_control_is_answered_once_per_reply_subject() {
    let (server, client) = setup().await;
    let mut fc_replies = client.subscribe("fc.window.1").await.unwrap();
    let mut push_sub = client
        .jetstream()
        .push_subscription("push.deliver")
        .await
        .unwrap();

    client.flush(Duration::from_secs(1)).await.unwrap();

    let mut raw = raw_publisher(&server).await;
    let fc = HeaderMap::for_status(StatusCode::FLOW_CONTROL_OR_HEARTBEAT, "FlowControl Request");
    raw_publish(&mut raw, "push.deliver", Some("fc.window.1"), Some(fc.clone()), b"").await;
    raw_publish(&mut raw, "push.deliver", Some("fc.window.1"), Some(fc), b"").await;

    // Exactly one empty reply, no matter how often the request repeats.
    let reply = fc_replies.recv().await.unwrap().expect("one fc reply");
    assert!(reply.payload.is_empty());
    assert!(matches!(
        fc_replies.next_timeout(Duration::from_millis(200)).await,
        Err(lariat::Error::Timeout)
    ));

    // The push subscriber itself never sees the status traffic.
    assert!(matches!(
        push_sub.next_timeout(Duration::from_millis(100)).await,
        Err(lariat::Error::Timeout)
    ));
}

#[tokio::test]
async fn idle_heartbeats_are_absorbed_by_the_push_filter() {
    let (server, client) = setup().await;
    let mut push_sub = client
        .jetstream()
        .push_subscription("push.hb")
        .await
        .unwrap();

    client.flush(Duration::from_secs(1)).await.unwrap();

    let mut raw = raw_publisher(&server).await;
    let hb = HeaderMap::for_status(StatusCode::FLOW_CONTROL_OR_HEARTBEAT, "Idle Heartbeat");
    raw_publish(&mut raw, "push.hb", None, Some(hb), b"").await;
    raw_publish(&mut raw, "push.hb", None, None, b"real data").await;

    // The heartbeat is filtered; the data message comes straight through.
    let message = push_sub.recv().await.unwrap().unwrap();
    assert_eq!(message.payload, "real data");
}

#[tokio::test]
async fn unknown_status_is_raised_from_next_in_sync_mode() {
    let (server, client) = setup().await;
    let mut push_sub = client
        .jetstream()
        .push_subscription("push.odd")
        .await
        .unwrap();

    client.flush(Duration::from_secs(1)).await.unwrap();

    let mut raw = raw_publisher(&server).await;
    let odd = HeaderMap::for_status(StatusCode(418), "I'm a teapot");
    raw_publish(&mut raw, "push.odd", None, Some(odd), b"").await;

    let result = push_sub.recv().await;
    let Err(lariat::Error::Status { code, description }) = result else {
        panic!("expected a status error");
    };
    assert_eq!(code, 418);
    assert_eq!(description, "I'm a teapot");

    // The subscription stays usable afterwards.
    raw_publish(&mut raw, "push.odd", None, None, b"still here").await;
    let message = push_sub.recv().await.unwrap().unwrap();
    assert_eq!(message.payload, "still here");
}
