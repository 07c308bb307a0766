// Core pub/sub against the mock server: ordering, queue groups, pending
// limits, auto-unsubscribe, request/reply, flush, and drain.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lariat::{Client, ClientEvent, ClientOptions, HeaderMap, SubscribeOptions};
use lariat_test_utils::MockServer;

async fn setup() -> (MockServer, Client) {
    lariat_test_utils::init_tracing();
    let server = MockServer::start().await.expect("mock server");
    let socket = server.connect().await.expect("connect");
    let client = Client::connect(socket, ClientOptions::default())
        .await
        .expect("handshake");
    (server, client)
}

#[tokio::test]
async fn publish_subscribe_preserves_order() {
    let (_server, client) = setup().await;
    let mut sub = client.subscribe("orders.*").await.unwrap();

    for i in 1..=5 {
        client
            .publish("orders.created", format!("payload-{i}"))
            .await
            .unwrap();
    }

    for i in 1..=5 {
        let message = sub.recv().await.unwrap().expect("message");
        assert_eq!(message.subject, "orders.created");
        assert_eq!(message.payload, format!("payload-{i}"));
    }
}

#[tokio::test]
async fn wildcard_subscription_matches_tail() {
    let (_server, client) = setup().await;
    let mut sub = client.subscribe("metrics.>").await.unwrap();

    client.publish("metrics.cpu.core0", "42").await.unwrap();
    client.publish("other.topic", "ignored").await.unwrap();
    client.publish("metrics.mem", "17").await.unwrap();

    let first = sub.recv().await.unwrap().unwrap();
    assert_eq!(first.subject, "metrics.cpu.core0");
    let second = sub.recv().await.unwrap().unwrap();
    assert_eq!(second.subject, "metrics.mem");
}

#[tokio::test]
async fn queue_group_delivers_to_one_member() {
    let (_server, client) = setup().await;
    let mut first = client
        .subscribe_with(
            "work.items",
            SubscribeOptions {
                queue: Some("workers".to_owned()),
                ..SubscribeOptions::default()
            },
        )
        .await
        .unwrap();
    let mut second = client
        .subscribe_with(
            "work.items",
            SubscribeOptions {
                queue: Some("workers".to_owned()),
                ..SubscribeOptions::default()
            },
        )
        .await
        .unwrap();

    for _ in 0..4 {
        client.publish("work.items", "job").await.unwrap();
    }
    client.flush(Duration::from_secs(1)).await.unwrap();

    let mut delivered = 0;
    while first
        .next_timeout(Duration::from_millis(100))
        .await
        .is_ok_and(|m| m.is_some())
    {
        delivered += 1;
    }
    while second
        .next_timeout(Duration::from_millis(100))
        .await
        .is_ok_and(|m| m.is_some())
    {
        delivered += 1;
    }
    assert_eq!(delivered, 4, "each job goes to exactly one group member");
}

#[tokio::test]
async fn headers_survive_the_round_trip() {
    let (_server, client) = setup().await;
    let mut sub = client.subscribe("evt.with.headers").await.unwrap();

    let mut headers = HeaderMap::new();
    headers.insert("Trace-Id", "abc-123");
    headers.append("Tag", "a");
    headers.append("Tag", "b");
    client
        .publish_with_headers("evt.with.headers", headers, "body")
        .await
        .unwrap();

    let message = sub.recv().await.unwrap().unwrap();
    let headers = message.headers.as_ref().expect("headers");
    assert_eq!(headers.get("Trace-Id"), Some("abc-123"));
    assert_eq!(headers.get_all("Tag"), &["a".to_owned(), "b".to_owned()]);
    assert_eq!(message.payload, "body");
}

#[tokio::test]
async fn auto_unsubscribe_stops_after_threshold() {
    let (_server, client) = setup().await;
    let mut sub = client.subscribe("capped").await.unwrap();
    sub.unsubscribe_after(2).await.unwrap();

    for i in 0..5 {
        client.publish("capped", format!("m{i}")).await.unwrap();
    }

    assert_eq!(sub.recv().await.unwrap().unwrap().payload, "m0");
    assert_eq!(sub.recv().await.unwrap().unwrap().payload, "m1");
    assert!(sub.recv().await.unwrap().is_none(), "subscription ended");
}

#[tokio::test]
async fn slow_consumer_drops_and_fires_one_event() {
    let (_server, client) = setup().await;
    let mut events = client.events();
    let mut sub = client
        .subscribe_with(
            "firehose",
            SubscribeOptions {
                max_pending_messages: Some(1),
                ..SubscribeOptions::default()
            },
        )
        .await
        .unwrap();

    for i in 0..4 {
        client.publish("firehose", format!("m{i}")).await.unwrap();
    }
    client.flush(Duration::from_secs(1)).await.unwrap();

    // Only the first message fit.
    let message = sub.recv().await.unwrap().unwrap();
    assert_eq!(message.payload, "m0");
    assert!(matches!(
        sub.next_timeout(Duration::from_millis(100)).await,
        Err(lariat::Error::Timeout)
    ));

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event in time")
        .unwrap();
    assert!(matches!(event, ClientEvent::SlowConsumer { .. }));
    // One crossing, one event.
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn request_reply_round_trip() {
    let (_server, client) = setup().await;
    let responder = client.clone();
    let mut service = client.subscribe("svc.echo").await.unwrap();
    tokio::spawn(async move {
        while let Ok(Some(message)) = service.recv().await {
            if let Some(reply) = &message.reply {
                let mut echoed = b"echo:".to_vec();
                echoed.extend_from_slice(&message.payload);
                responder.publish(reply.clone(), echoed).await.unwrap();
            }
        }
    });

    let response = client
        .request("svc.echo", "ping", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.payload, "echo:ping");
}

#[tokio::test]
async fn request_without_responders_fails_fast() {
    let (_server, client) = setup().await;
    let result = client
        .request("nobody.home", "hello", Duration::from_secs(2))
        .await;
    assert!(matches!(result, Err(lariat::Error::NoResponders)));
}

#[tokio::test]
async fn flush_round_trips_a_ping() {
    let (_server, client) = setup().await;
    client.flush(Duration::from_secs(1)).await.unwrap();
    client.flush(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn drain_empties_the_pending_queue_then_ends() {
    let (_server, client) = setup().await;
    let mut sub = client.subscribe("drainme").await.unwrap();

    for i in 0..3 {
        client.publish("drainme", format!("m{i}")).await.unwrap();
    }
    client.flush(Duration::from_secs(1)).await.unwrap();

    // Messages received before the drain are unaffected.
    let first = sub.recv().await.unwrap().unwrap();
    assert_eq!(first.payload, "m0");

    // The drain consumes the rest of the queue within the deadline, and the
    // subscription is finished afterwards.
    sub.drain(Duration::from_secs(1)).await.unwrap();
    assert!(sub.recv().await.unwrap().is_none());

    // Draining an already-finished subscription is a no-op.
    sub.drain(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn handler_subscription_invokes_serially_and_drains() {
    let (_server, client) = setup().await;
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = client
        .subscribe_with_handler("handled", SubscribeOptions::default(), move |message| {
            sink.lock()
                .unwrap()
                .push(String::from_utf8_lossy(&message.payload).into_owned());
        })
        .await
        .unwrap();

    for i in 0..5 {
        client.publish("handled", format!("h{i}")).await.unwrap();
    }
    client.flush(Duration::from_secs(1)).await.unwrap();

    handler.drain(Duration::from_secs(2)).await.unwrap();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &["h0", "h1", "h2", "h3", "h4"]);
}

#[tokio::test]
async fn validation_errors_never_touch_the_wire() {
    let (_server, client) = setup().await;
    assert!(matches!(
        client.publish("bad subject", "x").await,
        Err(lariat::Error::Validation(_))
    ));
    assert!(matches!(
        client.publish("orders.*", "x").await,
        Err(lariat::Error::Validation(_))
    ));
    assert!(matches!(
        client.subscribe("").await,
        Err(lariat::Error::Validation(_))
    ));
}
