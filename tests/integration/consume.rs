// The long-running consume loop: threshold repulling, ordering, stop/drain
// lifecycle, and the stream adapter.

use std::time::Duration;

use futures_util::StreamExt;
use lariat::jetstream::{ConsumeOptions, Consumer};
use lariat::{Client, ClientOptions};
use lariat_test_utils::{ConsumerConfig, MockServer};
use tokio::time::Instant;

const STREAM: &str = "FEED";
const CONSUMER: &str = "tail";

async fn setup() -> (MockServer, Client, Consumer) {
    lariat_test_utils::init_tracing();
    let server = MockServer::start().await.expect("mock server");
    server.add_stream(STREAM, &["feed.>"]).await;
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
    let consumer = client.jetstream().consumer(STREAM, CONSUMER).unwrap();
    (server, client, consumer)
}

async fn publish_feed(client: &Client, count: usize) {
    for i in 1..=count {
        client.publish("feed.tick", format!("T{i}")).await.unwrap();
    }
    client.flush(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn consume_delivers_everything_in_order_with_repulls() {
    let (server, client, consumer) = setup().await;
    publish_feed(&client, 500).await;

    let mut messages = consumer
        .messages(ConsumeOptions {
            batch: 100,
            expires: Duration::from_secs(5),
            threshold_percent: 25,
            ..ConsumeOptions::default()
        })
        .await
        .unwrap();

    for i in 1..=500_u64 {
        let message = tokio::time::timeout(Duration::from_secs(5), messages.next())
            .await
            .expect("no stall")
            .expect("stream open")
            .expect("no error");
        assert_eq!(message.payload, format!("T{i}"), "stream order preserved");
        assert_eq!(message.metadata().stream_sequence, i);
        message.ack().await.unwrap();
    }

    // 500 messages over a batch of 100 with a 25% threshold cannot be a
    // single pull.
    let pulls = server.pull_requests(STREAM, CONSUMER).await;
    assert!(pulls >= 4, "expected threshold repulls, saw {pulls}");

    messages.stop();
    let finished = tokio::time::timeout(Duration::from_secs(7), async {
        while messages.next().await.is_some() {}
    })
    .await;
    assert!(finished.is_ok(), "stop() drains within expires + grace");
}

#[tokio::test]
async fn consume_tops_up_before_the_pull_drains() {
    let (server, client, consumer) = setup().await;
    publish_feed(&client, 30).await;

    let mut messages = consumer
        .messages(ConsumeOptions {
            batch: 10,
            expires: Duration::from_secs(2),
            threshold_percent: 25,
            ..ConsumeOptions::default()
        })
        .await
        .unwrap();

    for _ in 0..30 {
        let message = tokio::time::timeout(Duration::from_secs(3), messages.next())
            .await
            .expect("no stall")
            .unwrap()
            .unwrap();
        message.ack().await.unwrap();
    }

    let pulls = server.pull_requests(STREAM, CONSUMER).await;
    assert!(
        pulls >= 4,
        "the pipeline should be topped up repeatedly, saw {pulls} pulls"
    );
}

#[tokio::test]
async fn consume_tops_up_when_the_byte_budget_runs_low() {
    let (server, client, consumer) = setup().await;
    // Roughly 160 wire bytes per message (subject + ack reply + payload).
    for i in 1..=20 {
        client
            .publish("feed.tick", format!("B{i:02}{}", "x".repeat(100)))
            .await
            .unwrap();
    }
    client.flush(Duration::from_secs(2)).await.unwrap();

    // The message threshold (37 of 50) is never the early trigger here; only
    // the byte budget (threshold 900 of 1200, a couple of messages in) is.
    let mut messages = consumer
        .messages(ConsumeOptions {
            batch: 50,
            batch_bytes: 1200,
            expires: Duration::from_secs(2),
            threshold_percent: 25,
            ..ConsumeOptions::default()
        })
        .await
        .unwrap();

    for i in 1..=20 {
        let message = tokio::time::timeout(Duration::from_secs(3), messages.next())
            .await
            .expect("no stall on byte-budget boundaries")
            .unwrap()
            .unwrap();
        assert_eq!(
            message.payload,
            format!("B{i:02}{}", "x".repeat(100)),
            "stream order preserved across byte-budget repulls"
        );
        message.ack().await.unwrap();
    }

    let pulls = server.pull_requests(STREAM, CONSUMER).await;
    assert!(
        pulls >= 3,
        "byte budget should trigger proactive repulls, saw {pulls}"
    );

    messages.stop();
    let finished = tokio::time::timeout(Duration::from_secs(4), async {
        while messages.next().await.is_some() {}
    })
    .await;
    assert!(finished.is_ok());
}

#[tokio::test]
async fn stop_drains_current_pull_then_ends() {
    let (_server, client, consumer) = setup().await;
    publish_feed(&client, 10).await;

    let mut messages = consumer
        .messages(ConsumeOptions {
            batch: 5,
            expires: Duration::from_secs(2),
            ..ConsumeOptions::default()
        })
        .await
        .unwrap();

    // Take a couple, then stop.
    for _ in 0..2 {
        let message = messages.next().await.unwrap().unwrap();
        message.ack().await.unwrap();
    }
    messages.stop();

    let started = Instant::now();
    let mut drained = 0;
    while let Some(item) = messages.next().await {
        drained += 1;
        item.unwrap().ack().await.unwrap();
    }
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "draining is bounded by the pull expiry"
    );
    assert!(drained <= 3, "only the outstanding pull is drained");
    assert!(messages.next().await.is_none(), "finished stays finished");
}

#[tokio::test]
async fn stop_handle_releases_an_idle_consume() {
    let (_server, _client, consumer) = setup().await;

    let mut messages = consumer
        .messages(ConsumeOptions {
            batch: 5,
            expires: Duration::from_secs(2),
            ..ConsumeOptions::default()
        })
        .await
        .unwrap();
    let stop = messages.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.stop();
    });

    let started = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(4), messages.next()).await;
    assert!(outcome.expect("stop released the loop").is_none());
    assert!(
        started.elapsed() < Duration::from_millis(3500),
        "stopping completes within expires + grace"
    );
}

#[tokio::test]
async fn consume_works_as_a_stream() {
    let (_server, client, consumer) = setup().await;
    publish_feed(&client, 5).await;

    let messages = consumer
        .messages(ConsumeOptions {
            batch: 5,
            expires: Duration::from_secs(2),
            ..ConsumeOptions::default()
        })
        .await
        .unwrap();
    let stop = messages.stop_handle();
    let stream = messages.into_stream();
    tokio::pin!(stream);

    let mut payloads = Vec::new();
    for _ in 0..5 {
        let message = stream.next().await.unwrap().unwrap();
        payloads.push(String::from_utf8_lossy(&message.payload).into_owned());
        message.ack().await.unwrap();
    }
    assert_eq!(payloads, vec!["T1", "T2", "T3", "T4", "T5"]);
    stop.stop();
}

#[tokio::test]
async fn consume_options_are_validated() {
    let (_server, _client, consumer) = setup().await;
    assert!(matches!(
        consumer
            .messages(ConsumeOptions {
                threshold_percent: 0,
                ..ConsumeOptions::default()
            })
            .await,
        Err(lariat::Error::Validation(_))
    ));
    assert!(matches!(
        consumer
            .messages(ConsumeOptions {
                expires: Duration::from_millis(100),
                ..ConsumeOptions::default()
            })
            .await,
        Err(lariat::Error::Validation(_))
    ));
}
