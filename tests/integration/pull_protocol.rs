// The raw pull protocol: budgets, no-wait, expires, max-bytes, statuses,
// acks, and the ack-next composite.

use std::time::Duration;

use lariat::jetstream::{Consumer, EndReason, PullOutcome};
use lariat::{Client, ClientOptions, PullRequest};
use lariat_test_utils::{ConsumerConfig, MockServer};

const STREAM: &str = "EVENTS";
const CONSUMER: &str = "worker";

async fn setup(ack_wait: Duration) -> (MockServer, Client, Consumer) {
    lariat_test_utils::init_tracing();
    let server = MockServer::start().await.expect("mock server");
    server.add_stream(STREAM, &["events.>"]).await;
    server
        .add_consumer(STREAM, CONSUMER, ConsumerConfig { ack_wait })
        .await;
    let socket = server.connect().await.expect("connect");
    let client = Client::connect(socket, ClientOptions::default())
        .await
        .expect("handshake");
    let consumer = client.jetstream().consumer(STREAM, CONSUMER).unwrap();
    (server, client, consumer)
}

async fn publish_events(client: &Client, count: usize) {
    for i in 1..=count {
        client
            .publish("events.created", format!("E{i}"))
            .await
            .unwrap();
    }
    client.flush(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn pull_delivers_up_to_batch_then_expires() {
    let (_server, client, consumer) = setup(Duration::from_secs(30)).await;
    publish_events(&client, 3).await;

    let mut sub = consumer.pull_subscription().await.unwrap();
    sub.pull_expires(5, Duration::from_millis(700)).await.unwrap();

    for i in 1..=3 {
        let PullOutcome::Message(message) = sub.next().await else {
            panic!("expected message {i}");
        };
        assert_eq!(message.payload, format!("E{i}"));
        assert_eq!(message.metadata().stream_sequence, i as u64);
        message.ack().await.unwrap();
    }
    // Batch of 5 with only 3 available: the pull waits out its expiry.
    let PullOutcome::End(EndReason::Expired) = sub.next().await else {
        panic!("expected the pull to expire");
    };
    assert!(sub.is_drained());
}

#[tokio::test]
async fn pull_no_wait_delivers_available_then_404() {
    let (_server, client, consumer) = setup(Duration::from_secs(30)).await;
    publish_events(&client, 2).await;

    let mut sub = consumer.pull_subscription().await.unwrap();
    sub.pull_no_wait(10).await.unwrap();

    let mut payloads = Vec::new();
    loop {
        match sub.next().await {
            PullOutcome::Message(message) => {
                payloads.push(String::from_utf8_lossy(&message.payload).into_owned());
                message.ack().await.unwrap();
            }
            PullOutcome::End(EndReason::NoMessages) => break,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(payloads, vec!["E1", "E2"]);
}

#[tokio::test]
async fn no_wait_with_heartbeat_is_rejected_locally() {
    let (_server, _client, consumer) = setup(Duration::from_secs(30)).await;
    let mut sub = consumer.pull_subscription().await.unwrap();
    let result = sub
        .pull_with(PullRequest {
            batch: 5,
            no_wait: true,
            idle_heartbeat: Some(Duration::from_millis(200)),
            ..PullRequest::default()
        })
        .await;
    assert!(matches!(result, Err(lariat::Error::Validation(_))));
}

#[tokio::test]
async fn heartbeat_above_half_expires_is_rejected_locally() {
    let (_server, _client, consumer) = setup(Duration::from_secs(30)).await;
    let mut sub = consumer.pull_subscription().await.unwrap();
    let result = sub
        .pull_with(PullRequest {
            batch: 5,
            expires: Some(Duration::from_secs(2)),
            idle_heartbeat: Some(Duration::from_millis(1500)),
            ..PullRequest::default()
        })
        .await;
    assert!(matches!(result, Err(lariat::Error::Validation(_))));
}

#[tokio::test]
async fn max_bytes_ends_pull_before_crossing() {
    let (_server, client, consumer) = setup(Duration::from_secs(30)).await;
    client.publish("events.small", "x".repeat(40)).await.unwrap();
    client.publish("events.small", "y".repeat(40)).await.unwrap();
    client.publish("events.large", "z".repeat(600)).await.unwrap();
    client.flush(Duration::from_secs(1)).await.unwrap();

    let mut sub = consumer.pull_subscription().await.unwrap();
    sub.pull_with(PullRequest {
        batch: 10,
        max_bytes: 250,
        expires: Some(Duration::from_secs(1)),
        ..PullRequest::default()
    })
    .await
    .unwrap();

    let mut delivered = 0;
    loop {
        match sub.next().await {
            PullOutcome::Message(message) => {
                delivered += 1;
                message.ack().await.unwrap();
            }
            PullOutcome::End(EndReason::MaxBytes) => break,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(delivered, 2, "the third message would cross the byte budget");
    // The subscription is idle again; a new pull is allowed.
    assert!(sub.is_drained());
    sub.pull_no_wait(5).await.unwrap();
}

#[tokio::test]
async fn overlapping_pulls_accumulate_budgets() {
    let (_server, client, consumer) = setup(Duration::from_secs(30)).await;
    publish_events(&client, 4).await;

    let mut sub = consumer.pull_subscription().await.unwrap();
    sub.pull_expires(2, Duration::from_secs(2)).await.unwrap();
    sub.pull_expires(2, Duration::from_secs(2)).await.unwrap();
    assert_eq!(sub.pending_messages(), 4);

    for i in 1..=4 {
        let PullOutcome::Message(message) = sub.next().await else {
            panic!("expected message {i}");
        };
        assert_eq!(message.payload, format!("E{i}"));
        message.ack().await.unwrap();
    }
    assert!(sub.is_drained());
}

#[tokio::test]
async fn unacked_messages_are_redelivered_after_ack_wait() {
    let (_server, client, consumer) = setup(Duration::from_millis(300)).await;
    publish_events(&client, 2).await;

    let mut sub = consumer.pull_subscription().await.unwrap();
    sub.pull_expires(2, Duration::from_secs(1)).await.unwrap();
    for i in 1..=2 {
        let PullOutcome::Message(message) = sub.next().await else {
            panic!("expected first delivery {i}");
        };
        assert_eq!(message.metadata().delivered, 1);
        // Deliberately not acked.
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    sub.pull_expires(2, Duration::from_secs(1)).await.unwrap();
    for i in 1..=2 {
        let PullOutcome::Message(message) = sub.next().await else {
            panic!("expected redelivery {i}");
        };
        assert_eq!(message.payload, format!("E{i}"), "same order on redelivery");
        assert_eq!(message.metadata().delivered, 2);
        message.ack().await.unwrap();
    }
}

#[tokio::test]
async fn acked_messages_are_not_redelivered() {
    let (_server, client, consumer) = setup(Duration::from_millis(200)).await;
    publish_events(&client, 2).await;

    let mut sub = consumer.pull_subscription().await.unwrap();
    sub.pull_expires(2, Duration::from_secs(1)).await.unwrap();
    for _ in 0..2 {
        let PullOutcome::Message(message) = sub.next().await else {
            panic!("expected message");
        };
        message.ack().await.unwrap();
        assert!(message.is_acked());
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    sub.pull_no_wait(2).await.unwrap();
    assert!(matches!(
        sub.next().await,
        PullOutcome::End(EndReason::NoMessages)
    ));
}

#[tokio::test]
async fn nak_triggers_prompt_redelivery() {
    let (_server, client, consumer) = setup(Duration::from_secs(30)).await;
    publish_events(&client, 1).await;

    let mut sub = consumer.pull_subscription().await.unwrap();
    sub.pull_expires(1, Duration::from_secs(1)).await.unwrap();
    let PullOutcome::Message(message) = sub.next().await else {
        panic!("expected message");
    };
    message.nak().await.unwrap();

    sub.pull_expires(1, Duration::from_secs(1)).await.unwrap();
    let PullOutcome::Message(redelivered) = sub.next().await else {
        panic!("expected redelivery");
    };
    assert_eq!(redelivered.metadata().delivered, 2);
    redelivered.ack().await.unwrap();
}

#[tokio::test]
async fn term_stops_redelivery() {
    let (_server, client, consumer) = setup(Duration::from_millis(200)).await;
    publish_events(&client, 1).await;

    let mut sub = consumer.pull_subscription().await.unwrap();
    sub.pull_expires(1, Duration::from_secs(1)).await.unwrap();
    let PullOutcome::Message(message) = sub.next().await else {
        panic!("expected message");
    };
    message.term().await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    sub.pull_no_wait(1).await.unwrap();
    assert!(matches!(
        sub.next().await,
        PullOutcome::End(EndReason::NoMessages)
    ));
}

#[tokio::test]
async fn ack_sync_waits_for_confirmation() {
    let (_server, client, consumer) = setup(Duration::from_secs(30)).await;
    publish_events(&client, 1).await;

    let mut sub = consumer.pull_subscription().await.unwrap();
    sub.pull_expires(1, Duration::from_secs(1)).await.unwrap();
    let PullOutcome::Message(message) = sub.next().await else {
        panic!("expected message");
    };
    message.ack_sync(Duration::from_secs(1)).await.unwrap();
    assert!(message.is_acked());
    // The terminal latch makes further acks no-ops.
    message.ack().await.unwrap();
    message.nak().await.unwrap();
}

#[tokio::test]
async fn ack_sync_times_out_when_the_server_is_unreachable() {
    let (server, client, consumer) = setup(Duration::from_secs(30)).await;
    publish_events(&client, 1).await;

    let mut sub = consumer.pull_subscription().await.unwrap();
    sub.pull_expires(1, Duration::from_secs(1)).await.unwrap();
    let PullOutcome::Message(message) = sub.next().await else {
        panic!("expected message");
    };

    server.freeze_jetstream(true);
    let result = message.ack_sync(Duration::from_millis(300)).await;
    assert!(matches!(result, Err(lariat::Error::Timeout)));
}

#[tokio::test]
async fn ack_next_composite_keeps_pulling() {
    let (_server, client, consumer) = setup(Duration::from_secs(30)).await;
    publish_events(&client, 3).await;

    let mut sub = consumer.pull_subscription().await.unwrap();
    sub.pull_expires(1, Duration::from_secs(1)).await.unwrap();

    let PullOutcome::Message(first) = sub.next().await else {
        panic!("expected first message");
    };
    assert_eq!(first.payload, "E1");

    sub.ack_next(
        &first,
        PullRequest {
            batch: 1,
            expires: Some(Duration::from_secs(1)),
            ..PullRequest::default()
        },
    )
    .await
    .unwrap();

    let PullOutcome::Message(second) = sub.next().await else {
        panic!("expected second message via ack-next");
    };
    assert_eq!(second.payload, "E2");
    second.ack().await.unwrap();
}

#[tokio::test]
async fn missing_consumer_fails_the_subscription() {
    let (_server, client, _consumer) = setup(Duration::from_secs(30)).await;
    let ghost = client.jetstream().consumer(STREAM, "ghost").unwrap();
    let mut sub = ghost.pull_subscription().await.unwrap();

    sub.pull_expires(1, Duration::from_secs(1)).await.unwrap();
    let PullOutcome::Error(lariat::Error::Status { code, description }) = sub.next().await else {
        panic!("expected a status error");
    };
    assert_eq!(code, 409);
    assert_eq!(description, "Consumer Deleted");

    // FAILED is terminal: no further pulls.
    assert!(matches!(
        sub.pull(1).await,
        Err(lariat::Error::Terminated)
    ));
    assert!(matches!(
        sub.next().await,
        PullOutcome::End(EndReason::Closed)
    ));
}
