use super::*;
use crate::bus::{Disposition, MessageHeaders};
use std::time::Duration;

async fn broker_with(queues: &[&str]) -> ChannelBroker {
    let broker = ChannelBroker::new();
    for q in queues {
        broker.declare_queue(&QueueSpec::transient(*q)).await.unwrap();
    }
    broker
}

async fn next(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Stream ended")
        .expect("Delivery error")
}

#[tokio::test]
async fn test_publish_and_consume_in_order() {
    let broker = broker_with(&["q"]).await;
    broker.publish("q", OutboundMessage::json("1")).await.unwrap();
    broker.publish("q", OutboundMessage::json("2")).await.unwrap();

    let mut stream = broker.consume("q", 1).await.unwrap();
    let first = next(&mut stream).await;
    assert_eq!(&first.body[..], b"1");
    first.settle(Disposition::Ack).await.unwrap();

    let second = next(&mut stream).await;
    assert_eq!(&second.body[..], b"2");
    assert!(!second.redelivered);
}

#[tokio::test]
async fn test_publish_to_undeclared_queue_is_dropped() {
    let broker = ChannelBroker::new();
    broker.publish("missing", OutboundMessage::json("x")).await.unwrap();
    assert!(broker.published("missing").await.is_empty());
    assert!(broker.consume("missing", 1).await.is_err());
}

#[tokio::test]
async fn test_declare_is_idempotent() {
    let broker = broker_with(&["q"]).await;
    broker.publish("q", OutboundMessage::json("kept")).await.unwrap();
    broker.declare_queue(&QueueSpec::transient("q")).await.unwrap();
    assert_eq!(broker.depth("q").await, 1);
}

#[tokio::test]
async fn test_requeue_redelivers_at_head() {
    let broker = broker_with(&["q"]).await;
    broker.publish("q", OutboundMessage::json("a")).await.unwrap();
    broker.publish("q", OutboundMessage::json("b")).await.unwrap();

    let mut stream = broker.consume("q", 1).await.unwrap();
    let first = next(&mut stream).await;
    first.settle(Disposition::Requeue).await.unwrap();

    let again = next(&mut stream).await;
    assert_eq!(&again.body[..], b"a");
    assert!(again.redelivered);
}

#[tokio::test]
async fn test_drop_without_dead_letter_discards() {
    let broker = broker_with(&["q"]).await;
    broker.publish("q", OutboundMessage::json("a")).await.unwrap();

    let mut stream = broker.consume("q", 1).await.unwrap();
    next(&mut stream).await.settle(Disposition::Drop).await.unwrap();

    assert_eq!(broker.depth("q").await, 0);
}

#[tokio::test]
async fn test_prefetch_limits_in_flight() {
    let broker = broker_with(&["q"]).await;
    broker.publish("q", OutboundMessage::json("a")).await.unwrap();
    broker.publish("q", OutboundMessage::json("b")).await.unwrap();

    let mut stream = broker.consume("q", 1).await.unwrap();
    let first = next(&mut stream).await;

    // Second delivery is held back until the first is settled
    let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(blocked.is_err());

    first.settle(Disposition::Ack).await.unwrap();
    let second = next(&mut stream).await;
    assert_eq!(&second.body[..], b"b");
}

#[tokio::test]
async fn test_double_settle_fails() {
    let broker = broker_with(&["q"]).await;
    broker.publish("q", OutboundMessage::json("a")).await.unwrap();
    let mut stream = broker.consume("q", 1).await.unwrap();
    let delivery = next(&mut stream).await;

    delivery.acker.ack().await.unwrap();
    assert!(delivery.acker.ack().await.is_err());
}

#[tokio::test]
async fn test_expired_message_is_dead_lettered_with_headers() {
    let broker = broker_with(&["poison"]).await;
    broker
        .declare_queue(&QueueSpec::delay(
            "retry-poison-1",
            Duration::from_millis(30),
            "poison",
        ))
        .await
        .unwrap();

    broker
        .publish(
            "retry-poison-1",
            OutboundMessage::json("late")
                .with_headers(MessageHeaders::with_retries(1))
                .with_expiration(Duration::from_millis(30)),
        )
        .await
        .unwrap();
    assert_eq!(broker.depth("retry-poison-1").await, 1);

    let mut stream = broker.consume("poison", 1).await.unwrap();
    let delivery = next(&mut stream).await;
    assert_eq!(&delivery.body[..], b"late");
    assert_eq!(delivery.headers.retries, Some(1));
    assert_eq!(broker.depth("retry-poison-1").await, 0);
}

#[tokio::test]
async fn test_message_expiration_shorter_than_queue_ttl_wins() {
    let broker = broker_with(&["target"]).await;
    broker
        .declare_queue(&QueueSpec::delay("delay", Duration::from_secs(60), "target"))
        .await
        .unwrap();

    broker
        .publish(
            "delay",
            OutboundMessage::json("x").with_expiration(Duration::from_millis(20)),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(broker.depth("target").await, 1);
}

#[tokio::test]
async fn test_close_ends_streams() {
    let broker = broker_with(&["q"]).await;
    let mut stream = broker.consume("q", 1).await.unwrap();

    let closer = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.close().await;
    });

    let ended = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("Stream did not end");
    assert!(ended.is_none());
    assert!(matches!(
        broker.publish("q", OutboundMessage::json("x")).await,
        Err(BusError::Closed)
    ));
}

#[tokio::test]
async fn test_requeued_message_gets_a_fresh_ttl() {
    let broker = broker_with(&["target"]).await;
    broker
        .declare_queue(&QueueSpec::delay("delay", Duration::from_millis(300), "target"))
        .await
        .unwrap();
    broker.publish("delay", OutboundMessage::json("x")).await.unwrap();

    let mut stream = broker.consume("delay", 1).await.unwrap();
    let delivery = next(&mut stream).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    delivery.settle(Disposition::Requeue).await.unwrap();

    // Past the first enqueue's TTL, before the requeued copy's
    tokio::time::sleep(Duration::from_millis(230)).await;
    assert_eq!(broker.depth("delay").await, 1);
    assert_eq!(broker.depth("target").await, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.depth("delay").await, 0);
    assert_eq!(broker.depth("target").await, 1);
}
