//! Publish and subscribe flows through the public API.

use mqtt_events::event::now_nanos;
use mqtt_events::{BusError, Qos};

use crate::common::{
    eventually, Collector, OrderPlaced, PaymentCaptured, TestBus, ORDER_PLACED, PAYMENT_CAPTURED,
};

#[tokio::test]
async fn published_events_reach_subscribers_by_type() {
    let test = TestBus::start().await;
    test.bus.register_event::<OrderPlaced>(ORDER_PLACED).unwrap();
    test.bus
        .register_event::<PaymentCaptured>(PAYMENT_CAPTURED)
        .unwrap();
    let collector = Collector::default();
    test.bus
        .subscribe(ORDER_PLACED, "shop/orders", Qos::AtLeastOnce, collector.clone())
        .await
        .unwrap();
    test.bus
        .subscribe(PAYMENT_CAPTURED, "shop/payments", Qos::AtLeastOnce, collector.clone())
        .await
        .unwrap();

    test.bus
        .publish("shop/orders", &OrderPlaced::new("o-1", 1250), Qos::AtLeastOnce, false)
        .await
        .unwrap();
    test.bus
        .publish("shop/payments", &PaymentCaptured::new("o-1"), Qos::AtLeastOnce, false)
        .await
        .unwrap();
    for message in test.transport.published().await {
        test.transport.deliver(&message.topic, message.payload).await;
    }

    assert!(
        eventually(|| async { collector.seen() == vec!["o-1", "payment:o-1"] }).await,
        "saw {:?}",
        collector.seen()
    );
    assert_eq!(test.counter("mqtt_message_produced_count", "shop/orders"), 1);
    assert_eq!(test.counter("mqtt_message_count", "shop/orders"), 1);
    assert_eq!(test.counter("mqtt_message_count", "shop/payments"), 1);
}

#[tokio::test]
async fn wildcard_subscription_is_labelled_by_filter() {
    let test = TestBus::start().await;
    test.bus.register_event::<OrderPlaced>(ORDER_PLACED).unwrap();
    let collector = Collector::default();
    test.bus
        .subscribe(ORDER_PLACED, "shop/+/orders", Qos::AtMostOnce, collector.clone())
        .await
        .unwrap();

    for (region, id) in [("eu", "o-eu"), ("us", "o-us")] {
        let payload = serde_json::to_vec(&OrderPlaced::new(id, 10)).unwrap();
        let delivered = test
            .transport
            .deliver(&format!("shop/{}/orders", region), payload)
            .await;
        assert_eq!(delivered, 1);
    }

    assert!(eventually(|| async { collector.seen() == vec!["o-eu", "o-us"] }).await);
    assert_eq!(test.counter("mqtt_message_count", "shop/+/orders"), 2);
}

#[tokio::test]
async fn wire_envelope_is_flat() {
    let test = TestBus::start().await;
    test.bus.register_event::<OrderPlaced>(ORDER_PLACED).unwrap();
    let collector = Collector::default();
    test.bus
        .subscribe(ORDER_PLACED, "orders", Qos::AtLeastOnce, collector.clone())
        .await
        .unwrap();

    let payload = format!(
        r#"{{"type":"order.placed","version":3,"created_at":{},"message_id":42,"order_id":"o-9","total_cents":5}}"#,
        now_nanos()
    );
    test.transport.deliver("orders", payload.into_bytes()).await;

    assert!(eventually(|| async { collector.seen() == vec!["o-9"] }).await);
}

#[tokio::test]
async fn publish_failure_is_returned_and_counted() {
    let test = TestBus::start().await;
    test.transport.set_fail_on_publish(true).await;

    let result = test
        .bus
        .publish("orders", &OrderPlaced::new("o-1", 1), Qos::ExactlyOnce, false)
        .await;

    assert!(matches!(result, Err(BusError::Publish { .. })));
    assert_eq!(test.counter("mqtt_messages_produce_errors_count", "orders"), 1);
    assert_eq!(test.counter("mqtt_message_produced_count", "orders"), 0);
}

#[tokio::test]
async fn subscribe_rejection_is_returned_to_caller() {
    let test = TestBus::start().await;
    test.bus.register_event::<OrderPlaced>(ORDER_PLACED).unwrap();
    test.transport.set_fail_on_subscribe(true).await;

    let result = test
        .bus
        .subscribe(ORDER_PLACED, "orders", Qos::AtLeastOnce, Collector::default())
        .await;

    assert!(matches!(result, Err(BusError::Subscribe { .. })));
    assert!(test.bus.subscriptions().is_empty());
}
