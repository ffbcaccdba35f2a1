//! Subscription replay across broker reconnects.

use mqtt_events::Qos;

use crate::common::{eventually, Collector, OrderPlaced, TestBus, ORDER_PLACED};

#[tokio::test]
async fn subscriptions_survive_reconnect() {
    let test = TestBus::start().await;
    test.bus.register_event::<OrderPlaced>(ORDER_PLACED).unwrap();
    let collector = Collector::default();
    test.bus
        .subscribe(ORDER_PLACED, "orders", Qos::AtLeastOnce, collector.clone())
        .await
        .unwrap();
    test.bus
        .subscribe(ORDER_PLACED, "returns", Qos::AtMostOnce, collector.clone())
        .await
        .unwrap();

    test.transport.simulate_connection_lost("network reset").await;
    assert!(!test.transport.is_connected().await);
    test.transport.simulate_reconnect().await;

    assert!(eventually(|| async { test.transport.subscribe_calls().await.len() == 4 }).await);
    let calls = test.transport.subscribe_calls().await;
    let mut replayed: Vec<(String, Qos)> = calls[2..]
        .iter()
        .map(|call| (call.topic.clone(), call.qos))
        .collect();
    replayed.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        replayed,
        vec![
            ("orders".to_string(), Qos::AtLeastOnce),
            ("returns".to_string(), Qos::AtMostOnce),
        ]
    );

    let payload = serde_json::to_vec(&OrderPlaced::new("after-reconnect", 1)).unwrap();
    test.transport.deliver("returns", payload).await;
    assert!(eventually(|| async { collector.seen() == vec!["after-reconnect"] }).await);
}

#[tokio::test]
async fn failed_replay_is_retried_on_next_reconnect() {
    let test = TestBus::start().await;
    test.bus.register_event::<OrderPlaced>(ORDER_PLACED).unwrap();
    test.bus
        .subscribe(ORDER_PLACED, "orders", Qos::AtLeastOnce, Collector::default())
        .await
        .unwrap();

    test.transport.set_fail_on_subscribe(true).await;
    test.transport.simulate_reconnect().await;
    assert!(eventually(|| async { test.transport.subscribe_calls().await.len() == 2 }).await);
    assert_eq!(test.bus.subscriptions().len(), 1);

    test.transport.set_fail_on_subscribe(false).await;
    test.transport.simulate_reconnect().await;
    assert!(eventually(|| async { test.transport.subscribe_calls().await.len() == 3 }).await);
    assert_eq!(test.transport.routed_filters().await, vec!["orders"]);
}
