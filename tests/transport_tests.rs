//! Transport recovery tests against the in-process broker

#[cfg(test)]
mod tests {
    use kline_hub::transport::{LinkState, MemoryBroker, Transport, TransportConfig};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn config() -> TransportConfig {
        TransportConfig {
            reconnect_interval: Duration::from_millis(25),
            publish_queue_capacity: 16,
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        let waited = tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    fn bodies(received: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        received.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_publishes_while_broken_arrive_in_order_after_reconnect() {
        let broker = MemoryBroker::new();
        let transport = Transport::start(broker.clone(), config()).await.unwrap();
        let handle = transport.handle();

        handle.declare_exchange("kline-hub").await.unwrap();
        let queue = handle.declare_queue("", "kline-hub", "kline").await.unwrap();
        assert!(queue.starts_with("amq.gen-"));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        handle
            .consume(&queue, "recorder", move |delivery| {
                sink.lock().unwrap().push(String::from_utf8_lossy(&delivery.body).into_owned());
            })
            .await
            .unwrap();

        handle.publish_transient("kline-hub", "kline", "a").await.unwrap();
        wait_for("first delivery", || bodies(&received).len() == 1).await;

        broker.refuse_connections(true);
        broker.sever();
        wait_for("broken link", || handle.state() == LinkState::Broken).await;

        for body in ["b", "c", "d"] {
            handle.publish_transient("kline-hub", "kline", body).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(bodies(&received), vec!["a"]);

        broker.refuse_connections(false);
        wait_for("redelivery", || bodies(&received).len() == 4).await;

        assert_eq!(bodies(&received), vec!["a", "b", "c", "d"]);
        assert_eq!(handle.state(), LinkState::Connected);
        assert_eq!(broker.connections(), 2);

        transport.close().await;
        assert_eq!(handle.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn test_named_queue_and_consumer_survive_repeated_severs() {
        let broker = MemoryBroker::new();
        let transport = Transport::start(broker.clone(), config()).await.unwrap();
        let handle = transport.handle();

        handle.declare_exchange("ex").await.unwrap();
        handle.declare_queue("kline", "ex", "kline").await.unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        handle
            .consume("kline", "test_callback", move |delivery| {
                sink.lock().unwrap().push(String::from_utf8_lossy(&delivery.body).into_owned());
            })
            .await
            .unwrap();

        for round in 0..3 {
            broker.sever();
            assert!(!broker.has_queue("kline"));
            wait_for("queue replay", || broker.has_queue("kline") && handle.state() == LinkState::Connected).await;
            handle.publish_transient("ex", "kline", format!("round-{round}")).await.unwrap();
            wait_for("delivery", || bodies(&received).len() == round + 1).await;
        }

        assert_eq!(bodies(&received), vec!["round-0", "round-1", "round-2"]);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_failed_publish_is_not_lost() {
        let broker = MemoryBroker::new();
        let transport = Transport::start(broker.clone(), config()).await.unwrap();
        let handle = transport.handle();
        handle.declare_exchange("ex").await.unwrap();

        broker.fail_next_publishes(1);
        handle.publish_transient("ex", "kline", "first").await.unwrap();
        handle.publish_transient("ex", "kline", "second").await.unwrap();

        wait_for("both published", || broker.published().len() == 2).await;
        let published: Vec<Vec<u8>> = broker.published().into_iter().map(|m| m.body).collect();
        assert_eq!(published, vec![b"first".to_vec(), b"second".to_vec()]);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_close_while_broken_does_not_close_session() {
        let broker = MemoryBroker::new();
        let transport = Transport::start(broker.clone(), config()).await.unwrap();
        let handle = transport.handle();

        broker.refuse_connections(true);
        broker.sever();
        wait_for("broken link", || handle.state() == LinkState::Broken).await;
        handle.publish_transient("ex", "kline", "lost").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), transport.close())
            .await
            .expect("close must not hang while broken");
        assert_eq!(broker.closed_sessions(), 0);
        assert!(broker.published().is_empty());
    }
}
