//! Round trip against a real RabbitMQ. Skipped unless RIDEMESH_TEST_AMQP_URL is set.

use std::time::Duration;

use ridemesh::{BrokerClient, ClientConfig, QueueSpec, Topology};
use tokio::sync::mpsc;

fn live_url() -> Option<String> {
    std::env::var("RIDEMESH_TEST_AMQP_URL").ok()
}

#[tokio::test]
async fn publish_and_consume_over_amqp() {
    let Some(url) = live_url() else {
        return;
    };

    let queue = format!("ridemesh-test-{}", uuid::Uuid::new_v4());
    let topology = Topology::default().with_queue(QueueSpec::transient(queue.clone()));
    let client = BrokerClient::connect(ClientConfig::new(url).with_topology(topology))
        .await
        .expect("broker reachable");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = client.clone();
    let consume_queue = queue.clone();
    let handle = tokio::spawn(async move {
        consumer
            .consume(&consume_queue, move |delivery| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(delivery.text().into_owned());
                    Ok(())
                }
            })
            .await
    });

    for payload in ["one", "two", "three"] {
        client.publish(&queue, payload).await.unwrap();
    }
    for expected in ["one", "two", "three"] {
        let got = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("delivery within timeout")
            .expect("consumer running");
        assert_eq!(got, expected);
    }

    client.close().await;
    assert!(handle.await.unwrap().is_ok());
    assert_eq!(client.active_supervisors(), 0);
}
