// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use opentelemetry::Context;
use rabbitmq_embedded::{
    exchange::ExchangeDefinition,
    handler::HandlerError,
    message::MessageProperties,
    queue::{QueueBinding, QueueDefinition},
    rpc::{RpcClient, RpcHandler, RpcServer},
    topology::Topology,
    AmqpError, Broker, DeliveryState, QueueStats,
};
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

struct StockLookup;

#[async_trait]
impl RpcHandler for StockLookup {
    async fn exec(&self, _ctx: &Context, request: &[u8]) -> Result<Vec<u8>, HandlerError> {
        let mut reply = b"stock:".to_vec();
        reply.extend_from_slice(request);
        Ok(reply)
    }
}

fn orders_topology() -> Topology {
    Topology::new()
        .exchange(ExchangeDefinition::new("orders.direct").direct())
        .exchange(ExchangeDefinition::new("events.fanout").fanout())
        .exchange(ExchangeDefinition::new("logs.topic").topic())
        .queue(QueueDefinition::new("orders.standard"))
        .queue(QueueDefinition::new("orders.express"))
        .queue(QueueDefinition::new("notifications"))
        .queue(QueueDefinition::new("analytics"))
        .queue(QueueDefinition::new("logs.all"))
        .queue_binding(
            QueueBinding::new("orders.standard")
                .exchange("orders.direct")
                .routing_key("order.standard"),
        )
        .queue_binding(
            QueueBinding::new("orders.express")
                .exchange("orders.direct")
                .routing_key("order.express"),
        )
        .queue_binding(QueueBinding::new("notifications").exchange("events.fanout"))
        .queue_binding(QueueBinding::new("analytics").exchange("events.fanout"))
        .queue_binding(
            QueueBinding::new("logs.all")
                .exchange("logs.topic")
                .routing_key("order.#"),
        )
}

async fn messages(broker: &Broker, queue: &str) -> usize {
    broker.queue_stats(queue).await.unwrap().messages
}

#[tokio::test]
async fn order_processing_scenario() {
    let broker = Broker::default();
    orders_topology().install(&broker).await.unwrap();
    let props = MessageProperties::default;

    assert_eq!(
        broker
            .publish("orders.direct", "order.standard", b"ORD-001", props())
            .await,
        Ok(1)
    );
    assert_eq!(messages(&broker, "orders.standard").await, 1);
    assert_eq!(messages(&broker, "orders.express").await, 0);

    assert_eq!(
        broker
            .publish("events.fanout", "", b"order.created", props())
            .await,
        Ok(2)
    );
    assert_eq!(messages(&broker, "notifications").await, 1);
    assert_eq!(messages(&broker, "analytics").await, 1);

    for key in ["order.created", "order.completed.express"] {
        assert_eq!(broker.publish("logs.topic", key, b"log", props()).await, Ok(1));
    }
    assert_eq!(broker.publish("logs.topic", "payment.created", b"log", props()).await, Ok(0));
    assert_eq!(messages(&broker, "logs.all").await, 2);

    let channel = broker.open_channel();
    let mut worker = channel.basic_consume("orders.standard", "").await.unwrap();
    let delivery = worker.recv().await.unwrap();
    assert_eq!(delivery.payload(), b"ORD-001");
    assert_eq!(delivery.exchange(), "orders.direct");
    assert_eq!(delivery.routing_key(), "order.standard");
    assert_eq!(delivery.ack().await, Ok(DeliveryState::Acked));
    assert_eq!(
        broker.queue_stats("orders.standard").await.unwrap(),
        QueueStats {
            messages: 0,
            consumers: 1,
            unacked: 0
        }
    );
}

#[tokio::test]
async fn topic_wildcards_route_as_documented() {
    let broker = Broker::default();
    broker
        .declare_exchange(&ExchangeDefinition::new("logs.topic").topic())
        .await
        .unwrap();
    for (queue, pattern) in [("hash", "order.#"), ("star", "order.*"), ("all", "#")] {
        broker.declare_queue(&QueueDefinition::new(queue)).await.unwrap();
        broker
            .bind(
                &QueueBinding::new(queue)
                    .exchange("logs.topic")
                    .routing_key(pattern),
            )
            .await
            .unwrap();
    }

    let routed = |key: &'static str| {
        let broker = broker.clone();
        async move {
            let mut queues = broker.route("logs.topic", key).await.unwrap();
            queues.sort();
            queues
        }
    };

    assert_eq!(routed("order").await, vec!["all", "hash"]);
    assert_eq!(routed("order.x").await, vec!["all", "hash", "star"]);
    assert_eq!(routed("order.x.y").await, vec!["all", "hash"]);
    assert_eq!(routed("payment.x").await, vec!["all"]);
    assert_eq!(routed("").await, vec!["all"]);
}

#[tokio::test]
async fn dead_letters_reach_every_queue_bound_to_the_configured_key() {
    let broker = Broker::default();
    Topology::new()
        .exchange(ExchangeDefinition::new("failures.topic").topic())
        .queue(QueueDefinition::new("failures.orders"))
        .queue(QueueDefinition::new("failures.all"))
        .queue(QueueDefinition::new("failures.payments"))
        .queue(
            QueueDefinition::new("orders")
                .dead_letter_exchange("failures.topic")
                .dead_letter_routing_key("failed.order"),
        )
        .queue_binding(
            QueueBinding::new("failures.orders")
                .exchange("failures.topic")
                .routing_key("failed.order"),
        )
        .queue_binding(
            QueueBinding::new("failures.all")
                .exchange("failures.topic")
                .routing_key("failed.#"),
        )
        .queue_binding(
            QueueBinding::new("failures.payments")
                .exchange("failures.topic")
                .routing_key("failed.payment"),
        )
        .install(&broker)
        .await
        .unwrap();

    broker
        .publish("", "orders", b"ORD-003", MessageProperties::default())
        .await
        .unwrap();
    let channel = broker.open_channel();
    let mut consumer = channel.basic_consume("orders", "").await.unwrap();
    let delivery = consumer.recv().await.unwrap();
    assert_eq!(
        delivery.nack(false).await,
        Ok(DeliveryState::NackedDeadLettered)
    );

    assert_eq!(messages(&broker, "orders").await, 0);
    assert_eq!(messages(&broker, "failures.orders").await, 1);
    assert_eq!(messages(&broker, "failures.all").await, 1);
    assert_eq!(messages(&broker, "failures.payments").await, 0);
}

#[tokio::test]
async fn disconnect_requeues_exactly_the_unacked_deliveries() {
    let broker = Broker::default();
    broker
        .declare_queue(&QueueDefinition::new("work"))
        .await
        .unwrap();
    for i in 0..10 {
        broker
            .publish("", "work", format!("{}", i).as_bytes(), MessageProperties::default())
            .await
            .unwrap();
    }

    let crashing = broker.open_channel();
    crashing.basic_qos(4).unwrap();
    let mut consumer = crashing.basic_consume("work", "").await.unwrap();
    for _ in 0..3 {
        consumer.recv().await.unwrap().ack().await.unwrap();
    }
    assert_eq!(broker.queue_stats("work").await.unwrap().unacked, 4);

    assert_eq!(crashing.close().await, Ok(4));
    assert_eq!(
        broker.queue_stats("work").await.unwrap(),
        QueueStats {
            messages: 7,
            consumers: 0,
            unacked: 0
        }
    );

    let survivor = broker.open_channel();
    survivor.basic_qos(0).unwrap();
    let mut consumer = survivor.basic_consume("work", "").await.unwrap();
    let mut seen = HashSet::new();
    let mut redelivered = 0;
    while let Some(delivery) = consumer.try_recv() {
        assert!(seen.insert(delivery.payload().to_vec()));
        if delivery.redelivered {
            redelivered += 1;
        }
        delivery.ack().await.unwrap();
    }
    assert_eq!(seen.len(), 7);
    assert_eq!(redelivered, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn prefetch_bound_holds_under_interleavings() {
    const TOTAL: usize = 200;

    let broker = Broker::default();
    broker
        .declare_queue(&QueueDefinition::new("work"))
        .await
        .unwrap();

    let acked = Arc::new(AtomicUsize::new(0));
    let bodies = Arc::new(Mutex::new(HashSet::new()));

    let mut consumers = vec![];
    for prefetch in [3usize, 1, 2] {
        let broker = broker.clone();
        let acked = acked.clone();
        let bodies = bodies.clone();
        consumers.push(tokio::spawn(async move {
            let channel = broker.open_channel();
            channel.basic_qos(prefetch as u16).unwrap();
            let mut consumer = channel.basic_consume("work", "").await.unwrap();
            let mut held = VecDeque::new();
            let mut round = 0usize;

            while acked.load(Ordering::SeqCst) < TOTAL {
                round += 1;
                match tokio::time::timeout(Duration::from_millis(10), consumer.recv()).await {
                    Ok(Some(delivery)) => {
                        held.push_back(delivery);
                        assert!(held.len() <= prefetch, "prefetch {} exceeded", prefetch);
                    }
                    Ok(None) => break,
                    Err(_) => {}
                }

                let settle = if held.len() == prefetch || round % 3 == 0 {
                    1
                } else if acked.load(Ordering::SeqCst) + held.len() >= TOTAL {
                    held.len()
                } else {
                    0
                };

                for _ in 0..settle {
                    let Some(delivery) = held.pop_front() else {
                        break;
                    };
                    if delivery.redelivery_count == 0 && round % 5 == 0 {
                        delivery.nack(true).await.unwrap();
                    } else {
                        delivery.ack().await.unwrap();
                        assert!(bodies.lock().unwrap().insert(delivery.payload().to_vec()));
                        acked.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }

            channel.close().await.ok();
        }));
    }

    for i in 0..TOTAL {
        broker
            .publish("", "work", format!("{}", i).as_bytes(), MessageProperties::default())
            .await
            .unwrap();
        if i % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }

    for consumer in consumers {
        tokio::time::timeout(Duration::from_secs(30), consumer)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(acked.load(Ordering::SeqCst), TOTAL);
    assert_eq!(bodies.lock().unwrap().len(), TOTAL);
    let stats = broker.queue_stats("work").await.unwrap();
    assert_eq!((stats.messages, stats.unacked), (0, 0));
}

#[tokio::test]
async fn inventory_rpc_round_trip() {
    let broker = Broker::default();
    broker
        .declare_queue(&QueueDefinition::new("rpc.inventory"))
        .await
        .unwrap();

    let server = RpcServer::new(broker.open_channel(), "rpc.inventory", Arc::new(StockLookup));
    tokio::spawn(async move { server.serve().await });

    let client = RpcClient::new(&broker).await.unwrap();
    let (a, b) = tokio::join!(
        client.call("", "rpc.inventory", b"PROD-A", Duration::from_secs(5)),
        client.call("", "rpc.inventory", b"PROD-B", Duration::from_secs(5)),
    );

    assert_eq!(&*a.unwrap().payload, b"stock:PROD-A");
    assert_eq!(&*b.unwrap().payload, b"stock:PROD-B");
    assert_eq!(client.pending_calls(), 0);

    client.close().await.unwrap();
    assert!(matches!(
        client
            .call("", "rpc.inventory", b"PROD-C", Duration::from_secs(5))
            .await,
        Err(AmqpError::ChannelClosed(_))
    ));
}
