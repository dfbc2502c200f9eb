// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Order-processing walkthrough: orders routed by type through a direct exchange,
//! events broadcast through a fanout exchange, logs filtered by a topic exchange,
//! failed orders collected by a dead-letter exchange and inventory checks over RPC.

use async_trait::async_trait;
use opentelemetry::Context;
use rabbitmq_embedded::{
    configs::ConfigBuilder,
    dispatcher::{Dispatcher, DispatcherRoute},
    exchange::ExchangeDefinition,
    handler::{ConsumerHandler, ConsumerMessage, HandlerError},
    logging,
    publisher::{BrokerPublisher, PublishMessage, Publisher},
    queue::{QueueBinding, QueueDefinition},
    rpc::{RpcClient, RpcHandler, RpcServer},
    topology::Topology,
    Broker,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{error, info};

const EXCHANGE_ORDERS: &str = "orders.direct";
const EXCHANGE_EVENTS: &str = "events.fanout";
const EXCHANGE_LOGS: &str = "logs.topic";
const EXCHANGE_DLX: &str = "orders.dlx";

const QUEUE_STANDARD_ORDERS: &str = "orders.standard";
const QUEUE_EXPRESS_ORDERS: &str = "orders.express";
const QUEUE_INTERNATIONAL_ORDERS: &str = "orders.international";
const QUEUE_NOTIFICATIONS: &str = "notifications";
const QUEUE_ANALYTICS: &str = "analytics";
const QUEUE_LOGS: &str = "logs.all";
const QUEUE_DLQ: &str = "orders.failed";
const QUEUE_INVENTORY_RPC: &str = "rpc.inventory";

const MESSAGE_TTL_MS: u64 = 60_000;

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    order_id: String,
    customer_id: String,
    product_id: String,
    quantity: u32,
    order_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderEvent {
    event_type: String,
    order_id: String,
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct InventoryRequest {
    product_id: String,
    quantity: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct InventoryResponse {
    product_id: String,
    requested: u32,
    available: u32,
    in_stock: bool,
}

fn order_queues() -> Vec<QueueDefinition> {
    [
        QUEUE_STANDARD_ORDERS,
        QUEUE_EXPRESS_ORDERS,
        QUEUE_INTERNATIONAL_ORDERS,
    ]
    .into_iter()
    .map(|name| {
        QueueDefinition::new(name)
            .durable()
            .ttl(MESSAGE_TTL_MS)
            .dead_letter_exchange(EXCHANGE_DLX)
    })
    .collect()
}

fn topology() -> Topology {
    let mut topology = Topology::new()
        .exchange(ExchangeDefinition::new(EXCHANGE_DLX).fanout().durable())
        .exchange(ExchangeDefinition::new(EXCHANGE_ORDERS).direct().durable())
        .exchange(ExchangeDefinition::new(EXCHANGE_EVENTS).fanout().durable())
        .exchange(ExchangeDefinition::new(EXCHANGE_LOGS).topic().durable())
        .queue(QueueDefinition::new(QUEUE_DLQ).durable())
        .queue(QueueDefinition::new(QUEUE_NOTIFICATIONS).durable())
        .queue(QueueDefinition::new(QUEUE_ANALYTICS).durable())
        .queue(QueueDefinition::new(QUEUE_LOGS).durable())
        .queue(QueueDefinition::new(QUEUE_INVENTORY_RPC).durable())
        .queue_binding(QueueBinding::new(QUEUE_DLQ).exchange(EXCHANGE_DLX))
        .queue_binding(QueueBinding::new(QUEUE_NOTIFICATIONS).exchange(EXCHANGE_EVENTS))
        .queue_binding(QueueBinding::new(QUEUE_ANALYTICS).exchange(EXCHANGE_EVENTS))
        .queue_binding(
            QueueBinding::new(QUEUE_LOGS)
                .exchange(EXCHANGE_LOGS)
                .routing_key("order.#"),
        );

    for def in order_queues() {
        let key = def.name().replacen("orders.", "order.", 1);
        topology = topology
            .queue_binding(
                QueueBinding::new(def.name())
                    .exchange(EXCHANGE_ORDERS)
                    .routing_key(&key),
            )
            .queue(def);
    }

    topology
}

/// Processes orders; international orders fail to show dead-lettering.
struct OrderWorker;

#[async_trait]
impl ConsumerHandler for OrderWorker {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        let order: Order = serde_json::from_slice(&msg.data)
            .map_err(|err| HandlerError::ProcessingError(err.to_string()))?;

        if order.order_type == "international" {
            error!(order_id = order.order_id, attempt = msg.redelivery_count, "customs check failed");
            return Err(HandlerError::ProcessingError(order.order_id));
        }

        info!(
            order_id = order.order_id,
            queue = msg.from,
            quantity = order.quantity,
            "order processed"
        );
        Ok(())
    }
}

struct EventSubscriber {
    service: &'static str,
}

#[async_trait]
impl ConsumerHandler for EventSubscriber {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        let event: OrderEvent = serde_json::from_slice(&msg.data)
            .map_err(|err| HandlerError::ProcessingError(err.to_string()))?;
        info!(
            service = self.service,
            event = event.event_type,
            order_id = event.order_id,
            "{}",
            event.message
        );
        Ok(())
    }
}

struct Inventory {
    stock: HashMap<String, u32>,
}

#[async_trait]
impl RpcHandler for Inventory {
    async fn exec(&self, _ctx: &Context, request: &[u8]) -> Result<Vec<u8>, HandlerError> {
        let request: InventoryRequest = serde_json::from_slice(request)
            .map_err(|err| HandlerError::ProcessingError(err.to_string()))?;

        let available = self.stock.get(&request.product_id).copied().unwrap_or_default();
        let response = InventoryResponse {
            in_stock: available >= request.quantity,
            product_id: request.product_id,
            requested: request.quantity,
            available,
        };

        serde_json::to_vec(&response).map_err(|err| HandlerError::ProcessingError(err.to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = ConfigBuilder::new().build()?;
    logging::setup(&cfg.app)?;

    let broker = Broker::new(cfg.broker.clone());
    topology().install(&broker).await?;
    info!("infrastructure ready");

    // workers and subscribers
    let workers = broker.open_channel();
    let mut dispatcher = Dispatcher::new(workers.clone(), order_queues()).max_redeliveries(1);
    for def in order_queues() {
        dispatcher = dispatcher.register(
            &DispatcherRoute::new(def.name(), &def.name().replacen("orders.", "order.", 1)),
            Arc::new(OrderWorker),
        );
    }
    let workers_task = tokio::spawn(async move { dispatcher.consume_blocking().await });

    let subscribers = broker.open_channel();
    let notifications = Dispatcher::new(subscribers.clone(), vec![]).register(
        &DispatcherRoute::new(QUEUE_NOTIFICATIONS, "order.created"),
        Arc::new(EventSubscriber {
            service: "notification",
        }),
    );
    let analytics = Dispatcher::new(subscribers.clone(), vec![]).register(
        &DispatcherRoute::new(QUEUE_ANALYTICS, "order.created"),
        Arc::new(EventSubscriber { service: "analytics" }),
    );
    let notifications_task = tokio::spawn(async move { notifications.consume_blocking().await });
    let analytics_task = tokio::spawn(async move { analytics.consume_blocking().await });

    let rpc_channel = broker.open_channel();
    let server = RpcServer::new(
        rpc_channel.clone(),
        QUEUE_INVENTORY_RPC,
        Arc::new(Inventory {
            stock: HashMap::from([
                ("PROD-A".to_owned(), 10),
                ("PROD-B".to_owned(), 3),
                ("PROD-C".to_owned(), 0),
            ]),
        }),
    );
    let rpc_task = tokio::spawn(async move { server.serve().await });

    // producers
    let publisher = BrokerPublisher::new(broker.open_channel());
    let ctx = Context::new();
    let orders = [
        ("ORD-001", "CUST-101", "PROD-A", 2, "standard"),
        ("ORD-002", "CUST-102", "PROD-B", 5, "express"),
        ("ORD-003", "CUST-103", "PROD-C", 1, "international"),
        ("ORD-004", "CUST-104", "PROD-D", 3, "standard"),
    ];

    for (order_id, customer_id, product_id, quantity, order_type) in orders {
        let event = OrderEvent {
            event_type: "order.created".to_owned(),
            order_id: order_id.to_owned(),
            message: format!("Order created for customer {}", customer_id),
        };
        let order = Order {
            order_id: order_id.to_owned(),
            customer_id: customer_id.to_owned(),
            product_id: product_id.to_owned(),
            quantity,
            order_type: order_type.to_owned(),
        };
        let kind = format!("order.{}", order_type);

        publisher
            .publish(&ctx, &PublishMessage::json(EXCHANGE_EVENTS, "", "order.created", &event)?)
            .await?;
        publisher
            .publish(
                &ctx,
                &PublishMessage::json(EXCHANGE_LOGS, &format!("order.{}.info", order_type), "log", &event)?,
            )
            .await?;
        publisher
            .publish(&ctx, &PublishMessage::json(EXCHANGE_ORDERS, &kind, &kind, &order)?)
            .await?;
    }
    info!("all orders published");

    // inventory checks
    let client = RpcClient::new(&broker).await?;
    for (product_id, quantity) in [("PROD-A", 2), ("PROD-B", 5), ("PROD-C", 1)] {
        let request = serde_json::to_vec(&InventoryRequest {
            product_id: product_id.to_owned(),
            quantity,
        })?;
        let reply = client
            .call("", QUEUE_INVENTORY_RPC, &request, client.default_timeout())
            .await?;
        let response: InventoryResponse = serde_json::from_slice(&reply.payload)?;
        info!(
            product_id = response.product_id,
            requested = response.requested,
            available = response.available,
            in_stock = response.in_stock,
            "inventory checked"
        );
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    for queue in [QUEUE_LOGS, QUEUE_DLQ] {
        let stats = broker.queue_stats(queue).await?;
        info!(queue, messages = stats.messages, "queue depth");
    }

    client.close().await?;
    for channel in [&workers, &subscribers, &rpc_channel] {
        channel.close().await?;
    }

    for task in [workers_task, notifications_task, analytics_task] {
        task.await??;
    }
    rpc_task.await??;

    info!("demo finished");
    Ok(())
}
