// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channels and Consumers
//!
//! A channel is a client session on the broker. It scopes delivery tags, owns
//! exclusive queues and the consumers created on it, and is where deliveries are
//! acked or nacked.
//!
//! Closing a channel is the disconnect event: every consumer on it is removed, every
//! delivery it still holds is requeued and its exclusive queues are deleted.

use crate::{
    broker::{dead_letters, Broker},
    delivery::{Delivery, DeliveryState, Settlement},
    errors::AmqpError,
    message::{DeadLetterReason, MessageProperties},
    queue::QueueDefinition,
};
use futures_util::Stream;
use std::{
    collections::HashMap,
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll},
};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of server-generated consumer tags
pub const GENERATED_CONSUMER_TAG_PREFIX: &str = "amq.ctag-";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct ChannelInner {
    id: u64,
    broker: Broker,
    open: AtomicBool,
    prefetch: AtomicU16,
    next_tag: AtomicU64,
    // delivery tag -> queue holding the delivery
    deliveries: Mutex<HashMap<u64, String>>,
    // consumer tag -> queue
    consumers: Mutex<HashMap<String, String>>,
    exclusive_queues: Mutex<Vec<String>>,
}

impl ChannelInner {
    pub(crate) fn new(id: u64, broker: Broker, prefetch: u16) -> ChannelInner {
        ChannelInner {
            id,
            broker,
            open: AtomicBool::new(true),
            prefetch: AtomicU16::new(prefetch),
            next_tag: AtomicU64::new(1),
            deliveries: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            exclusive_queues: Mutex::new(vec![]),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn handle(self: &Arc<Self>) -> Channel {
        Channel {
            inner: self.clone(),
        }
    }

    /// Assigns the next delivery tag and remembers which queue holds it.
    pub(crate) fn track(&self, queue: &str) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        lock(&self.deliveries).insert(tag, queue.to_owned());
        tag
    }

    pub(crate) fn untrack(&self, tag: u64) {
        lock(&self.deliveries).remove(&tag);
    }

    /// Frees the tag of a consumer its queue dropped.
    pub(crate) fn forget_consumer(&self, consumer_tag: &str) {
        lock(&self.consumers).remove(consumer_tag);
    }
}

/// Handle to a channel. Clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(inner: ChannelInner) -> Channel {
        Channel {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::ChannelClosed(self.inner.id))
        }
    }

    /// Sets the prefetch limit applied to consumers created afterwards.
    ///
    /// 0 means unlimited.
    pub fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.inner.prefetch.store(prefetch_count, Ordering::Release);
        Ok(())
    }

    /// Declares a queue; exclusive queues become owned by this channel.
    pub async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.ensure_open()?;
        let name = self
            .inner
            .broker
            .declare_queue_owned(def, Some(self.inner.id))
            .await?;

        if def.exclusive {
            let mut owned = lock(&self.inner.exclusive_queues);
            if !owned.contains(&name) {
                owned.push(name.clone());
            }
        }
        Ok(name)
    }

    pub async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<usize, AmqpError> {
        self.ensure_open()?;
        self.inner
            .broker
            .publish(exchange, routing_key, payload, properties)
            .await
    }

    /// Subscribes to `queue`. An empty `consumer_tag` asks for a generated one.
    pub async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<Consumer, AmqpError> {
        self.ensure_open()?;

        let tag = if consumer_tag.is_empty() {
            format!("{}{}", GENERATED_CONSUMER_TAG_PREFIX, Uuid::new_v4())
        } else {
            consumer_tag.to_owned()
        };

        let handle = self.inner.broker.queue(queue).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = handle.state.lock().await;
            state.check_access(Some(self.inner.id))?;

            {
                let mut consumers = lock(&self.inner.consumers);
                if consumers.contains_key(&tag) {
                    return Err(AmqpError::ConsumerError(format!("duplicated tag {}", tag)));
                }
                consumers.insert(tag.clone(), queue.to_owned());
            }

            state.add_consumer(
                &tag,
                &self.inner,
                self.inner.prefetch.load(Ordering::Acquire),
                sender,
            );
        }

        self.inner.broker.dispatch(queue).await?;

        Ok(Consumer {
            tag,
            queue: queue.to_owned(),
            receiver,
        })
    }

    pub async fn basic_ack(&self, delivery_tag: u64) -> Result<DeliveryState, AmqpError> {
        self.settle(delivery_tag, Settlement::Ack).await
    }

    pub async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<DeliveryState, AmqpError> {
        self.settle(delivery_tag, Settlement::Nack { requeue }).await
    }

    async fn settle(&self, delivery_tag: u64, settlement: Settlement) -> Result<DeliveryState, AmqpError> {
        self.ensure_open()?;

        let Some(queue) = lock(&self.inner.deliveries).remove(&delivery_tag) else {
            warn!(
                channel = self.inner.id,
                delivery_tag, "settling an unknown or already settled delivery"
            );
            return Err(AmqpError::UnknownDeliveryTag(delivery_tag));
        };

        let handle = self
            .inner
            .broker
            .queue(&queue)
            .await
            .map_err(|_| AmqpError::UnknownDeliveryTag(delivery_tag))?;

        let letters = {
            let mut state = handle.state.lock().await;
            let requeue = match settlement {
                Settlement::Ack => None,
                Settlement::Nack { requeue } => Some(requeue),
            };

            let rejected = state.settle(self.inner.id, delivery_tag, requeue)?;
            let mut letters = dead_letters(
                &state,
                rejected.into_iter().collect(),
                DeadLetterReason::Rejected,
            );
            // freed prefetch or a requeued message can be handed out right away
            let expired = state.dispatch(tokio::time::Instant::now());
            handle.rearm(&mut state);
            letters.extend(dead_letters(&state, expired, DeadLetterReason::Expired));
            letters
        };

        self.inner.broker.dead_letter(letters).await;

        debug!(
            channel = self.inner.id,
            delivery_tag,
            queue,
            state = ?settlement.resulting_state(),
            "delivery settled"
        );
        Ok(settlement.resulting_state())
    }

    /// Stops deliveries to a consumer.
    ///
    /// Deliveries it already holds stay on the channel and can still be settled; they
    /// are requeued if the channel closes first.
    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let queue = lock(&self.inner.consumers)
            .remove(consumer_tag)
            .ok_or_else(|| AmqpError::UnknownConsumer(consumer_tag.to_owned()))?;

        let Ok(handle) = self.inner.broker.queue(&queue).await else {
            return Ok(());
        };

        let auto_delete = {
            let mut state = handle.state.lock().await;
            state.cancel(self.inner.id, consumer_tag);
            state.should_auto_delete()
        };

        if auto_delete {
            debug!(queue, "auto-deleting queue without consumers");
            self.inner.broker.delete_queue(&queue).await.ok();
        }

        Ok(())
    }

    /// Closes the channel, releasing everything it holds.
    ///
    /// Returns the number of deliveries that went back to their queues.
    pub async fn close(&self) -> Result<usize, AmqpError> {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return Err(AmqpError::ChannelClosed(self.inner.id));
        }

        let mut queues: Vec<String> = lock(&self.inner.consumers)
            .drain()
            .map(|(_, queue)| queue)
            .collect();
        queues.extend(lock(&self.inner.deliveries).drain().map(|(_, queue)| queue));
        queues.sort();
        queues.dedup();

        let mut released = 0;
        for queue in &queues {
            let Ok(handle) = self.inner.broker.queue(queue).await else {
                continue;
            };

            let (letters, auto_delete) = {
                let mut state = handle.state.lock().await;
                released += state.release_channel(self.inner.id);
                let expired = state.dispatch(tokio::time::Instant::now());
                handle.rearm(&mut state);
                (
                    dead_letters(&state, expired, DeadLetterReason::Expired),
                    state.should_auto_delete(),
                )
            };
            self.inner.broker.dead_letter(letters).await;

            if auto_delete {
                debug!(queue, "auto-deleting queue without consumers");
                self.inner.broker.delete_queue(queue).await.ok();
            }
        }

        let exclusive: Vec<String> = lock(&self.inner.exclusive_queues).drain(..).collect();
        for queue in exclusive {
            debug!(queue, "deleting exclusive queue");
            self.inner.broker.delete_queue(&queue).await.ok();
        }

        if released > 0 {
            warn!(
                channel = self.inner.id,
                released, "channel closed with unacked deliveries, requeued"
            );
        }
        debug!(channel = self.inner.id, "channel closed");

        Ok(released)
    }
}

/// Receiving end of a subscription.
///
/// Yields `None` once the consumer is cancelled, its channel closes or its queue is
/// deleted.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    queue: String,
    receiver: UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Waits for the next delivery.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Returns a delivery if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exchange::ExchangeDefinition, queue::QueueBinding};

    async fn broker_with_queue(def: QueueDefinition) -> Broker {
        let broker = Broker::default();
        broker.declare_queue(&def).await.unwrap();
        broker
    }

    async fn publish_n(broker: &Broker, queue: &str, n: usize) {
        for i in 0..n {
            broker
                .publish("", queue, format!("{}", i).as_bytes(), MessageProperties::default())
                .await
                .unwrap();
        }
    }

    fn body(delivery: &Delivery) -> String {
        String::from_utf8(delivery.payload().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;
        publish_n(&broker, "work", 3).await;

        let channel = broker.open_channel();
        channel.basic_qos(0).unwrap();
        let mut consumer = channel.basic_consume("work", "c1").await.unwrap();

        let bodies: Vec<String> = (0..3)
            .map(|_| body(&consumer.try_recv().unwrap()))
            .collect();
        assert_eq!(bodies, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn delivery_tags_are_scoped_per_channel() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;
        publish_n(&broker, "work", 2).await;

        let a = broker.open_channel();
        let b = broker.open_channel();
        let mut ca = a.basic_consume("work", "a").await.unwrap();
        let mut cb = b.basic_consume("work", "b").await.unwrap();

        assert_eq!(ca.try_recv().unwrap().delivery_tag, 1);
        assert_eq!(cb.try_recv().unwrap().delivery_tag, 1);
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;
        publish_n(&broker, "work", 5).await;

        let channel = broker.open_channel();
        channel.basic_qos(2).unwrap();
        let mut consumer = channel.basic_consume("work", "c1").await.unwrap();

        let first = consumer.try_recv().unwrap();
        let _second = consumer.try_recv().unwrap();
        assert!(consumer.try_recv().is_none());
        assert_eq!(
            broker.queue_stats("work").await.unwrap(),
            crate::queue_state::QueueStats {
                messages: 3,
                consumers: 1,
                unacked: 2
            }
        );

        assert_eq!(first.ack().await, Ok(DeliveryState::Acked));
        let third = consumer.try_recv().unwrap();
        assert_eq!(body(&third), "2");
        assert!(consumer.try_recv().is_none());
    }

    #[tokio::test]
    async fn fair_dispatch_skips_busy_consumers() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;

        let slow = broker.open_channel();
        let fast = broker.open_channel();
        let mut slow_consumer = slow.basic_consume("work", "slow").await.unwrap();
        let mut fast_consumer = fast.basic_consume("work", "fast").await.unwrap();

        publish_n(&broker, "work", 4).await;

        // round robin hands one to each, then only the fast one frees capacity
        let held = slow_consumer.try_recv().unwrap();
        let mut fast_bodies = vec![];
        while let Some(delivery) = fast_consumer.try_recv() {
            fast_bodies.push(body(&delivery));
            delivery.ack().await.unwrap();
        }

        assert_eq!(body(&held), "0");
        assert_eq!(fast_bodies, vec!["1", "2", "3"]);
        assert!(slow_consumer.try_recv().is_none());
    }

    #[tokio::test]
    async fn round_robin_between_idle_consumers() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;

        let channel = broker.open_channel();
        channel.basic_qos(0).unwrap();
        let mut a = channel.basic_consume("work", "a").await.unwrap();
        let mut b = channel.basic_consume("work", "b").await.unwrap();

        publish_n(&broker, "work", 4).await;

        let a_bodies: Vec<String> = std::iter::from_fn(|| a.try_recv()).map(|d| body(&d)).collect();
        let b_bodies: Vec<String> = std::iter::from_fn(|| b.try_recv()).map(|d| body(&d)).collect();
        assert_eq!(a_bodies, vec!["0", "2"]);
        assert_eq!(b_bodies, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn ack_twice_is_rejected() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;
        publish_n(&broker, "work", 1).await;

        let channel = broker.open_channel();
        let mut consumer = channel.basic_consume("work", "").await.unwrap();
        let delivery = consumer.try_recv().unwrap();

        assert_eq!(delivery.ack().await, Ok(DeliveryState::Acked));
        assert_eq!(
            delivery.ack().await,
            Err(AmqpError::UnknownDeliveryTag(delivery.delivery_tag))
        );
        assert_eq!(
            delivery.nack(true).await,
            Err(AmqpError::UnknownDeliveryTag(delivery.delivery_tag))
        );
        assert_eq!(broker.queue_stats("work").await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn nack_requeue_goes_to_the_tail() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;
        publish_n(&broker, "work", 3).await;

        let channel = broker.open_channel();
        let mut consumer = channel.basic_consume("work", "c1").await.unwrap();

        let first = consumer.try_recv().unwrap();
        assert_eq!(first.nack(true).await, Ok(DeliveryState::NackedRequeued));

        let mut order = vec![];
        let mut redelivery_counts = vec![];
        while let Some(delivery) = consumer.try_recv() {
            order.push(body(&delivery));
            redelivery_counts.push(delivery.redelivery_count);
            delivery.ack().await.unwrap();
        }

        assert_eq!(order, vec!["1", "2", "0"]);
        assert_eq!(redelivery_counts, vec![0, 0, 1]);
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters() {
        let broker = Broker::default();
        broker
            .declare_exchange(&ExchangeDefinition::new("orders.dlx").fanout())
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDefinition::new("orders.failed"))
            .await
            .unwrap();
        broker
            .bind(&QueueBinding::new("orders.failed").exchange("orders.dlx"))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDefinition::new("orders").dead_letter_exchange("orders.dlx"))
            .await
            .unwrap();
        publish_n(&broker, "orders", 1).await;

        let channel = broker.open_channel();
        let mut consumer = channel.basic_consume("orders", "w").await.unwrap();
        let delivery = consumer.try_recv().unwrap();
        assert_eq!(delivery.nack(false).await, Ok(DeliveryState::NackedDeadLettered));

        assert_eq!(broker.queue_stats("orders").await.unwrap().messages, 0);
        let failed = broker.open_channel();
        let mut dlq = failed.basic_consume("orders.failed", "").await.unwrap();
        let dead = dlq.try_recv().unwrap();
        assert_eq!(body(&dead), "0");
        assert_eq!(dead.message.death_count(), 1);
        assert_eq!(dead.routing_key(), "orders");
    }

    #[tokio::test]
    async fn nack_without_dead_letter_exchange_drops() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;
        publish_n(&broker, "work", 1).await;

        let channel = broker.open_channel();
        let mut consumer = channel.basic_consume("work", "c1").await.unwrap();
        let delivery = consumer.try_recv().unwrap();

        assert_eq!(delivery.nack(false).await, Ok(DeliveryState::NackedDeadLettered));
        assert_eq!(
            broker.queue_stats("work").await.unwrap(),
            crate::queue_state::QueueStats {
                messages: 0,
                consumers: 1,
                unacked: 0
            }
        );
    }

    #[tokio::test]
    async fn close_requeues_exactly_the_unacked_deliveries() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;
        publish_n(&broker, "work", 5).await;

        let crashing = broker.open_channel();
        crashing.basic_qos(3).unwrap();
        let mut consumer = crashing.basic_consume("work", "c1").await.unwrap();
        let acked = consumer.try_recv().unwrap();
        acked.ack().await.unwrap();
        // holds 3 unacked: "1", "2", "3"; "4" is still ready
        assert_eq!(broker.queue_stats("work").await.unwrap().unacked, 3);

        assert_eq!(crashing.close().await, Ok(3));

        // copies still buffered in the receiver belong to the closed channel
        let mut stale = 0;
        while let Some(delivery) = consumer.recv().await {
            assert_eq!(
                delivery.ack().await,
                Err(AmqpError::ChannelClosed(crashing.id()))
            );
            stale += 1;
        }
        assert_eq!(stale, 3);

        let survivor = broker.open_channel();
        survivor.basic_qos(0).unwrap();
        let mut other = survivor.basic_consume("work", "c2").await.unwrap();
        let mut bodies: Vec<String> = std::iter::from_fn(|| other.try_recv())
            .map(|d| body(&d))
            .collect();
        assert_eq!(bodies.len(), 4);
        bodies.sort();
        assert_eq!(bodies, vec!["1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn dropped_consumer_is_treated_as_disconnected() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;

        let channel = broker.open_channel();
        let consumer = channel.basic_consume("work", "gone").await.unwrap();
        drop(consumer);

        publish_n(&broker, "work", 1).await;
        assert_eq!(
            broker.queue_stats("work").await.unwrap(),
            crate::queue_state::QueueStats {
                messages: 1,
                consumers: 0,
                unacked: 0
            }
        );
    }

    #[tokio::test]
    async fn cancelled_consumer_keeps_its_deliveries_settleable() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;
        publish_n(&broker, "work", 2).await;

        let channel = broker.open_channel();
        let mut consumer = channel.basic_consume("work", "c1").await.unwrap();
        let held = consumer.try_recv().unwrap();

        channel.basic_cancel("c1").await.unwrap();
        assert!(consumer.recv().await.is_none());
        assert_eq!(held.ack().await, Ok(DeliveryState::Acked));
        assert_eq!(
            channel.basic_cancel("c1").await,
            Err(AmqpError::UnknownConsumer("c1".to_owned()))
        );
        assert_eq!(broker.queue_stats("work").await.unwrap().messages, 1);
    }

    #[tokio::test]
    async fn reused_tag_keeps_its_own_prefetch() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;
        publish_n(&broker, "work", 3).await;

        let channel = broker.open_channel();
        channel.basic_qos(1).unwrap();
        let mut first = channel.basic_consume("work", "c1").await.unwrap();
        let old = first.try_recv().unwrap();
        channel.basic_cancel("c1").await.unwrap();

        let mut second = channel.basic_consume("work", "c1").await.unwrap();
        let current = second.try_recv().unwrap();
        assert_eq!(body(&current), "1");

        // settling the old subscription's delivery frees nothing on the new one
        old.ack().await.unwrap();
        assert!(second.try_recv().is_none());
        assert_eq!(
            broker.queue_stats("work").await.unwrap(),
            crate::queue_state::QueueStats {
                messages: 1,
                consumers: 1,
                unacked: 1
            }
        );

        current.ack().await.unwrap();
        assert_eq!(body(&second.try_recv().unwrap()), "2");
    }

    #[tokio::test]
    async fn dropped_consumer_frees_its_tag_and_deliveries() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;
        publish_n(&broker, "work", 1).await;

        let channel = broker.open_channel();
        channel.basic_qos(2).unwrap();
        let mut consumer = channel.basic_consume("work", "gone").await.unwrap();
        let held = consumer.try_recv().unwrap();
        drop(consumer);

        // the next dispatch finds the receiver gone and releases everything it held
        broker
            .publish("", "work", b"1", MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(held.ack().await, Err(AmqpError::UnknownDeliveryTag(held.delivery_tag)));

        let mut again = channel.basic_consume("work", "gone").await.unwrap();
        let bodies: Vec<String> = (0..2).map(|_| body(&again.try_recv().unwrap())).collect();
        assert_eq!(bodies, vec!["1", "0"]);
    }

    #[tokio::test]
    async fn auto_delete_queue_goes_away_with_its_last_consumer() {
        let broker = broker_with_queue(QueueDefinition::new("tmp").delete()).await;

        let channel = broker.open_channel();
        channel.basic_consume("tmp", "c1").await.unwrap();
        channel.basic_cancel("c1").await.unwrap();

        assert!(!broker.queue_exists("tmp").await);
    }

    #[tokio::test]
    async fn exclusive_queue_lives_with_its_channel() {
        let broker = Broker::default();
        let owner = broker.open_channel();
        let other = broker.open_channel();

        let name = owner
            .queue_declare(&QueueDefinition::new("").exclusive())
            .await
            .unwrap();
        assert_eq!(
            other.basic_consume(&name, "").await.unwrap_err(),
            AmqpError::ResourceLocked(name.clone())
        );

        owner.close().await.unwrap();
        assert!(!broker.queue_exists(&name).await);
    }

    #[tokio::test]
    async fn closed_channel_refuses_operations() {
        let broker = broker_with_queue(QueueDefinition::new("work")).await;
        let channel = broker.open_channel();
        channel.close().await.unwrap();

        let id = channel.id();
        assert_eq!(channel.close().await, Err(AmqpError::ChannelClosed(id)));
        assert_eq!(channel.basic_ack(1).await, Err(AmqpError::ChannelClosed(id)));
        assert_eq!(
            channel.basic_consume("work", "").await.unwrap_err(),
            AmqpError::ChannelClosed(id)
        );
    }
}
