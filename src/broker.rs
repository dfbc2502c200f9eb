// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Registry
//!
//! The `Broker` is the process-wide registry of exchanges, queues and bindings. It is
//! created explicitly by the application and handed to channels, topologies,
//! dispatchers and RPC clients; clones share the same state.
//!
//! Publishing routes a message through the binding table and enqueues one copy per
//! destination queue. Every queue is locked on its own, and no queue lock is held
//! while routing into another queue, so dead-lettering from queue A into queue B
//! (or back into A) never deadlocks.
//!
//! Every queue has an expiry task sleeping until its earliest message deadline. A
//! message arriving with an earlier deadline, or the queue's deletion, wakes it up.

use crate::{
    binding::BindingTable,
    channel::{Channel, ChannelInner},
    configs::BrokerConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, DEFAULT_EXCHANGE},
    message::{DeadLetterReason, Message, MessageProperties},
    queue::{QueueBinding, QueueDefinition},
    queue_state::{QueueState, QueueStats, QueuedMessage},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    sync::{Mutex, Notify, RwLock},
    time::{sleep_until, Instant},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Prefix of server-generated queue names
pub const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

#[derive(Debug)]
pub(crate) struct QueueHandle {
    pub(crate) state: Mutex<QueueState>,
    expiry: Arc<Notify>,
}

impl QueueHandle {
    fn new(state: QueueState) -> Arc<QueueHandle> {
        Arc::new(QueueHandle {
            state: Mutex::new(state),
            expiry: Arc::new(Notify::new()),
        })
    }

    fn touch(&self) {
        self.expiry.notify_one();
    }

    /// Wakes the expiry task when `state` got an earlier deadline. Call with the
    /// state lock held, after changing it.
    pub(crate) fn rearm(&self, state: &mut QueueState) {
        if state.take_expiry_wake() {
            self.touch();
        }
    }
}

#[derive(Debug)]
struct BrokerInner {
    cfg: BrokerConfigs,
    exchanges: BindingTable,
    queues: RwLock<HashMap<String, Arc<QueueHandle>>>,
    next_channel: AtomicU64,
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        // expiry tasks see the broker gone and stop
        for handle in self.queues.get_mut().values() {
            handle.touch();
        }
    }
}

/// Handle to the broker registry.
#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Broker::new(BrokerConfigs::default())
    }
}

impl Broker {
    pub fn new(cfg: BrokerConfigs) -> Broker {
        Broker {
            inner: Arc::new(BrokerInner {
                cfg,
                exchanges: BindingTable::new(),
                queues: RwLock::new(HashMap::new()),
                next_channel: AtomicU64::new(1),
            }),
        }
    }

    pub fn configs(&self) -> &BrokerConfigs {
        &self.inner.cfg
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.inner.exchanges
    }

    /// Opens a new channel. Delivery tags are scoped to the channel.
    pub fn open_channel(&self) -> Channel {
        let id = self.inner.next_channel.fetch_add(1, Ordering::Relaxed);
        debug!(channel = id, "channel opened");
        Channel::new(ChannelInner::new(id, self.clone(), self.inner.cfg.prefetch_count))
    }

    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);
        match self.inner.exchanges.declare(def).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(err)
            }
            Ok(created) => {
                if created {
                    debug!("exchange: {} was created", def.name);
                }
                Ok(())
            }
        }
    }

    pub async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.inner.exchanges.delete(name).await?;
        debug!("exchange: {} was deleted", name);
        Ok(())
    }

    /// Declares a queue and returns its name (generated when `def` has none).
    ///
    /// Exclusive queues need an owning channel, see [`Channel::queue_declare`].
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.declare_queue_owned(def, None).await
    }

    pub(crate) async fn declare_queue_owned(
        &self,
        def: &QueueDefinition,
        owner: Option<u64>,
    ) -> Result<String, AmqpError> {
        if def.exclusive && owner.is_none() {
            return Err(AmqpError::ExclusiveQueueWithoutOwner(def.name.clone()));
        }

        let mut def = def.clone();
        if def.name.is_empty() {
            def.name = format!("{}{}", GENERATED_QUEUE_PREFIX, Uuid::new_v4());
        }
        let requester = owner;
        let owner = if def.exclusive { requester } else { None };

        let mut queues = self.inner.queues.write().await;
        if let Some(existing) = queues.get(&def.name) {
            let state = existing.state.lock().await;
            state.check_access(requester)?;
            if state.def != def {
                error!(name = def.name, "queue redeclared with different arguments");
                return Err(AmqpError::DeclareQueueError(def.name.clone()));
            }
            return Ok(def.name.clone());
        }

        debug!("creating queue: {}", def.name);
        let name = def.name.clone();
        let handle = QueueHandle::new(QueueState::new(def, owner));
        self.spawn_expiry(&name, &handle);
        queues.insert(name.clone(), handle);
        debug!("queue: {} was created", name);

        Ok(name)
    }

    /// Deletes a queue, its bindings and its consumers. Returns the number of ready
    /// messages dropped with it.
    pub async fn delete_queue(&self, name: &str) -> Result<usize, AmqpError> {
        let handle = self
            .inner
            .queues
            .write()
            .await
            .remove(name)
            .ok_or_else(|| AmqpError::QueueNotFound(name.to_owned()))?;

        self.inner.exchanges.remove_queue(name).await;
        handle.touch();

        let dropped = handle.state.lock().await.stats().messages;
        debug!(queue = name, dropped, "queue was deleted");
        Ok(dropped)
    }

    pub(crate) async fn queue(&self, name: &str) -> Result<Arc<QueueHandle>, AmqpError> {
        self.inner
            .queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::QueueNotFound(name.to_owned()))
    }

    pub async fn queue_exists(&self, name: &str) -> bool {
        self.inner.queues.read().await.contains_key(name)
    }

    /// Ready / consumer / unacked counters of a queue.
    pub async fn queue_stats(&self, name: &str) -> Result<QueueStats, AmqpError> {
        Ok(self.queue(name).await?.state.lock().await.stats())
    }

    pub async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        if !self.queue_exists(&binding.queue_name).await {
            return Err(AmqpError::QueueNotFound(binding.queue_name.clone()));
        }

        match self
            .inner
            .exchanges
            .bind(
                &binding.exchange_name,
                &binding.queue_name,
                &binding.routing_key,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(err)
            }
            Ok(_) => Ok(()),
        }
    }

    pub async fn unbind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.inner
            .exchanges
            .unbind(
                &binding.exchange_name,
                &binding.queue_name,
                &binding.routing_key,
            )
            .await
            .map(|_| ())
    }

    /// Destination queues for `routing_key` on `exchange`.
    ///
    /// The default exchange routes to the queue named by the key, if it exists.
    pub async fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange == DEFAULT_EXCHANGE {
            if self.queue_exists(routing_key).await {
                return Ok(vec![routing_key.to_owned()]);
            }
            return Ok(vec![]);
        }

        self.inner.exchanges.route(exchange, routing_key).await
    }

    /// Publishes a message and returns how many queues received a copy.
    ///
    /// Zero destinations is not an error: the message is dropped. A full destination
    /// queue fails the call with `QueueCapacityExceeded`, but copies already placed in
    /// other queues stay there since each copy is independent.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<usize, AmqpError> {
        if exchange != DEFAULT_EXCHANGE {
            let entry = self
                .inner
                .exchanges
                .get(exchange)
                .await
                .ok_or_else(|| AmqpError::ExchangeNotFound(exchange.to_owned()))?;
            if entry.def.internal {
                return Err(AmqpError::InternalExchangePublish(exchange.to_owned()));
            }
        }

        let message = Message::new(exchange, routing_key, payload, properties);
        self.deliver(message, None).await
    }

    /// Routes `first` and anything it causes to be dead-lettered.
    ///
    /// Errors concern `first` only; failures while routing dead letters are logged.
    async fn deliver(
        &self,
        first: Message,
        reason: Option<DeadLetterReason>,
    ) -> Result<usize, AmqpError> {
        let mut pending = vec![(first, reason, true)];
        let mut routed = 0;
        let mut failure = None;

        while let Some((message, reason, report)) = pending.pop() {
            let destinations = match self.route(&message.exchange, &message.routing_key).await {
                Ok(destinations) => destinations,
                Err(err) if report => return Err(err),
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        exchange = message.exchange,
                        "dropping dead-lettered message"
                    );
                    continue;
                }
            };

            if destinations.is_empty() {
                debug!(
                    exchange = message.exchange,
                    key = message.routing_key,
                    "message routed to no queue, dropping"
                );
            }

            let message = Arc::new(message);
            for queue in destinations {
                if reason == Some(DeadLetterReason::Expired) && message.expired_cycle_through(&queue) {
                    warn!(queue, "dead-letter cycle detected, dropping message");
                    continue;
                }

                let Ok(handle) = self.queue(&queue).await else {
                    continue;
                };

                let mut state = handle.state.lock().await;
                let now = Instant::now();
                match state.push(message.clone(), now) {
                    Ok(()) => {
                        if report {
                            routed += 1;
                        }
                    }
                    Err(err) => {
                        warn!(error = err.to_string(), queue, "failure to enqueue message");
                        if report && failure.is_none() {
                            failure = Some(err);
                        }
                    }
                }

                let expired = state.dispatch(now);
                handle.rearm(&mut state);
                pending.extend(
                    dead_letters(&state, expired, DeadLetterReason::Expired)
                        .into_iter()
                        .map(|(message, reason)| (message, Some(reason), false)),
                );
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(routed),
        }
    }

    /// Routes dead-lettered messages, logging whatever cannot be delivered.
    pub(crate) async fn dead_letter(&self, letters: Vec<(Message, DeadLetterReason)>) {
        for (message, reason) in letters {
            if let Err(err) = self.deliver(message, Some(reason)).await {
                warn!(error = err.to_string(), "failure to dead-letter message");
            }
        }
    }

    /// Dispatches whatever `queue` can hand out right now.
    pub(crate) async fn dispatch(&self, queue: &str) -> Result<(), AmqpError> {
        let handle = self.queue(queue).await?;
        let letters = {
            let mut state = handle.state.lock().await;
            let expired = state.dispatch(Instant::now());
            handle.rearm(&mut state);
            dead_letters(&state, expired, DeadLetterReason::Expired)
        };
        self.dead_letter(letters).await;
        Ok(())
    }

    fn spawn_expiry(&self, name: &str, handle: &Arc<QueueHandle>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(queue = name, "no runtime, messages of this queue expire lazily");
            return;
        };

        runtime.spawn(expire_messages(
            Arc::downgrade(&self.inner),
            name.to_owned(),
            Arc::downgrade(handle),
            handle.expiry.clone(),
        ));
    }

    async fn owns(&self, name: &str, handle: &Arc<QueueHandle>) -> bool {
        self.inner
            .queues
            .read()
            .await
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }

    /// Dead-letters every expired message in every queue right away. Returns how many
    /// expired.
    ///
    /// Expiry tasks do this on their own as deadlines pass.
    pub async fn sweep_expired(&self) -> usize {
        let handles: Vec<Arc<QueueHandle>> =
            self.inner.queues.read().await.values().cloned().collect();

        let mut count = 0;
        for handle in handles {
            let letters = {
                let mut state = handle.state.lock().await;
                let expired = state.take_expired(Instant::now());
                count += expired.len();
                dead_letters(&state, expired, DeadLetterReason::Expired)
            };
            self.dead_letter(letters).await;
        }

        count
    }
}

/// Dead-letters the messages of one queue as their deadlines pass.
///
/// Runs until the queue is deleted or the broker dropped. Holds no strong reference
/// while waiting.
async fn expire_messages(
    broker: Weak<BrokerInner>,
    name: String,
    queue: Weak<QueueHandle>,
    wake: Arc<Notify>,
) {
    loop {
        let Some(handle) = queue.upgrade() else {
            break;
        };
        let deadline = handle.state.lock().await.arm_expiry();
        drop(handle);

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }

        let (Some(inner), Some(handle)) = (broker.upgrade(), queue.upgrade()) else {
            break;
        };
        let broker = Broker { inner };
        if !broker.owns(&name, &handle).await {
            break;
        }

        // woken early: only re-arm
        let now = Instant::now();
        if deadline.map_or(true, |deadline| deadline > now) {
            continue;
        }

        let letters = {
            let mut state = handle.state.lock().await;
            let expired = state.take_expired(now);
            debug!(queue = name, count = expired.len(), "messages expired");
            dead_letters(&state, expired, DeadLetterReason::Expired)
        };
        drop(handle);
        broker.dead_letter(letters).await;
    }

    debug!(queue = name, "expiry task stopped");
}

/// Turns entries that left `state` into messages bound for its dead-letter exchange.
///
/// Without a dead-letter exchange the entries are dropped.
pub(crate) fn dead_letters(
    state: &QueueState,
    entries: Vec<QueuedMessage>,
    reason: DeadLetterReason,
) -> Vec<(Message, DeadLetterReason)> {
    if entries.is_empty() {
        return vec![];
    }

    let Some((exchange, key)) = state.def.dead_letter_target() else {
        debug!(
            queue = state.name(),
            count = entries.len(),
            reason = reason.as_str(),
            "no dead-letter exchange configured, dropping"
        );
        return vec![];
    };

    entries
        .into_iter()
        .map(|entry| {
            let routing_key = key.unwrap_or(&entry.message.routing_key).to_owned();
            let message = entry
                .message
                .dead_lettered(state.name(), reason, exchange, &routing_key);
            (message, reason)
        })
        .collect()
}
