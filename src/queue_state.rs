// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue State & Fair Dispatch
//!
//! Everything a queue owns: ready messages (FIFO), deliveries held by consumers and
//! the consumer registry. A `QueueState` is only ever touched behind its queue's
//! lock, which makes every enqueue, dispatch, ack, nack and requeue on one queue
//! serialized while different queues run in parallel.
//!
//! Dispatch hands the head message to the next consumer, in round-robin order, whose
//! unacked count is below its prefetch limit. A consumer that reached its limit is
//! skipped until it settles something.

use crate::{
    channel::ChannelInner,
    delivery::Delivery,
    errors::AmqpError,
    message::Message,
    queue::QueueDefinition,
};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Weak},
};
use tokio::{sync::mpsc::UnboundedSender, time::Instant};
use tracing::{debug, warn};

/// A message copy waiting in a queue or held by a consumer.
#[derive(Debug, Clone)]
pub(crate) struct QueuedMessage {
    pub(crate) message: Arc<Message>,
    pub(crate) redelivery_count: u32,
    pub(crate) expires_at: Option<Instant>,
}

impl QueuedMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
struct Unacked {
    // subscription holding the delivery; a tag reused after cancel gets a new slot
    slot_id: u64,
    entry: QueuedMessage,
}

#[derive(Debug)]
struct ConsumerSlot {
    id: u64,
    tag: String,
    channel_id: u64,
    channel: Weak<ChannelInner>,
    prefetch: u16,
    unacked: usize,
    sender: UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked < self.prefetch as usize
    }
}

/// Counters reported for a queue, as in `queue.declare-ok`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub messages: usize,
    pub consumers: usize,
    pub unacked: usize,
}

#[derive(Debug)]
pub(crate) struct QueueState {
    pub(crate) def: QueueDefinition,
    pub(crate) owner: Option<u64>,
    ready: VecDeque<QueuedMessage>,
    // keyed by (channel id, delivery tag), which also orders releases by delivery order
    unacked: BTreeMap<(u64, u64), Unacked>,
    consumers: Vec<ConsumerSlot>,
    next_slot_id: u64,
    cursor: usize,
    had_consumers: bool,
    // deadline the expiry task sleeps on
    armed: Option<Instant>,
    expiry_wake: bool,
}

impl QueueState {
    pub(crate) fn new(def: QueueDefinition, owner: Option<u64>) -> QueueState {
        QueueState {
            def,
            owner,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            consumers: vec![],
            next_slot_id: 1,
            cursor: 0,
            had_consumers: false,
            armed: None,
            expiry_wake: false,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.def.name
    }

    pub(crate) fn stats(&self) -> QueueStats {
        QueueStats {
            messages: self.ready.len(),
            consumers: self.consumers.len(),
            unacked: self.unacked.len(),
        }
    }

    pub(crate) fn check_access(&self, channel_id: Option<u64>) -> Result<(), AmqpError> {
        match self.owner {
            Some(owner) if Some(owner) != channel_id => {
                Err(AmqpError::ResourceLocked(self.def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Appends a published copy at the tail.
    pub(crate) fn push(&mut self, message: Arc<Message>, now: Instant) -> Result<(), AmqpError> {
        if let Some(max) = self.def.max_length {
            if self.ready.len() >= max {
                return Err(AmqpError::QueueCapacityExceeded(self.def.name.clone()));
            }
        }

        let ttl = match (self.def.ttl, message.properties.expiration) {
            (Some(q), Some(m)) => Some(q.min(m)),
            (q, m) => q.or(m),
        };

        let expires_at = ttl.map(|ttl| now + ttl);
        self.note_deadline(expires_at);
        self.ready.push_back(QueuedMessage {
            message,
            redelivery_count: 0,
            expires_at,
        });
        Ok(())
    }

    fn requeue(&mut self, mut entry: QueuedMessage) {
        entry.redelivery_count += 1;
        self.note_deadline(entry.expires_at);
        self.ready.push_back(entry);
    }

    fn note_deadline(&mut self, at: Option<Instant>) {
        if let Some(at) = at {
            if self.armed.map_or(true, |armed| at < armed) {
                self.expiry_wake = true;
            }
        }
    }

    /// Arms the expiry timer on the earliest ready deadline and returns it.
    pub(crate) fn arm_expiry(&mut self) -> Option<Instant> {
        self.armed = self.ready.iter().filter_map(|entry| entry.expires_at).min();
        self.expiry_wake = false;
        self.armed
    }

    /// True once a message got a deadline earlier than the armed one.
    pub(crate) fn take_expiry_wake(&mut self) -> bool {
        std::mem::take(&mut self.expiry_wake)
    }

    /// Removes every expired ready message, wherever it sits in the queue.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<QueuedMessage> {
        let mut expired = vec![];
        let mut kept = VecDeque::with_capacity(self.ready.len());
        for entry in self.ready.drain(..) {
            if entry.is_expired(now) {
                expired.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.ready = kept;
        expired
    }

    /// Registers a subscription of `channel` with the channel's current prefetch.
    pub(crate) fn add_consumer(
        &mut self,
        tag: &str,
        channel: &Arc<ChannelInner>,
        prefetch: u16,
        sender: UnboundedSender<Delivery>,
    ) {
        debug!(queue = self.def.name, consumer = tag, "consumer subscribed");
        let id = self.next_slot_id;
        self.next_slot_id += 1;
        self.had_consumers = true;
        self.consumers.push(ConsumerSlot {
            id,
            tag: tag.to_owned(),
            channel_id: channel.id(),
            channel: Arc::downgrade(channel),
            prefetch,
            unacked: 0,
            sender,
        });
    }

    /// True once an auto-delete queue lost its last consumer.
    pub(crate) fn should_auto_delete(&self) -> bool {
        self.def.delete && self.had_consumers && self.consumers.is_empty()
    }

    /// Hands ready messages to consumers with spare prefetch.
    ///
    /// Expired messages found at the head are returned for dead-lettering.
    pub(crate) fn dispatch(&mut self, now: Instant) -> Vec<QueuedMessage> {
        let mut expired = vec![];

        loop {
            while self.ready.front().is_some_and(|e| e.is_expired(now)) {
                if let Some(entry) = self.ready.pop_front() {
                    expired.push(entry);
                }
            }

            if self.ready.is_empty() {
                break;
            }

            let Some(idx) = self.next_eligible() else {
                break;
            };
            let Some(entry) = self.ready.pop_front() else {
                break;
            };

            let slot = &self.consumers[idx];
            let Some(channel) = slot.channel.upgrade() else {
                self.ready.push_front(entry);
                self.disconnect(idx);
                continue;
            };

            let delivery_tag = channel.track(&self.def.name);
            let delivery = Delivery {
                delivery_tag,
                consumer_tag: slot.tag.clone(),
                queue: self.def.name.clone(),
                redelivered: entry.redelivery_count > 0,
                redelivery_count: entry.redelivery_count,
                message: entry.message.clone(),
                channel: channel.handle(),
            };

            if slot.sender.send(delivery).is_err() {
                // the receiving end is gone: the copy was never delivered
                channel.untrack(delivery_tag);
                self.ready.push_front(entry);
                self.disconnect(idx);
                continue;
            }

            let channel_id = slot.channel_id;
            let slot_id = slot.id;
            self.consumers[idx].unacked += 1;
            self.unacked
                .insert((channel_id, delivery_tag), Unacked { slot_id, entry });
            self.cursor = idx + 1;
        }

        expired
    }

    fn next_eligible(&self) -> Option<usize> {
        let n = self.consumers.len();
        (0..n)
            .map(|i| (self.cursor + i) % n)
            .find(|&idx| self.consumers[idx].has_capacity())
    }

    fn remove_slot(&mut self, idx: usize) -> ConsumerSlot {
        let slot = self.consumers.remove(idx);
        if idx < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.consumers.len() {
            self.cursor = 0;
        }
        slot
    }

    // consumer vanished without settling: everything it holds goes back to the tail
    fn disconnect(&mut self, idx: usize) {
        let slot = self.remove_slot(idx);
        let released = self.release_where(|_, unacked| unacked.slot_id == slot.id);

        if let Some(channel) = slot.channel.upgrade() {
            channel.forget_consumer(&slot.tag);
            for (_, delivery_tag) in &released {
                channel.untrack(*delivery_tag);
            }
        }

        if !released.is_empty() {
            warn!(
                queue = self.def.name,
                consumer = slot.tag,
                released = released.len(),
                "consumer disconnected, requeuing unacked deliveries"
            );
        }
    }

    fn release_where<F>(&mut self, pred: F) -> Vec<(u64, u64)>
    where
        F: Fn(&(u64, u64), &Unacked) -> bool,
    {
        let keys: Vec<(u64, u64)> = self
            .unacked
            .iter()
            .filter(|(key, unacked)| pred(*key, *unacked))
            .map(|(key, _)| *key)
            .collect();

        for key in &keys {
            if let Some(unacked) = self.unacked.remove(key) {
                self.requeue(unacked.entry);
            }
        }
        keys
    }

    /// Resolves a held delivery.
    ///
    /// Returns the entry when it must be dead-lettered.
    pub(crate) fn settle(
        &mut self,
        channel_id: u64,
        delivery_tag: u64,
        requeue: Option<bool>,
    ) -> Result<Option<QueuedMessage>, AmqpError> {
        let unacked = self
            .unacked
            .remove(&(channel_id, delivery_tag))
            .ok_or(AmqpError::UnknownDeliveryTag(delivery_tag))?;

        if let Some(slot) = self.consumers.iter_mut().find(|s| s.id == unacked.slot_id) {
            slot.unacked = slot.unacked.saturating_sub(1);
        }

        match requeue {
            None => Ok(None),
            Some(true) => {
                self.requeue(unacked.entry);
                Ok(None)
            }
            Some(false) => Ok(Some(unacked.entry)),
        }
    }

    /// Stops deliveries to a consumer. Deliveries it holds stay settleable.
    pub(crate) fn cancel(&mut self, channel_id: u64, consumer_tag: &str) -> bool {
        match self
            .consumers
            .iter()
            .position(|s| s.channel_id == channel_id && s.tag == consumer_tag)
        {
            Some(idx) => {
                self.remove_slot(idx);
                true
            }
            None => false,
        }
    }

    /// Disconnects a channel: its consumers are removed and every delivery it holds
    /// on this queue is requeued. Returns the number of requeued deliveries.
    pub(crate) fn release_channel(&mut self, channel_id: u64) -> usize {
        while let Some(idx) = self.consumers.iter().position(|s| s.channel_id == channel_id) {
            self.remove_slot(idx);
        }
        self.release_where(|key, _| key.0 == channel_id).len()
    }
}
