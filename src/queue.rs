// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides types for defining queues and their bindings to exchanges.
//! It includes support for dead-letter exchanges, Dead Letter Queues (DLQ) and retry
//! queues, which are built from the same primitives: a message TTL and a
//! dead-letter target.

use std::time::Duration;

/// Definition of a queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// It supports standard queue options as well as message TTL, max length, dead-letter
/// exchanges, Dead Letter Queues (DLQ), and retry mechanisms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl: Option<Duration>,
    pub(crate) max_length: Option<usize>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<Duration>,
    pub(crate) retries: Option<u32>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// An empty name asks the broker to generate one (`amq.gen-<uuid>`).
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dead_letter_target(&self) -> Option<(&str, Option<&str>)> {
        self.dead_letter_exchange
            .as_deref()
            .map(|ex| (ex, self.dead_letter_routing_key.as_deref()))
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    pub fn retry_name(&self) -> Option<&str> {
        self.retry_name.as_deref()
    }

    pub fn retries(&self) -> Option<u32> {
        self.retries
    }

    /// Marks the queue durable.
    ///
    /// The flag is recorded and compared on redeclaration; nothing is persisted.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer is cancelled.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring channel.
    ///
    /// Exclusive queues are deleted when that channel closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// Expired messages are dead-lettered with reason `expired`.
    pub fn ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(Duration::from_millis(ttl));
        self
    }

    /// Sets the maximum number of ready messages the queue can hold.
    ///
    /// Publishing into a full queue is rejected.
    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Routes rejected and expired messages through the given exchange.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Replaces the original routing key of dead-lettered messages.
    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dead_letter_routing_key = Some(key.to_owned());
        self
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// The DLQ name will be the main queue name with "-dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a retry mechanism to the queue.
    ///
    /// This creates a retry queue that temporarily holds failed messages before
    /// dead-lettering them back into the main queue. The retry queue name will be the
    /// main queue name with "-retry" suffix.
    ///
    /// # Parameters
    /// * `ttl` - Time in milliseconds to wait before retrying
    /// * `retries` - Maximum number of retry attempts
    pub fn with_retry(mut self, ttl: u64, retries: u32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retries = Some(retries);
        self.retry_ttl = Some(Duration::from_millis(ttl));
        self
    }
}

/// Configuration for binding a queue to an exchange.
///
/// The routing key is an exact key for direct exchanges, a `*` / `#` pattern for
/// topic exchanges and is ignored by fanout exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
