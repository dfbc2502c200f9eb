// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Subscribes to the registered queues and hands every delivery to the handler
//! registered for its message kind. One consumer task runs per queue, all on the
//! dispatcher's channel, so the channel prefetch bounds the work in flight.

use crate::{
    channel::Channel,
    consumer::consume,
    errors::AmqpError,
    handler::ConsumerHandler,
    queue::QueueDefinition,
};
use futures_util::{future::join_all, StreamExt};
use opentelemetry::global;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error};

/// Handlers are looked up by (queue, message kind).
pub(crate) type DispatcherKey = (String, String);

/// Associates a queue with the handler of one message kind.
#[derive(Clone)]
pub(crate) struct DispatcherDefinition {
    pub(crate) queue_def: QueueDefinition,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

/// Identifies which messages a handler receives.
#[derive(Debug, Clone)]
pub struct DispatcherRoute {
    pub queue: String,
    pub msg_type: String,
}

impl DispatcherRoute {
    pub fn new(queue: &str, msg_type: &str) -> DispatcherRoute {
        DispatcherRoute {
            queue: queue.to_owned(),
            msg_type: msg_type.to_owned(),
        }
    }
}

pub struct Dispatcher {
    channel: Channel,
    queues_def: Vec<QueueDefinition>,
    max_redeliveries: u32,
    pub(crate) dispatchers_def: HashMap<DispatcherKey, DispatcherDefinition>,
}

impl Dispatcher {
    /// Creates a dispatcher consuming on `channel`.
    ///
    /// `queues_def` are the definitions the queues were installed with; their retry
    /// and DLQ settings drive failure handling.
    pub fn new(channel: Channel, queues_def: Vec<QueueDefinition>) -> Self {
        let max_redeliveries = channel.broker().configs().max_redeliveries;
        Dispatcher {
            channel,
            queues_def,
            max_redeliveries,
            dispatchers_def: HashMap::default(),
        }
    }

    pub fn max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }

    pub fn register(mut self, route: &DispatcherRoute, handler: Arc<dyn ConsumerHandler>) -> Self {
        let queue_def = self
            .queues_def
            .iter()
            .find(|def| def.name() == route.queue)
            .cloned()
            .unwrap_or_else(|| QueueDefinition::new(&route.queue));

        self.dispatchers_def.insert(
            (route.queue.clone(), route.msg_type.clone()),
            DispatcherDefinition { queue_def, handler },
        );

        self
    }

    /// Consumes every registered queue until their consumers end.
    ///
    /// Consumers end when the dispatcher's channel is closed or a queue is deleted.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        let mut queues: Vec<&str> = self
            .dispatchers_def
            .values()
            .map(|def| def.queue_def.name())
            .collect();
        queues.sort_unstable();
        queues.dedup();

        let mut spawns = vec![];
        for queue in queues {
            let mut consumer = match self.channel.basic_consume(queue, "").await {
                Err(err) => {
                    error!(error = err.to_string(), queue, "failure to create the consumer");
                    Err(err)
                }
                Ok(c) => Ok(c),
            }?;
            debug!(queue, consumer = consumer.tag(), "dispatcher consuming");

            let defs = self.dispatchers_def.clone();
            let max_redeliveries = self.max_redeliveries;

            spawns.push(tokio::spawn(async move {
                let tracer = global::tracer("amqp consumer");
                while let Some(delivery) = consumer.next().await {
                    if let Err(err) = consume(&tracer, &delivery, &defs, max_redeliveries).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
            }));
        }

        let spawned = join_all(spawns).await;
        for res in spawned {
            if res.is_err() {
                error!("tokio process error");
                return Err(AmqpError::InternalError);
            }
        }

        Ok(())
    }
}
