// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology
//!
//! Declares a set of exchanges, queues and bindings in one `install` call.
//!
//! Queues declared with [`QueueDefinition::with_retry`] or
//! [`QueueDefinition::with_dlq`] get their companion queues too:
//!
//! ```text
//! orders ──nack──▶ "" / orders-retry ──ttl──▶ "" / orders
//!    └── retries exhausted ──▶ orders-dlq
//! ```
//!
//! Installing the same topology twice is a no-op.

use crate::{
    broker::Broker,
    errors::AmqpError,
    exchange::{ExchangeDefinition, DEFAULT_EXCHANGE},
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error};

#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Declares exchanges, then queues (with their retry and DLQ companions), then
    /// bindings. Stops at the first failure.
    pub async fn install(&self, broker: &Broker) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            broker.declare_exchange(exch).await?;
        }

        for def in &self.queues {
            self.install_queue(broker, def).await?;
        }

        self.binding_queues(broker).await
    }

    async fn install_queue(&self, broker: &Broker, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut main = def.clone();

        if let Some(retry_name) = &def.retry_name {
            let retry = QueueDefinition {
                name: retry_name.clone(),
                durable: def.durable,
                ttl: def.retry_ttl,
                dead_letter_exchange: Some(DEFAULT_EXCHANGE.to_owned()),
                dead_letter_routing_key: Some(def.name.clone()),
                ..Default::default()
            };
            broker.declare_queue(&retry).await.inspect_err(|err| {
                error!(error = err.to_string(), "failure to declare retry queue");
            })?;

            main.dead_letter_exchange = Some(DEFAULT_EXCHANGE.to_owned());
            main.dead_letter_routing_key = Some(retry_name.clone());
        }

        if let Some(dlq_name) = &def.dlq_name {
            let dlq = QueueDefinition {
                name: dlq_name.clone(),
                durable: def.durable,
                ..Default::default()
            };
            broker.declare_queue(&dlq).await.inspect_err(|err| {
                error!(error = err.to_string(), "failure to declare dlq");
            })?;

            if def.retry_name.is_none() {
                main.dead_letter_exchange = Some(DEFAULT_EXCHANGE.to_owned());
                main.dead_letter_routing_key = Some(dlq_name.clone());
            }
        }

        broker.declare_queue(&main).await?;
        Ok(())
    }

    async fn binding_queues(&self, broker: &Broker) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            broker.bind(binding).await.map_err(|err| match err {
                AmqpError::ExchangeNotFound(_) | AmqpError::QueueNotFound(_) => err,
                _ => AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ),
            })?;
        }

        debug!("queues were bound");

        Ok(())
    }
}
