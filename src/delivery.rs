// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries
//!
//! A delivery pairs one queue copy of a message with the consumer holding it. It is
//! created `DeliveredUnacked` and resolved exactly once:
//!
//! ```text
//! DeliveredUnacked ──ack──────────────▶ Acked
//!        │──nack(requeue=true)────────▶ NackedRequeued ──▶ back to the queue tail
//!        └──nack(requeue=false)───────▶ NackedDeadLettered ──▶ dead-letter exchange
//! ```
//!
//! A consumer disconnecting moves every delivery it holds to `NackedRequeued`.

use crate::{
    channel::Channel,
    errors::AmqpError,
    message::{Message, MessageProperties},
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    DeliveredUnacked,
    Acked,
    NackedRequeued,
    NackedDeadLettered,
}

/// How a consumer resolves a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

impl Settlement {
    pub fn resulting_state(&self) -> DeliveryState {
        match self {
            Settlement::Ack => DeliveryState::Acked,
            Settlement::Nack { requeue: true } => DeliveryState::NackedRequeued,
            Settlement::Nack { requeue: false } => DeliveryState::NackedDeadLettered,
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub queue: String,
    pub redelivered: bool,
    pub redelivery_count: u32,
    pub message: Arc<Message>,
    pub(crate) channel: Channel,
}

impl Delivery {
    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.message.properties
    }

    pub fn exchange(&self) -> &str {
        &self.message.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.message.routing_key
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub async fn ack(&self) -> Result<DeliveryState, AmqpError> {
        self.channel.basic_ack(self.delivery_tag).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<DeliveryState, AmqpError> {
        self.channel.basic_nack(self.delivery_tag, requeue).await
    }
}
