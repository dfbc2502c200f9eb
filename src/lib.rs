// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Embedded AMQP Broker
//!
//! An in-process message broker with AMQP 0-9-1 semantics: exchanges route published
//! messages to queues through bindings, queues hand messages to consumers with
//! prefetch-bounded fair dispatch, deliveries are acked, requeued or dead-lettered,
//! and request/reply is built on correlation ids and exclusive reply queues.
//!
//! ```text
//! publish ──▶ exchange ──bindings──▶ queue ──dispatch──▶ consumer
//!                                      ▲                    │
//!                                      └──── nack(requeue) ─┤
//!                      dead-letter exchange ◀── nack ───────┘
//! ```

mod consumer;
mod otel;
mod queue_state;

pub mod binding;
pub mod broker;
pub mod channel;
pub mod configs;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod router;
pub mod rpc;
pub mod topology;

pub use broker::Broker;
pub use channel::{Channel, Consumer};
pub use delivery::{Delivery, DeliveryState};
pub use errors::{AmqpError, ErrorKind};
pub use queue_state::QueueStats;

#[cfg(any(test, feature = "mocks"))]
pub use handler::MockConsumerHandler;
#[cfg(any(test, feature = "mocks"))]
pub use publisher::MockPublisher;
#[cfg(any(test, feature = "mocks"))]
pub use rpc::MockRpcHandler;
