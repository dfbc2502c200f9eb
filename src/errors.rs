// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Embedded Broker
//!
//! This module provides the error type shared by every broker operation.
//! The `AmqpError` enum covers administrative failures (undeclared or conflicting
//! exchanges and queues), delivery lifecycle anomalies (unknown delivery tags),
//! capacity limits and RPC outcomes.

use thiserror::Error;

/// Broad classification of an [`AmqpError`].
///
/// Routing and capacity errors are reported synchronously to the invoking call.
/// Delivery errors only concern the delivery they name and never affect other
/// in-flight deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Routing,
    Delivery,
    Capacity,
    Rpc,
    Internal,
}

/// Represents errors that can occur while operating the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Publishing or binding against an exchange that was never declared
    #[error("exchange `{0}` not declared")]
    ExchangeNotFound(String),

    /// Operating on a queue that was never declared (or was deleted)
    #[error("queue `{0}` not declared")]
    QueueNotFound(String),

    /// Redeclaring an exchange with a different kind or flags
    #[error("failure to declare an exchange `{0}`: conflicts with the existing declaration")]
    DeclareExchangeError(String),

    /// Redeclaring a queue with different arguments
    #[error("failure to declare a queue `{0}`: conflicts with the existing declaration")]
    DeclareQueueError(String),

    /// The default exchange cannot be declared, bound or deleted
    #[error("operation not permitted on the default exchange")]
    DefaultExchangeAccessRefused,

    /// Publishing directly to an internal exchange
    #[error("exchange `{0}` is internal")]
    InternalExchangePublish(String),

    /// Exclusive queue used by a channel other than its owner
    #[error("queue `{0}` is exclusive to another channel")]
    ResourceLocked(String),

    /// Exclusive queues must be declared through a channel
    #[error("exclusive queue `{0}` declared without an owning channel")]
    ExclusiveQueueWithoutOwner(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Ack or nack of a tag that is unknown or already resolved
    #[error("unknown delivery tag `{0}`")]
    UnknownDeliveryTag(u64),

    /// Cancel of a consumer tag unknown to the channel
    #[error("unknown consumer `{0}`")]
    UnknownConsumer(String),

    /// The channel was closed before the operation
    #[error("channel `{0}` is closed")]
    ChannelClosed(u64),

    /// Publishing into a queue that reached its max length
    #[error("queue `{0}` is at capacity")]
    QueueCapacityExceeded(String),

    /// Too many RPC calls pending on one client
    #[error("rpc reply table is at capacity ({0} pending calls)")]
    ReplyTableFull(usize),

    /// No reply arrived before the deadline.
    ///
    /// The protocol cannot tell a lost request, a lost reply and a slow server apart.
    #[error("rpc call `{0}` timed out")]
    RpcTimeout(String),

    /// The RPC client was closed while the call was pending
    #[error("rpc call `{0}` was cancelled")]
    RpcCancelled(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Returns the taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmqpError::ExchangeNotFound(_)
            | AmqpError::QueueNotFound(_)
            | AmqpError::DeclareExchangeError(_)
            | AmqpError::DeclareQueueError(_)
            | AmqpError::DefaultExchangeAccessRefused
            | AmqpError::InternalExchangePublish(_)
            | AmqpError::ResourceLocked(_)
            | AmqpError::ExclusiveQueueWithoutOwner(_)
            | AmqpError::BindingExchangeToQueueError(_, _) => ErrorKind::Routing,
            AmqpError::UnknownDeliveryTag(_)
            | AmqpError::UnknownConsumer(_)
            | AmqpError::ChannelClosed(_)
            | AmqpError::ConsumerError(_) => ErrorKind::Delivery,
            AmqpError::QueueCapacityExceeded(_) | AmqpError::ReplyTableFull(_) => {
                ErrorKind::Capacity
            }
            AmqpError::RpcTimeout(_) | AmqpError::RpcCancelled(_) => ErrorKind::Rpc,
            AmqpError::InternalError | AmqpError::PublishingError => ErrorKind::Internal,
        }
    }
}
