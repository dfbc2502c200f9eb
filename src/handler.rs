// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Application-side processing of dispatched messages. A handler returning an error
//! leaves the redelivery and dead-letter decision to the dispatcher.

use async_trait::async_trait;
use opentelemetry::Context;
use std::collections::HashMap;
use thiserror::Error;

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("internal error")]
    InternalError,

    #[error("failure to process message `{0}`")]
    ProcessingError(String),
}

/// A delivery as seen by a handler.
#[derive(Debug, Clone, Default)]
pub struct ConsumerMessage {
    pub from: String,
    pub msg_type: String,
    pub data: Box<[u8]>,
    pub headers: Option<HashMap<String, String>>,
    pub redelivery_count: u32,
}

impl ConsumerMessage {
    pub fn new<T>(
        from: T,
        msg_type: T,
        data: &[u8],
        headers: Option<HashMap<String, String>>,
    ) -> Self
    where
        T: Into<String>,
    {
        ConsumerMessage {
            from: from.into(),
            msg_type: msg_type.into(),
            data: data.into(),
            headers,
            redelivery_count: 0,
        }
    }

    pub fn with_redelivery_count(mut self, count: u32) -> Self {
        self.redelivery_count = count;
        self
    }
}

#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}
