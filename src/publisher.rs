// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Application-facing publishing on top of a channel. Every message gets a JSON
//! content type, a fresh message id, its kind and the caller's trace context in the
//! headers.

use crate::{channel::Channel, errors::AmqpError, message::MessageProperties, otel};
use async_trait::async_trait;
use lapin::types::{
    AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
};
use opentelemetry::Context;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::error;
use uuid::Uuid;

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u32),
}

#[derive(Debug, Clone, Default)]
pub struct PublishMessage {
    /// Exchange name; empty for the default exchange
    pub to: String,
    pub key: Option<String>,
    pub msg_type: Option<String>,
    pub data: Box<[u8]>,
    pub headers: Option<HashMap<String, HeaderValues>>,
}

impl PublishMessage {
    /// Builds a message whose payload is `value` serialized as JSON.
    pub fn json<T>(to: &str, key: &str, msg_type: &str, value: &T) -> Result<Self, AmqpError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize message");
            AmqpError::PublishingError
        })?;

        Ok(PublishMessage {
            to: to.to_owned(),
            key: Some(key.to_owned()),
            msg_type: Some(msg_type.to_owned()),
            data: data.into_boxed_slice(),
            headers: None,
        })
    }

    pub fn with_header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.to_owned(), value);
        self
    }
}

#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError>;
}

/// Publisher backed by a broker channel.
pub struct BrokerPublisher {
    channel: Channel,
}

impl BrokerPublisher {
    pub fn new(channel: Channel) -> BrokerPublisher {
        BrokerPublisher { channel }
    }
}

#[async_trait]
impl Publisher for BrokerPublisher {
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError> {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(ctx, &mut btree);

        if let Some(headers) = &infos.headers {
            btree_map(headers, &mut btree);
        }

        let properties = MessageProperties::default()
            .with_content_type(JSON_CONTENT_TYPE)
            .with_kind(infos.msg_type.as_deref().unwrap_or_default())
            .with_message_id(&Uuid::new_v4().to_string())
            .with_headers(FieldTable::from(btree));

        match self
            .channel
            .basic_publish(
                &infos.to,
                infos.key.as_deref().unwrap_or_default(),
                &infos.data,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(err)
            }
            _ => Ok(()),
        }
    }
}

fn btree_map(hash_map: &HashMap<String, HeaderValues>, btree: &mut BTreeMap<ShortString, AMQPValue>) {
    for (key, value) in hash_map {
        let amqp_value = match value.clone() {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::Uint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        };

        btree.insert(ShortString::from(key.as_str()), amqp_value);
    }
}
