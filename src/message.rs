// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Properties
//!
//! A published message is an immutable payload plus routing information and a set
//! of AMQP basic properties. Headers use the AMQP field-table types so that the
//! `x-death` bookkeeping matches what a RabbitMQ consumer reads.

use lapin::types::{AMQPValue, FieldArray, FieldTable, LongLongInt, LongString, ShortString};
use std::{sync::Arc, time::Duration};

/// Header carrying the dead-lettering history of a message
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Count field inside an x-death entry
pub const AMQP_HEADERS_COUNT: &str = "count";
const X_DEATH_QUEUE: &str = "queue";
const X_DEATH_REASON: &str = "reason";
const X_DEATH_EXCHANGE: &str = "exchange";
const X_DEATH_ROUTING_KEYS: &str = "routing-keys";

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    Rejected,
    Expired,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Rejected => "rejected",
            DeadLetterReason::Expired => "expired",
        }
    }
}

/// Basic properties attached to a message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub persistent: bool,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: Option<FieldTable>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub expiration: Option<Duration>,
}

impl MessageProperties {
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn with_message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    /// Per-message TTL. The effective TTL is the lower of this and the queue's.
    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Reads a string header, if present.
    pub fn header_str(&self, key: &str) -> Option<String> {
        let value = self.headers.as_ref()?.inner().get(key)?;
        match value {
            AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok().map(str::to_owned),
            AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
            _ => None,
        }
    }
}

/// An immutable published message.
///
/// Fan-out shares the same `Arc<Message>` between queue copies; dead-lettering
/// produces a new message with rewritten routing and headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Arc<[u8]>,
    pub properties: MessageProperties,
}

impl Message {
    pub fn new(exchange: &str, routing_key: &str, payload: &[u8], properties: MessageProperties) -> Self {
        Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: Arc::from(payload),
            properties,
        }
    }

    /// Count of the most recent x-death entry, 0 when never dead-lettered.
    pub fn death_count(&self) -> i64 {
        let Some(headers) = &self.properties.headers else {
            return 0;
        };

        headers
            .inner()
            .get(AMQP_HEADERS_X_DEATH)
            .and_then(|value| value.as_array())
            .and_then(|arr| arr.as_slice().first())
            .and_then(|value| value.as_field_table())
            .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
            .and_then(|value| value.as_long_long_int())
            .unwrap_or_default()
    }

    /// True when the message already expired out of `queue` and was never rejected
    /// since, which would make another expiry into `queue` a dead-letter cycle.
    pub(crate) fn expired_cycle_through(&self, queue: &str) -> bool {
        let deaths = self.deaths();
        let rejected = deaths
            .iter()
            .any(|(_, reason)| reason == DeadLetterReason::Rejected.as_str());
        !rejected
            && deaths
                .iter()
                .any(|(q, reason)| q == queue && reason == DeadLetterReason::Expired.as_str())
    }

    fn deaths(&self) -> Vec<(String, String)> {
        let Some(headers) = &self.properties.headers else {
            return vec![];
        };
        let Some(arr) = headers
            .inner()
            .get(AMQP_HEADERS_X_DEATH)
            .and_then(|v| v.as_array())
        else {
            return vec![];
        };

        arr.as_slice()
            .iter()
            .filter_map(|v| v.as_field_table())
            .map(|t| (table_str(t, X_DEATH_QUEUE), table_str(t, X_DEATH_REASON)))
            .collect()
    }

    /// Builds the copy that gets re-routed through a dead-letter exchange.
    ///
    /// The per-message expiration is dropped and the x-death entry for
    /// `(queue, reason)` is incremented (or created) and moved to the front.
    pub(crate) fn dead_lettered(
        &self,
        queue: &str,
        reason: DeadLetterReason,
        exchange: &str,
        routing_key: &str,
    ) -> Message {
        let mut headers = self.properties.headers.clone().unwrap_or_default();

        let mut entries: Vec<AMQPValue> = headers
            .inner()
            .get(AMQP_HEADERS_X_DEATH)
            .and_then(|v| v.as_array())
            .map(|arr| arr.as_slice().to_vec())
            .unwrap_or_default();

        let mut count: LongLongInt = 1;
        entries.retain(|entry| {
            let Some(table) = entry.as_field_table() else {
                return true;
            };
            let same = table_str(table, X_DEATH_QUEUE) == queue
                && table_str(table, X_DEATH_REASON) == reason.as_str();
            if same {
                count += table
                    .inner()
                    .get(AMQP_HEADERS_COUNT)
                    .and_then(|v| v.as_long_long_int())
                    .unwrap_or_default();
            }
            !same
        });

        let mut entry = FieldTable::default();
        entry.insert(
            ShortString::from(X_DEATH_QUEUE),
            AMQPValue::LongString(LongString::from(queue)),
        );
        entry.insert(
            ShortString::from(X_DEATH_REASON),
            AMQPValue::LongString(LongString::from(reason.as_str())),
        );
        entry.insert(
            ShortString::from(X_DEATH_EXCHANGE),
            AMQPValue::LongString(LongString::from(self.exchange.as_str())),
        );
        entry.insert(
            ShortString::from(X_DEATH_ROUTING_KEYS),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::LongString(
                LongString::from(self.routing_key.as_str()),
            )])),
        );
        entry.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(count),
        );
        entries.insert(0, AMQPValue::FieldTable(entry));

        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(entries)),
        );

        let mut properties = self.properties.clone();
        properties.headers = Some(headers);
        properties.expiration = None;

        Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: self.payload.clone(),
            properties,
        }
    }
}

fn table_str(table: &FieldTable, key: &str) -> String {
    match table.inner().get(key) {
        Some(AMQPValue::LongString(v)) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
        Some(AMQPValue::ShortString(v)) => v.as_str().to_owned(),
        _ => String::new(),
    }
}
