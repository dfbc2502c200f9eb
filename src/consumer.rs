// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! Runs one delivery through its registered handler and settles it. On handler
//! failure the delivery is either sent through a retry queue, requeued, or moved to
//! the dead-letter path, depending on how its queue was declared.

use crate::{
    delivery::Delivery,
    dispatcher::{DispatcherDefinition, DispatcherKey},
    errors::AmqpError,
    handler::ConsumerMessage,
    message::MessageProperties,
    otel,
};
use lapin::types::AMQPValue;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::HashMap};
use tracing::{debug, error, warn};

/// Processes `delivery` with the handler registered for its kind.
///
/// 1. kinds without a handler on the delivery's queue are acked and dropped
/// 2. handler success acks
/// 3. queues declared with a retry queue nack into it until `retries` is reached,
///    then the message is published to the DLQ and acked
/// 4. other queues requeue until `max_redeliveries`, then nack to the dead-letter
///    exchange (or drop when there is none)
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    defs: &HashMap<DispatcherKey, DispatcherDefinition>,
    max_redeliveries: u32,
) -> Result<(), AmqpError> {
    let msg_type = delivery.properties().kind.clone().unwrap_or_default();
    let count = delivery.message.death_count();

    let (ctx, mut span) = otel::new_span(delivery.properties(), tracer, &msg_type);

    debug!(
        "received: {} - exchange: {} - queue: {}",
        msg_type,
        delivery.exchange(),
        delivery.queue,
    );

    let Some(dispatcher_def) = defs.get(&(delivery.queue.clone(), msg_type.clone())) else {
        let msg = "removing message from queue - reason: unsupported msg type";
        span.record_error(&AmqpError::ConsumerError(msg.to_string()));
        span.set_status(Status::Error {
            description: Cow::from(msg),
        });

        debug!("{}", msg);

        if let Err(e) = delivery.ack().await {
            error!(error = e.to_string(), "error whiling ack msg");
            span.record_error(&e);
        }

        return Ok(());
    };

    let msg = ConsumerMessage::new(
        dispatcher_def.queue_def.name(),
        &msg_type,
        delivery.payload(),
        string_headers(delivery.properties()),
    )
    .with_redelivery_count(delivery.redelivery_count);

    let result = dispatcher_def.handler.exec(&ctx, &msg).await;
    if result.is_ok() {
        debug!("message successfully processed");
        return match delivery.ack().await {
            Err(e) => {
                error!(error = e.to_string(), "error whiling ack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(e)
            }
            _ => {
                span.set_status(Status::Ok);
                Ok(())
            }
        };
    }

    if let Err(err) = &result {
        span.record_error(err);
    }

    let queue_def = &dispatcher_def.queue_def;
    let (Some(retries), Some(dlq_name)) = (queue_def.retries(), queue_def.dlq_name()) else {
        if delivery.redelivery_count < max_redeliveries {
            warn!(
                redelivery_count = delivery.redelivery_count,
                "error whiling handling msg, requeuing"
            );
            return settle_or_record(delivery.nack(true).await, &mut span, "error to requeue msg");
        }

        error!(
            redelivery_count = delivery.redelivery_count,
            "too many redeliveries, dead-lettering"
        );
        return settle_or_record(delivery.nack(false).await, &mut span, "error to nack msg");
    };

    // nacking sends the message through the retry queue, which dead-letters it back
    if count < retries as i64 {
        warn!(count, "error whiling handling msg, sending to retry");
        return settle_or_record(delivery.nack(false).await, &mut span, "error to requeuing msg");
    }

    error!(count, "too many attempts, sending to dlq");

    if let Err(e) = delivery
        .channel()
        .basic_publish(
            "",
            dlq_name,
            delivery.payload(),
            delivery.properties().clone(),
        )
        .await
    {
        error!(error = e.to_string(), "error whiling sending to dlq");
        span.record_error(&e);
        span.set_status(Status::Error {
            description: Cow::from("failure to send msg to dlq"),
        });
        return Err(AmqpError::PublishingError);
    }

    settle_or_record(delivery.ack().await, &mut span, "error to ack msg")
}

fn settle_or_record<T>(
    result: Result<T, AmqpError>,
    span: &mut impl Span,
    description: &'static str,
) -> Result<(), AmqpError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(error = e.to_string(), "{}", description);
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from(description),
            });
            Err(e)
        }
    }
}

fn string_headers(props: &MessageProperties) -> Option<HashMap<String, String>> {
    let headers = props.headers.as_ref()?;

    let map = headers
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => String::from_utf8(v.as_bytes().to_vec()).ok()?,
                AMQPValue::ShortString(v) => v.as_str().to_owned(),
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect();

    Some(map)
}
