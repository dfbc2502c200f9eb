// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request / Reply
//!
//! RPC is plain publish and consume glued together by two properties: the request
//! carries a `correlation_id` and a `reply_to` queue, and the server publishes its
//! answer to the default exchange with `reply_to` as the routing key and the same
//! correlation id.
//!
//! Each [`RpcClient`] owns a channel with an exclusive, server-named reply queue and
//! a listener task matching replies to pending calls. A call resolves exactly once:
//! either its reply or its deadline wins, decided under the pending-table lock.
//! Replies for unknown or expired calls are discarded.
//!
//! A timeout is ambiguous by nature. A lost request, a lost reply and a slow server
//! all look the same to the caller.

use crate::{
    broker::Broker,
    channel::Channel,
    delivery::Delivery,
    errors::AmqpError,
    exchange::DEFAULT_EXCHANGE,
    handler::HandlerError,
    message::{Message, MessageProperties},
    otel,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

type PendingTable = Arc<Mutex<HashMap<String, oneshot::Sender<Arc<Message>>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Removes the pending entry when the call finishes or its future is dropped.
struct PendingGuard {
    pending: PendingTable,
    correlation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.correlation_id);
    }
}

pub struct RpcClient {
    channel: Channel,
    reply_queue: String,
    pending: PendingTable,
    max_pending_calls: usize,
    default_timeout: Duration,
    discarded: Arc<AtomicU64>,
    listener: JoinHandle<()>,
}

impl RpcClient {
    /// Opens a channel, declares the reply queue and starts listening for replies.
    pub async fn new(broker: &Broker) -> Result<RpcClient, AmqpError> {
        let channel = broker.open_channel();
        channel.basic_qos(0)?;

        let reply_queue = channel
            .queue_declare(&QueueDefinition::new("").exclusive())
            .await?;
        let mut consumer = channel.basic_consume(&reply_queue, "").await?;

        let pending: PendingTable = Arc::default();
        let discarded = Arc::new(AtomicU64::new(0));

        let listener = tokio::spawn({
            let pending = pending.clone();
            let discarded = discarded.clone();
            async move {
                while let Some(reply) = consumer.recv().await {
                    resolve(&pending, &reply, &discarded);
                    if let Err(err) = reply.ack().await {
                        warn!(error = err.to_string(), "failure to ack rpc reply");
                    }
                }
                debug!("rpc reply listener stopped");
            }
        });

        debug!(reply_queue, "rpc client ready");

        Ok(RpcClient {
            channel,
            reply_queue,
            pending,
            max_pending_calls: broker.configs().max_pending_calls,
            default_timeout: broker.configs().rpc_timeout,
            discarded,
            listener,
        })
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending_calls(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Replies that arrived for no pending call, late ones included.
    pub fn discarded_replies(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Publishes `payload` and waits for the correlated reply.
    ///
    /// Dropping the returned future cancels the call; a reply arriving afterwards is
    /// discarded.
    pub async fn call(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Arc<Message>, AmqpError> {
        self.call_with_properties(exchange, routing_key, payload, MessageProperties::default(), timeout)
            .await
    }

    pub async fn call_with_properties(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
        timeout: Duration,
    ) -> Result<Arc<Message>, AmqpError> {
        if !self.channel.is_open() {
            return Err(AmqpError::ChannelClosed(self.channel.id()));
        }

        let (tx, mut rx) = oneshot::channel();
        let correlation_id = {
            let mut pending = lock(&self.pending);
            if pending.len() >= self.max_pending_calls {
                warn!(pending = pending.len(), "rpc reply table is full");
                return Err(AmqpError::ReplyTableFull(self.max_pending_calls));
            }

            let mut id = Uuid::new_v4().to_string();
            while pending.contains_key(&id) {
                id = Uuid::new_v4().to_string();
            }
            pending.insert(id.clone(), tx);
            id
        };
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            correlation_id: correlation_id.clone(),
        };

        let properties = properties
            .with_correlation_id(&correlation_id)
            .with_reply_to(&self.reply_queue);
        self.channel
            .basic_publish(exchange, routing_key, payload, properties)
            .await?;

        debug!(correlation_id, exchange, routing_key, "rpc request published");

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(AmqpError::RpcCancelled(correlation_id)),
            Err(_) => {
                // the listener sends under the same lock, so whichever side removes the
                // entry first decides the outcome
                let timed_out = lock(&self.pending).remove(&correlation_id).is_some();
                if timed_out {
                    warn!(correlation_id, "rpc call timed out");
                    return Err(AmqpError::RpcTimeout(correlation_id));
                }
                rx.try_recv()
                    .map_err(|_| AmqpError::RpcCancelled(correlation_id))
            }
        }
    }

    /// Closes the client channel, deleting the reply queue. Pending calls fail with
    /// `RpcCancelled`.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.channel.close().await?;
        let cancelled = lock(&self.pending).drain().count();
        if cancelled > 0 {
            warn!(cancelled, "rpc client closed with pending calls");
        }
        Ok(())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.listener.abort();
        if self.channel.is_open() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let channel = self.channel.clone();
                handle.spawn(async move { channel.close().await.ok() });
            }
        }
    }
}

fn resolve(pending: &PendingTable, reply: &Delivery, discarded: &AtomicU64) {
    let Some(correlation_id) = reply.properties().correlation_id.as_deref() else {
        warn!("discarding rpc reply without correlation id");
        discarded.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let mut table = lock(pending);
    match table.remove(correlation_id) {
        Some(tx) => {
            if tx.send(reply.message.clone()).is_err() {
                debug!(correlation_id, "rpc caller gone before its reply");
            }
        }
        None => {
            warn!(correlation_id, "discarding rpc reply for an unknown call");
            discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Computes the reply to one request.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, request: &[u8]) -> Result<Vec<u8>, HandlerError>;
}

/// Serves requests from a queue with an [`RpcHandler`].
///
/// Requests are processed concurrently up to the channel prefetch. A handler error
/// rejects the request without requeue, sending it to the queue's dead-letter
/// exchange if it has one; the caller then times out.
pub struct RpcServer {
    channel: Channel,
    queue: String,
    handler: Arc<dyn RpcHandler>,
}

impl RpcServer {
    pub fn new(channel: Channel, queue: &str, handler: Arc<dyn RpcHandler>) -> RpcServer {
        RpcServer {
            channel,
            queue: queue.to_owned(),
            handler,
        }
    }

    /// Serves until the channel closes or the queue is deleted.
    pub async fn serve(&self) -> Result<(), AmqpError> {
        let mut consumer = self.channel.basic_consume(&self.queue, "").await?;
        debug!(queue = self.queue, "rpc server consuming");

        let mut in_flight = vec![];
        while let Some(request) = consumer.recv().await {
            let handler = self.handler.clone();
            in_flight.push(tokio::spawn(async move {
                let tracer = global::tracer("amqp rpc server");
                if let Err(err) = serve_request(&tracer, handler.as_ref(), &request).await {
                    error!(error = err.to_string(), "failure to serve rpc request");
                }
            }));
            in_flight.retain(|task| !task.is_finished());
        }

        futures_util::future::join_all(in_flight).await;
        Ok(())
    }
}

async fn serve_request(
    tracer: &BoxedTracer,
    handler: &dyn RpcHandler,
    request: &Delivery,
) -> Result<(), AmqpError> {
    let (ctx, mut span) = otel::new_span(request.properties(), tracer, "rpc request");

    let (Some(reply_to), Some(correlation_id)) = (
        request.properties().reply_to.clone(),
        request.properties().correlation_id.clone(),
    ) else {
        warn!("rpc request without reply_to or correlation_id, dropping");
        request.ack().await?;
        return Ok(());
    };

    match handler.exec(&ctx, request.payload()).await {
        Ok(response) => {
            request
                .channel()
                .basic_publish(
                    DEFAULT_EXCHANGE,
                    &reply_to,
                    &response,
                    MessageProperties::default().with_correlation_id(&correlation_id),
                )
                .await?;
            debug!(correlation_id, reply_to, "rpc reply published");
            span.set_status(Status::Ok);
            request.ack().await?;
        }
        Err(err) => {
            error!(error = err.to_string(), correlation_id, "rpc handler failed");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("rpc handler failed"),
            });
            request.nack(false).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::BrokerConfigs;

    async fn broker_with_server(handler: MockRpcHandler) -> Broker {
        let broker = Broker::default();
        broker
            .declare_queue(&QueueDefinition::new("rpc.echo"))
            .await
            .unwrap();

        let server = RpcServer::new(broker.open_channel(), "rpc.echo", Arc::new(handler));
        tokio::spawn(async move { server.serve().await });
        broker
    }

    fn echo() -> MockRpcHandler {
        let mut handler = MockRpcHandler::new();
        handler.expect_exec().returning(|_, req| Ok(req.to_vec()));
        handler
    }

    #[tokio::test]
    async fn round_trip() {
        let broker = broker_with_server(echo()).await;
        let client = RpcClient::new(&broker).await.unwrap();

        let reply = client
            .call("", "rpc.echo", b"ping", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(&*reply.payload, b"ping");
        assert!(reply.properties.correlation_id.is_some());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_get_their_own_replies() {
        let broker = broker_with_server(echo()).await;
        let client = RpcClient::new(&broker).await.unwrap();

        let calls = (0..16).map(|i| {
            let client = &client;
            async move {
                let body = format!("req-{}", i);
                let reply = client
                    .call("", "rpc.echo", body.as_bytes(), Duration::from_secs(5))
                    .await
                    .unwrap();
                (body, String::from_utf8(reply.payload.to_vec()).unwrap())
            }
        });

        for (sent, received) in futures_util::future::join_all(calls).await {
            assert_eq!(sent, received);
        }
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_discarded() {
        let broker = Broker::default();
        broker
            .declare_queue(&QueueDefinition::new("rpc.slow"))
            .await
            .unwrap();
        let client = RpcClient::new(&broker).await.unwrap();

        let result = client
            .call("", "rpc.slow", b"ping", Duration::from_millis(100))
            .await;
        let Err(AmqpError::RpcTimeout(correlation_id)) = result else {
            panic!("expected a timeout, got {:?}", result);
        };
        assert_eq!(client.pending_calls(), 0);

        // the server answers after the deadline
        let server = broker.open_channel();
        let mut requests = server.basic_consume("rpc.slow", "").await.unwrap();
        let request = requests.recv().await.unwrap();
        assert_eq!(
            request.properties().correlation_id.as_deref(),
            Some(correlation_id.as_str())
        );
        server
            .basic_publish(
                "",
                client.reply_queue(),
                b"pong",
                MessageProperties::default().with_correlation_id(&correlation_id),
            )
            .await
            .unwrap();
        request.ack().await.unwrap();

        for _ in 0..100 {
            if client.discarded_replies() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(client.discarded_replies(), 1);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn dropped_call_removes_its_pending_entry() {
        let broker = Broker::default();
        broker
            .declare_queue(&QueueDefinition::new("rpc.void"))
            .await
            .unwrap();
        let client = RpcClient::new(&broker).await.unwrap();

        let call = client.call("", "rpc.void", b"ping", Duration::from_secs(60));
        let mut call = Box::pin(call);
        assert!(futures_util::poll!(call.as_mut()).is_pending());
        assert_eq!(client.pending_calls(), 1);

        drop(call);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn reply_table_capacity_is_enforced() {
        let broker = Broker::new(BrokerConfigs {
            max_pending_calls: 1,
            ..Default::default()
        });
        broker
            .declare_queue(&QueueDefinition::new("rpc.void"))
            .await
            .unwrap();
        let client = RpcClient::new(&broker).await.unwrap();

        let mut first = Box::pin(client.call("", "rpc.void", b"1", Duration::from_secs(60)));
        assert!(futures_util::poll!(first.as_mut()).is_pending());

        assert_eq!(
            client
                .call("", "rpc.void", b"2", Duration::from_secs(60))
                .await,
            Err(AmqpError::ReplyTableFull(1))
        );
    }

    #[tokio::test]
    async fn close_cancels_pending_calls_and_deletes_reply_queue() {
        let broker = Broker::default();
        broker
            .declare_queue(&QueueDefinition::new("rpc.void"))
            .await
            .unwrap();
        let client = RpcClient::new(&broker).await.unwrap();
        let reply_queue = client.reply_queue().to_owned();

        let mut call = Box::pin(client.call("", "rpc.void", b"1", Duration::from_secs(60)));
        assert!(futures_util::poll!(call.as_mut()).is_pending());

        client.close().await.unwrap();
        assert!(matches!(call.await, Err(AmqpError::RpcCancelled(_))));
        assert!(!broker.queue_exists(&reply_queue).await);
    }

    #[tokio::test]
    async fn failed_handler_rejects_the_request() {
        let mut handler = MockRpcHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(HandlerError::InternalError));
        let broker = broker_with_server(handler).await;
        let client = RpcClient::new(&broker).await.unwrap();

        let result = client
            .call("", "rpc.echo", b"ping", Duration::from_millis(200))
            .await;

        assert!(matches!(result, Err(AmqpError::RpcTimeout(_))));
        assert_eq!(broker.queue_stats("rpc.echo").await.unwrap().messages, 0);
    }
}
