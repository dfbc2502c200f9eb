// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Binding Table
//!
//! Declared exchanges and their bindings. Every exchange owns its binding set behind
//! its own lock, so binds and unbinds serialize against lookups on the same exchange
//! while lookups on different exchanges proceed concurrently.
//!
//! Lock order is always the exchange map first, then an exchange's binding set.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, DEFAULT_EXCHANGE},
    router,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::debug;

/// A binding from an exchange to a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub pattern: String,
}

#[derive(Debug)]
pub(crate) struct ExchangeEntry {
    pub(crate) def: ExchangeDefinition,
    pub(crate) bindings: RwLock<Vec<Binding>>,
}

/// Exchanges and their bindings.
#[derive(Debug, Default)]
pub struct BindingTable {
    exchanges: RwLock<HashMap<String, Arc<ExchangeEntry>>>,
}

impl BindingTable {
    pub fn new() -> BindingTable {
        BindingTable::default()
    }

    /// Declares an exchange. Returns false when an identical exchange already existed.
    pub async fn declare(&self, def: &ExchangeDefinition) -> Result<bool, AmqpError> {
        if def.name == DEFAULT_EXCHANGE {
            return Err(AmqpError::DefaultExchangeAccessRefused);
        }

        let mut exchanges = self.exchanges.write().await;
        if let Some(existing) = exchanges.get(&def.name) {
            if existing.def != *def {
                return Err(AmqpError::DeclareExchangeError(def.name.clone()));
            }
            return Ok(false);
        }

        exchanges.insert(
            def.name.clone(),
            Arc::new(ExchangeEntry {
                def: def.clone(),
                bindings: RwLock::new(vec![]),
            }),
        );
        Ok(true)
    }

    pub(crate) async fn get(&self, name: &str) -> Option<Arc<ExchangeEntry>> {
        self.exchanges.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.exchanges.read().await.contains_key(name)
    }

    pub async fn kind(&self, name: &str) -> Option<ExchangeKind> {
        self.get(name).await.map(|entry| entry.def.kind)
    }

    /// Adds a binding. Binding the same triple twice is a no-op that returns false.
    pub async fn bind(&self, exchange: &str, queue: &str, pattern: &str) -> Result<bool, AmqpError> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(AmqpError::DefaultExchangeAccessRefused);
        }

        let exchanges = self.exchanges.read().await;
        let entry = exchanges
            .get(exchange)
            .ok_or_else(|| AmqpError::ExchangeNotFound(exchange.to_owned()))?;

        let binding = Binding {
            queue: queue.to_owned(),
            pattern: normalize_pattern(entry.def.kind, pattern),
        };

        let mut bindings = entry.bindings.write().await;
        if bindings.contains(&binding) {
            return Ok(false);
        }
        bindings.push(binding);
        Ok(true)
    }

    /// Removes a binding. Returns false if it did not exist.
    ///
    /// An auto-delete exchange left without bindings is deleted.
    pub async fn unbind(&self, exchange: &str, queue: &str, pattern: &str) -> Result<bool, AmqpError> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(AmqpError::DefaultExchangeAccessRefused);
        }

        let mut exchanges = self.exchanges.write().await;
        let entry = exchanges
            .get(exchange)
            .cloned()
            .ok_or_else(|| AmqpError::ExchangeNotFound(exchange.to_owned()))?;

        let pattern = normalize_pattern(entry.def.kind, pattern);
        let mut bindings = entry.bindings.write().await;
        let before = bindings.len();
        bindings.retain(|b| !(b.queue == queue && b.pattern == pattern));
        let removed = bindings.len() != before;

        if removed && bindings.is_empty() && entry.def.delete {
            debug!("auto-deleting exchange: {}", exchange);
            exchanges.remove(exchange);
        }

        Ok(removed)
    }

    /// Drops every binding that targets `queue`, in all exchanges.
    pub async fn remove_queue(&self, queue: &str) {
        let mut exchanges = self.exchanges.write().await;
        let mut emptied = vec![];

        for (name, entry) in exchanges.iter() {
            let mut bindings = entry.bindings.write().await;
            let before = bindings.len();
            bindings.retain(|b| b.queue != queue);
            if bindings.len() != before && bindings.is_empty() && entry.def.delete {
                emptied.push(name.clone());
            }
        }

        for name in emptied {
            debug!("auto-deleting exchange: {}", name);
            exchanges.remove(&name);
        }
    }

    pub async fn delete(&self, exchange: &str) -> Result<(), AmqpError> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(AmqpError::DefaultExchangeAccessRefused);
        }

        match self.exchanges.write().await.remove(exchange) {
            Some(_) => Ok(()),
            None => Err(AmqpError::ExchangeNotFound(exchange.to_owned())),
        }
    }

    /// Snapshot of an exchange's bindings.
    pub async fn bindings(&self, exchange: &str) -> Result<Vec<Binding>, AmqpError> {
        let entry = self
            .get(exchange)
            .await
            .ok_or_else(|| AmqpError::ExchangeNotFound(exchange.to_owned()))?;
        let bindings = entry.bindings.read().await;
        Ok(bindings.clone())
    }

    /// Which queues a message with `routing_key` reaching `exchange` goes to.
    pub async fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        let entry = self
            .get(exchange)
            .await
            .ok_or_else(|| AmqpError::ExchangeNotFound(exchange.to_owned()))?;

        let bindings = entry.bindings.read().await;
        Ok(router::route(entry.def.kind, &bindings, routing_key)
            .into_iter()
            .map(str::to_owned)
            .collect())
    }
}

// fanout ignores the key, so every binding to a queue is the same binding
fn normalize_pattern(kind: ExchangeKind, pattern: &str) -> String {
    match kind {
        ExchangeKind::Fanout => String::new(),
        _ => pattern.to_owned(),
    }
}
