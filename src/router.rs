// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Routing
//!
//! Pure routing functions: given an exchange kind, its bindings and a routing key,
//! compute the ordered set of destination queues. Each queue appears at most once,
//! in the order its first matching binding was created.

use crate::{binding::Binding, exchange::ExchangeKind};

/// Computes the destination queues for `routing_key`.
pub fn route<'b>(kind: ExchangeKind, bindings: &'b [Binding], routing_key: &str) -> Vec<&'b str> {
    let mut queues: Vec<&str> = vec![];

    for binding in bindings {
        let matched = match kind {
            ExchangeKind::Direct => binding.pattern == routing_key,
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => topic_matches(&binding.pattern, routing_key),
        };

        if matched && !queues.contains(&binding.queue.as_str()) {
            queues.push(&binding.queue);
        }
    }

    queues
}

/// Matches a dot-separated routing key against a topic pattern.
///
/// `*` consumes exactly one segment and `#` consumes zero or more. An empty key is a
/// single empty segment, so `*` matches it and `order.#` does not.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    segments_match(&pattern, &key)
}

fn segments_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // consecutive hashes behave as one
            if rest.first() == Some(&"#") {
                return segments_match(rest, key);
            }
            (0..=key.len()).any(|skip| segments_match(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && segments_match(rest, &key[1..]),
        Some((literal, rest)) => key.first() == Some(literal) && segments_match(rest, &key[1..]),
    }
}
