// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pre-delivery hooks for inbound messages. The chain runs in order and the
//! first rejection wins; rejected messages are dropped silently towards the
//! peer and only show up in logs and counters.

use crate::types::{DocId, PeerId, PeerIdentity};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

/// Which parts of the context a middleware needs. Declaring facets keeps
/// cheap middlewares cheap: the chain only assembles what somebody asked
/// for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Facets {
    pub peer: bool,
    pub document: bool,
    pub transmission: bool,
}

#[derive(Debug, Default)]
pub struct MiddlewareContext<'a> {
    pub peer: Option<&'a PeerIdentity>,
    pub doc_id: Option<&'a DocId>,
    pub message_type: &'static str,
    pub payload_len: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub allow: bool,
    pub reason: Option<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
        }
    }
}

pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn required_facets(&self) -> Facets {
        Facets::default()
    }

    fn check(&self, ctx: &MiddlewareContext) -> Verdict;
}

/// An ordered chain of middlewares. Empty by default.
#[derive(Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Box<dyn Middleware>>,
    rejected: AtomicU64,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Box<dyn Middleware>>) -> Self {
        Self {
            middlewares,
            rejected: AtomicU64::new(0),
        }
    }

    /// The union of all facets any middleware asked for.
    pub fn facets(&self) -> Facets {
        let mut facets = Facets::default();
        for middleware in &self.middlewares {
            let wanted = middleware.required_facets();
            facets.peer |= wanted.peer;
            facets.document |= wanted.document;
            facets.transmission |= wanted.transmission;
        }
        facets
    }

    /// Runs the chain; the first rejection short-circuits.
    pub fn check(&self, ctx: &MiddlewareContext) -> Verdict {
        for middleware in &self.middlewares {
            let verdict = middleware.check(ctx);
            if !verdict.allow {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(
                    middleware = middleware.name(),
                    message_type = ctx.message_type,
                    reason = verdict.reason.as_deref().unwrap_or(""),
                    "Middleware rejected inbound message"
                );
                return verdict;
            }
        }
        Verdict::allow()
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per `(peer, message type)`. A message type filter restricts
/// the limiter to one kind of traffic; without it, everything is counted.
pub struct RateLimit {
    per_second: f64,
    burst: f64,
    message_type: Option<&'static str>,
    buckets: Mutex<HashMap<(PeerId, &'static str), Bucket>>,
}

impl RateLimit {
    pub fn new(per_second: f64, burst: f64) -> Self {
        Self {
            per_second,
            burst,
            message_type: None,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_message_type(message_type: &'static str, per_second: f64, burst: f64) -> Self {
        Self {
            per_second,
            burst,
            message_type: Some(message_type),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn try_take(&self, peer_id: &PeerId, message_type: &'static str) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limit lock poisoned");
        let bucket = buckets
            .entry((peer_id.clone(), message_type))
            .or_insert_with(|| Bucket {
                tokens: self.burst,
                last_refill: Instant::now(),
            });

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Middleware for RateLimit {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn required_facets(&self) -> Facets {
        Facets {
            peer: true,
            ..Facets::default()
        }
    }

    fn check(&self, ctx: &MiddlewareContext) -> Verdict {
        if self
            .message_type
            .is_some_and(|filter| filter != ctx.message_type)
        {
            return Verdict::allow();
        }
        // Without an established peer there is nothing to key the bucket by.
        let Some(peer) = ctx.peer else {
            return Verdict::allow();
        };
        if self.try_take(&peer.peer_id, ctx.message_type) {
            Verdict::allow()
        } else {
            Verdict::deny(format!(
                "rate limit exceeded for {} from {}",
                ctx.message_type, peer.peer_id
            ))
        }
    }
}

/// Rejects messages whose document payload exceeds a byte limit.
pub struct SizeLimit {
    max_bytes: usize,
}

impl SizeLimit {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl Middleware for SizeLimit {
    fn name(&self) -> &'static str {
        "size-limit"
    }

    fn required_facets(&self) -> Facets {
        Facets {
            transmission: true,
            ..Facets::default()
        }
    }

    fn check(&self, ctx: &MiddlewareContext) -> Verdict {
        if ctx.payload_len > self.max_bytes {
            Verdict::deny(format!(
                "payload of {} bytes exceeds limit of {}",
                ctx.payload_len, self.max_bytes
            ))
        } else {
            Verdict::allow()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::factories::user_identity;
    use pretty_assertions::assert_eq;

    fn context<'a>(peer: &'a PeerIdentity, payload_len: usize) -> MiddlewareContext<'a> {
        MiddlewareContext {
            peer: Some(peer),
            doc_id: None,
            message_type: "sync-response",
            payload_len,
        }
    }

    #[test]
    fn empty_chain_allows() {
        let chain = MiddlewareChain::default();
        let verdict = chain.check(&MiddlewareContext::default());
        assert!(verdict.allow);
    }

    #[test]
    fn first_rejection_short_circuits() {
        struct Deny;
        impl Middleware for Deny {
            fn name(&self) -> &'static str {
                "deny"
            }
            fn check(&self, _ctx: &MiddlewareContext) -> Verdict {
                Verdict::deny("no")
            }
        }
        struct Panic;
        impl Middleware for Panic {
            fn name(&self) -> &'static str {
                "panic"
            }
            fn check(&self, _ctx: &MiddlewareContext) -> Verdict {
                panic!("must not be reached after a rejection");
            }
        }

        let chain = MiddlewareChain::new(vec![Box::new(Deny), Box::new(Panic)]);
        let verdict = chain.check(&MiddlewareContext::default());
        assert!(!verdict.allow);
        assert_eq!(chain.rejected_count(), 1);
    }

    #[test]
    fn rate_limit_caps_burst_and_refills() {
        let limit = RateLimit::for_message_type("sync-response", 1000.0, 2.0);
        let peer = user_identity("alice");

        assert!(limit.check(&context(&peer, 0)).allow);
        assert!(limit.check(&context(&peer, 0)).allow);
        assert!(!limit.check(&context(&peer, 0)).allow);

        // A generous refill rate makes the bucket recover quickly.
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(limit.check(&context(&peer, 0)).allow);
    }

    #[test]
    fn rate_limit_is_per_peer() {
        let limit = RateLimit::new(0.000_1, 1.0);
        let alice = user_identity("alice");
        let bob = user_identity("bob");

        assert!(limit.check(&context(&alice, 0)).allow);
        assert!(!limit.check(&context(&alice, 0)).allow);
        assert!(limit.check(&context(&bob, 0)).allow);
    }

    #[test]
    fn rate_limit_ignores_other_message_types() {
        let limit = RateLimit::for_message_type("ephemeral", 0.000_1, 1.0);
        let peer = user_identity("alice");
        for _ in 0..5 {
            assert!(limit.check(&context(&peer, 0)).allow);
        }
    }

    #[test]
    fn size_limit_rejects_large_payloads() {
        let limit = SizeLimit::new(1024);
        let peer = user_identity("alice");
        assert!(limit.check(&context(&peer, 1024)).allow);
        assert!(!limit.check(&context(&peer, 1025)).allow);
    }

    #[test]
    fn chain_unions_facets() {
        let chain = MiddlewareChain::new(vec![
            Box::new(RateLimit::new(1.0, 1.0)),
            Box::new(SizeLimit::new(10)),
        ]);
        let facets = chain.facets();
        assert!(facets.peer);
        assert!(facets.transmission);
        assert!(!facets.document);
    }
}
