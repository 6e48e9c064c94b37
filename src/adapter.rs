// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The contract every transport adapter implements, plus the shared
//! reconnection machinery.
//!
//! Adapters own their transports. The runtime neither dials nor listens; it
//! hands each adapter a context through which the adapter registers
//! channels, feeds inbound frames, and reports lifecycle changes.

pub mod memory;
pub mod tcp;

use crate::config::BackoffConfig;
use crate::repo::RuntimeHandle;
use crate::types::{AdapterId, ChannelId, ChannelKind};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;

#[async_trait]
pub trait Adapter: Send + Sync {
    fn adapter_id(&self) -> AdapterId;

    fn kind(&self) -> ChannelKind;

    /// Begin connection attempts. Must return quickly; long-running work
    /// belongs on spawned tasks.
    async fn start(&self, context: AdapterContext) -> Result<()>;

    /// Idempotent teardown.
    async fn stop(&self);
}

/// Capabilities the runtime grants an adapter.
#[derive(Clone)]
pub struct AdapterContext {
    adapter_id: AdapterId,
    kind: ChannelKind,
    runtime: RuntimeHandle,
}

impl AdapterContext {
    pub(crate) fn new(adapter_id: AdapterId, kind: ChannelKind, runtime: RuntimeHandle) -> Self {
        Self {
            adapter_id,
            kind,
            runtime,
        }
    }

    pub fn adapter_id(&self) -> &AdapterId {
        &self.adapter_id
    }

    /// Registers a usable transport with the runtime. `frames_tx` receives
    /// the encoded frames the runtime wants written out; the returned
    /// handle is how the adapter reports everything else.
    pub fn add_channel(&self, frames_tx: mpsc::Sender<Vec<u8>>, initiator: bool) -> ChannelHandle {
        let channel_id =
            self.runtime
                .add_channel(self.kind, self.adapter_id.clone(), frames_tx, initiator);
        ChannelHandle {
            channel_id,
            runtime: self.runtime.clone(),
        }
    }
}

/// An adapter's side of one registered channel.
#[derive(Clone)]
pub struct ChannelHandle {
    channel_id: ChannelId,
    runtime: RuntimeHandle,
}

impl ChannelHandle {
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// The transport is ready; the synchronizer may run its handshake.
    /// Idempotent, also used after a reconnect on the same channel.
    pub fn establish(&self) {
        self.runtime.establish(self.channel_id);
    }

    /// One frame arrived from the remote side.
    pub fn receive(&self, bytes: Vec<u8>) {
        self.runtime.receive_frame(self.channel_id, bytes);
    }

    /// The transport is gone for good.
    pub fn remove(&self) {
        self.runtime.remove_channel(self.channel_id);
    }
}

/// Transport-level lifecycle of a reconnecting client. `Ready` is distinct
/// from `Connected`: some transports only accept application traffic after
/// an explicit go-ahead from the remote side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Ready,
    Reconnecting { attempt: u32, next_ms: u64 },
    Disconnected { reason: String },
}

/// Exponential backoff with full jitter and a capped attempt budget.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The next delay to sleep before retrying, or `None` once the budget
    /// is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        let exponent = self.attempt.min(16);
        let ceiling = self
            .config
            .base
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.config.cap);
        self.attempt += 1;
        // Full jitter: anything between zero and the exponential ceiling.
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis().max(1) as u64);
        Some(Duration::from_millis(millis))
    }

    /// A successful connection resets the budget.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_respects_the_attempt_budget() {
        let mut backoff = Backoff::new(BackoffConfig {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(100),
            max_attempts: 3,
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());

        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn backoff_delays_stay_under_the_cap() {
        let mut backoff = Backoff::new(BackoffConfig {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(50),
            max_attempts: 20,
        });
        while let Some(delay) = backoff.next_delay() {
            assert!(delay <= Duration::from_millis(50));
        }
    }
}
