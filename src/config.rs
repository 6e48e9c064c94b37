// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Runtime knobs. All of these have defaults that work for interactive use;
//! tests shrink the time-based ones.

use crate::wire::{DEFAULT_FRAGMENT_THRESHOLD, DEFAULT_REASSEMBLY_TIMEOUT};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RepoConfig {
    /// Serialized batches above this size are fragmented for transport.
    pub fragment_threshold: usize,
    /// How long a partial fragment set may wait for its missing pieces.
    pub reassembly_timeout: Duration,
    /// Cadence of the internal heartbeat, which drives presence eviction,
    /// reassembly purging and wire-level keepalives.
    pub heartbeat_interval: Duration,
    /// Presence entries from peers not heard of for this long are evicted.
    pub ephemeral_stale_window: Duration,
    /// How many times an ephemeral message may be relayed onward.
    pub ephemeral_hop_limit: u8,
    /// How many incremental blobs a stored document may accumulate before
    /// the storage peer compacts them into a fresh snapshot.
    pub storage_compaction_threshold: usize,
    pub reconnect: BackoffConfig,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            fragment_threshold: DEFAULT_FRAGMENT_THRESHOLD,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            heartbeat_interval: Duration::from_secs(10),
            ephemeral_stale_window: Duration::from_secs(30),
            ephemeral_hop_limit: 2,
            storage_compaction_threshold: 64,
            reconnect: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff with full jitter, as used by reconnecting adapters.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}
