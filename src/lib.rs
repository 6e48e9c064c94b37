// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

pub mod adapter;
pub mod channel;
pub mod config;
pub mod document;
pub mod ephemeral;
pub mod executor;
pub mod logging;
pub mod middleware;
pub mod repo;
pub mod rules;
pub mod storage;
pub mod sync;
pub mod types;
pub mod wire;

pub use config::RepoConfig;
pub use document::Document;
pub use repo::{DocHandle, EphemeralHandle, Repo, RepoOptions, WaitForSync};
pub use rules::{AllowAll, FnRules, RuleContext, SyncRules};
pub use types::{ChannelKind, DocId, PeerId, PeerIdentity, PeerType, SyncError};
