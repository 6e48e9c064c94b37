// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Application-defined access rules. Evaluated synchronously by the
//! synchronizer before anything document-shaped crosses a network channel.

use crate::document::Document;
use crate::types::{ChannelId, DocId, LoadState};
use std::sync::Arc;

/// A channel's opinion of whether the remote peer is tracking a document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Awareness {
    #[default]
    Unknown,
    HasDoc,
    NoDoc,
}

/// Snapshot of the per-(doc, channel) state a rule may want to look at.
#[derive(Clone, Copy, Debug)]
pub struct DocChannelSnapshot {
    pub awareness: Awareness,
    pub load: LoadState,
}

/// Everything a rule gets to see. Rules must be deterministic within a
/// session; the synchronizer caches nothing and re-evaluates freely.
pub struct RuleContext<'a> {
    pub peer_name: &'a str,
    pub channel_id: ChannelId,
    pub doc_id: &'a DocId,
    pub doc: &'a Arc<Document>,
    pub doc_channel_state: DocChannelSnapshot,
}

/// The three gates. Defaults allow everything, and storage channels are
/// never asked: they always pass.
pub trait SyncRules: Send + Sync {
    /// May this document's existence be announced to this channel?
    fn can_reveal(&self, _ctx: &RuleContext) -> bool {
        true
    }

    /// May document ops flow to this channel?
    fn can_update(&self, _ctx: &RuleContext) -> bool {
        true
    }

    /// May this channel cause local deletion of the document?
    fn can_delete(&self, _ctx: &RuleContext) -> bool {
        true
    }
}

/// The default rule set.
pub struct AllowAll;

impl SyncRules for AllowAll {}

/// Rule set built from closures, mostly useful in tests and small setups.
pub struct FnRules {
    pub reveal: Box<dyn Fn(&RuleContext) -> bool + Send + Sync>,
    pub update: Box<dyn Fn(&RuleContext) -> bool + Send + Sync>,
    pub delete: Box<dyn Fn(&RuleContext) -> bool + Send + Sync>,
}

impl Default for FnRules {
    fn default() -> Self {
        Self {
            reveal: Box::new(|_| true),
            update: Box::new(|_| true),
            delete: Box::new(|_| true),
        }
    }
}

impl FnRules {
    pub fn with_reveal(f: impl Fn(&RuleContext) -> bool + Send + Sync + 'static) -> Self {
        Self {
            reveal: Box::new(f),
            ..Self::default()
        }
    }

    pub fn with_update(f: impl Fn(&RuleContext) -> bool + Send + Sync + 'static) -> Self {
        Self {
            update: Box::new(f),
            ..Self::default()
        }
    }
}

impl SyncRules for FnRules {
    fn can_reveal(&self, ctx: &RuleContext) -> bool {
        (self.reveal)(ctx)
    }

    fn can_update(&self, ctx: &RuleContext) -> bool {
        (self.update)(ctx)
    }

    fn can_delete(&self, ctx: &RuleContext) -> bool {
        (self.delete)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(doc_id: &'a DocId, doc: &'a Arc<Document>) -> RuleContext<'a> {
        RuleContext {
            peer_name: "test-peer",
            channel_id: ChannelId::next(),
            doc_id,
            doc,
            doc_channel_state: DocChannelSnapshot {
                awareness: Awareness::Unknown,
                load: LoadState::Loading,
            },
        }
    }

    #[test]
    fn allow_all_allows_everything() {
        let doc_id = DocId::new("doc");
        let doc = Arc::new(Document::new());
        let ctx = context(&doc_id, &doc);
        assert!(AllowAll.can_reveal(&ctx));
        assert!(AllowAll.can_update(&ctx));
        assert!(AllowAll.can_delete(&ctx));
    }

    #[test]
    fn fn_rules_gate_on_doc_id() {
        let rules = FnRules::with_reveal(|ctx| ctx.doc_id.as_str() != "secret");

        let public_id = DocId::new("public");
        let secret_id = DocId::new("secret");
        let doc = Arc::new(Document::new());
        assert!(rules.can_reveal(&context(&public_id, &doc)));
        assert!(!rules.can_reveal(&context(&secret_id, &doc)));
        // Updates stay open: a denied reveal does not block direct requests.
        assert!(rules.can_update(&context(&secret_id, &doc)));
    }
}
