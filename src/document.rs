// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use loro::{ExportMode, LoroDoc, Subscription, VersionVector};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

/// Encapsulates the Loro document and provides a generic interface, s.t. we
/// don't need to worry about CRDT internals elsewhere.
///
/// The synchronizer only ever uses this surface: version vectors, binary
/// export in snapshot and update mode, binary import, and a subscription for
/// local changes. Everything content-shaped stays with the application,
/// which mutates the inner `LoroDoc` through a handle.
pub struct Document {
    doc: LoroDoc,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("version", &self.version())
            .finish()
    }
}

impl Document {
    pub fn new() -> Self {
        Self { doc: LoroDoc::new() }
    }

    /// Restores a document from a snapshot or update blob.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let document = Self::new();
        document.import(bytes)?;
        Ok(document)
    }

    /// The op-level version of everything this document has ever seen.
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    pub fn encoded_version(&self) -> Vec<u8> {
        self.version().encode()
    }

    /// Full history blob. Used when the receiver starts from nothing.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .context("Failed to export document snapshot")
    }

    /// Only the ops the given version does not cover. Empty when the given
    /// version already includes everything we have.
    pub fn updates_since(&self, version: &VersionVector) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Updates {
                from: Cow::Borrowed(version),
            })
            .context("Failed to export document updates")
    }

    /// Imports a snapshot or update blob. Idempotent and commutative.
    pub fn import(&self, bytes: &[u8]) -> Result<()> {
        self.doc
            .import(bytes)
            .context("Failed to import document data")?;
        Ok(())
    }

    /// Like [`Self::import`], but tags the import with the originating peer
    /// so the history records where the data came from.
    pub fn import_from(&self, bytes: &[u8], origin: &str) -> Result<()> {
        self.doc
            .import_with(bytes, origin)
            .with_context(|| format!("Failed to import document data from {origin}"))?;
        Ok(())
    }

    /// Registers a callback that fires after every locally committed change.
    /// Dropping the returned subscription unregisters it.
    pub fn on_local_update(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.doc.subscribe_local_update(Box::new(move |_update| {
            callback();
            true
        }))
    }

    /// An independent copy sharing this document's history.
    pub fn fork(&self) -> Self {
        Self { doc: self.doc.fork() }
    }

    /// Compares our version against another. `None` means concurrent.
    pub fn compare(&self, other: &VersionVector) -> Option<Ordering> {
        self.version().partial_cmp(other)
    }

    /// Whether we hold ops the given version does not cover.
    pub fn has_news_for(&self, version: &VersionVector) -> bool {
        !matches!(
            self.compare(version),
            Some(Ordering::Equal | Ordering::Less)
        )
    }

    pub fn commit(&self) {
        self.doc.commit();
    }

    /// The underlying CRDT, for application-level mutation.
    pub fn inner(&self) -> &LoroDoc {
        &self.doc
    }
}

/// Decodes a version vector received over the wire. An empty blob stands for
/// the empty version (a peer that has nothing yet).
pub fn decode_version(bytes: &[u8]) -> Result<VersionVector> {
    if bytes.is_empty() {
        return Ok(VersionVector::new());
    }
    VersionVector::decode(bytes).context("Failed to decode version vector")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn insert_text(document: &Document, text: &str) {
        document.inner().get_text("title").insert(0, text).unwrap();
        document.commit();
    }

    #[test]
    fn fresh_documents_are_equal_and_empty() {
        let a = Document::new();
        let b = Document::new();
        assert_eq!(a.compare(&b.version()), Some(Ordering::Equal));
        assert!(!a.has_news_for(&b.version()));
    }

    #[test]
    fn snapshot_round_trip() {
        let a = Document::new();
        insert_text(&a, "hello");

        let b = Document::load(&a.snapshot().unwrap()).unwrap();
        assert_eq!(b.inner().get_text("title").to_string(), "hello");
        assert_eq!(b.compare(&a.version()), Some(Ordering::Equal));
    }

    #[test]
    fn no_news_after_import() {
        let a = Document::new();
        let b = Document::new();
        insert_text(&a, "hello");

        b.import(&a.updates_since(&VersionVector::new()).unwrap())
            .unwrap();

        // b now covers everything a has.
        assert!(!a.has_news_for(&b.version()));
        assert_eq!(a.compare(&b.version()), Some(Ordering::Equal));
    }

    #[test]
    fn concurrent_edits_compare_as_none() {
        let a = Document::new();
        let b = Document::new();
        insert_text(&a, "from a");
        insert_text(&b, "from b");
        assert_eq!(a.compare(&b.version()), None);
        assert!(a.has_news_for(&b.version()));
    }

    #[test]
    fn import_is_idempotent() {
        let a = Document::new();
        insert_text(&a, "once");
        let update = a.updates_since(&VersionVector::new()).unwrap();

        let b = Document::new();
        b.import(&update).unwrap();
        let version_after_first = b.version();
        b.import(&update).unwrap();
        assert_eq!(b.version(), version_after_first);
    }

    #[test]
    fn local_update_subscription_fires_on_commit() {
        let document = Document::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let _subscription = document.on_local_update(move || {
            calls_clone.fetch_add(1, AtomicOrdering::SeqCst);
        });

        insert_text(&document, "x");
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn empty_encoded_version_decodes_to_empty_vector() {
        let version = decode_version(&[]).unwrap();
        assert_eq!(version, VersionVector::new());
    }
}
