// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end scenarios over in-process transports: two (or three) repos,
//! real framing, real rules, real middleware.

use loro_repo::adapter::memory::MemoryAdapter;
use loro_repo::middleware::{
    Facets, Middleware, MiddlewareChain, MiddlewareContext, RateLimit, Verdict,
};
use loro_repo::storage::{MemoryStorage, StorageAdapter};
use loro_repo::{
    ChannelKind, DocHandle, FnRules, PeerIdentity, PeerType, Repo, RepoConfig, RepoOptions,
    SyncError, WaitForSync,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn identity(name: &str) -> PeerIdentity {
    PeerIdentity::new(name, PeerType::User)
}

fn fast_config() -> RepoConfig {
    RepoConfig {
        heartbeat_interval: Duration::from_millis(200),
        ephemeral_stale_window: Duration::from_millis(600),
        ..RepoConfig::default()
    }
}

fn title(handle: &DocHandle) -> String {
    handle.doc().inner().get_text("title").to_string()
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
#[tracing_test::traced_test]
async fn basic_bidirectional_sync() {
    let (left, right) = MemoryAdapter::pair("basic");
    let repo_a = Repo::new(RepoOptions::new(identity("alice")).with_adapter(left))
        .await
        .unwrap();
    let repo_b = Repo::new(RepoOptions::new(identity("bob")).with_adapter(right))
        .await
        .unwrap();

    let doc_a = repo_a.get("doc-1").await.unwrap();
    doc_a.change(|doc| doc.get_text("title").insert(0, "hello").unwrap());

    let doc_b = repo_b.get("doc-1").await.unwrap();
    doc_b
        .wait_for_sync(WaitForSync::network().with_timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    wait_until("b sees hello", || title(&doc_b) == "hello").await;

    doc_b.change(|doc| doc.get_text("title").insert(5, " world").unwrap());
    wait_until("a sees hello world", || title(&doc_a) == "hello world").await;

    repo_a.stop().await;
    repo_b.stop().await;
}

#[tokio::test]
async fn hidden_docs_are_not_announced_but_answer_direct_requests() {
    let (left, right) = MemoryAdapter::pair("secret");
    let repo_a = Repo::new(
        RepoOptions::new(identity("alice"))
            .with_adapter(left)
            .with_rules(FnRules::with_reveal(|ctx| ctx.doc_id.as_str() != "secret")),
    )
    .await
    .unwrap();
    let repo_b = Repo::new(RepoOptions::new(identity("bob")).with_adapter(right))
        .await
        .unwrap();

    let secret_a = repo_a.get("secret").await.unwrap();
    secret_a.change(|doc| doc.get_text("title").insert(0, "classified").unwrap());
    let public_a = repo_a.get("public").await.unwrap();
    public_a.change(|doc| doc.get_text("title").insert(0, "open").unwrap());

    // The public doc arrives on its own; the secret one never does.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !repo_b.has("public").await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the public doc announcement"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!repo_b.has("secret").await);

    // An explicit request is still answered.
    let secret_b = repo_b.get("secret").await.unwrap();
    secret_b
        .wait_for_sync(WaitForSync::network().with_timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    wait_until("b receives the secret content", || {
        title(&secret_b) == "classified"
    })
    .await;

    repo_a.stop().await;
    repo_b.stop().await;
}

#[tokio::test]
async fn reconnect_resumes_without_losing_changes() {
    let (left, right) = MemoryAdapter::pair("reconnect");
    let repo_a = Repo::new(RepoOptions::new(identity("alice")).with_adapter(left.clone()))
        .await
        .unwrap();
    let repo_b = Repo::new(RepoOptions::new(identity("bob")).with_adapter(right))
        .await
        .unwrap();

    let doc_a = repo_a.get("doc-x").await.unwrap();
    doc_a.change(|doc| doc.get_text("title").insert(0, "v1").unwrap());
    let doc_b = repo_b.get("doc-x").await.unwrap();
    wait_until("initial sync", || title(&doc_b) == "v1").await;

    left.disconnect();
    // Changes made while offline...
    doc_b.change(|doc| doc.get_text("title").insert(2, "+offline").unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(title(&doc_a), "v1");

    // ...flow after the link comes back, re-running the handshake.
    left.reconnect();
    wait_until("a catches up after reconnect", || {
        title(&doc_a) == "v1+offline"
    })
    .await;

    repo_a.stop().await;
    repo_b.stop().await;
}

#[tokio::test]
async fn large_documents_fragment_and_reassemble() {
    let (left, right) = MemoryAdapter::pair("large");
    let repo_a = Repo::new(RepoOptions::new(identity("alice")).with_adapter(left))
        .await
        .unwrap();
    let repo_b = Repo::new(RepoOptions::new(identity("bob")).with_adapter(right))
        .await
        .unwrap();

    // Well above the 80 KiB fragmentation threshold.
    let big = "x".repeat(200 * 1024);
    let doc_a = repo_a.get("big-doc").await.unwrap();
    doc_a.change(|doc| doc.get_text("title").insert(0, &big).unwrap());

    let doc_b = repo_b.get("big-doc").await.unwrap();
    doc_b
        .wait_for_sync(WaitForSync::network().with_timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    wait_until("large content arrives intact", || title(&doc_b) == big).await;

    repo_a.stop().await;
    repo_b.stop().await;
}

struct CountMessages {
    message_type: &'static str,
    count: Arc<AtomicU64>,
}

impl Middleware for CountMessages {
    fn name(&self) -> &'static str {
        "count"
    }

    fn required_facets(&self) -> Facets {
        Facets::default()
    }

    fn check(&self, ctx: &MiddlewareContext) -> Verdict {
        if ctx.message_type == self.message_type {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        Verdict::allow()
    }
}

#[tokio::test]
async fn rate_limited_updates_converge_once_tokens_refill() {
    let seen = Arc::new(AtomicU64::new(0));
    let admitted = Arc::new(AtomicU64::new(0));
    let middleware = MiddlewareChain::new(vec![
        Box::new(CountMessages {
            message_type: "sync-response",
            count: Arc::clone(&seen),
        }),
        Box::new(RateLimit::for_message_type("sync-response", 2.0, 2.0)),
        Box::new(CountMessages {
            message_type: "sync-response",
            count: Arc::clone(&admitted),
        }),
    ]);

    let (left, right) = MemoryAdapter::pair("ratelimit");
    let repo_a = Repo::new(
        RepoOptions::new(identity("alice"))
            .with_adapter(left)
            .with_config(fast_config()),
    )
    .await
    .unwrap();
    let repo_b = Repo::new(
        RepoOptions::new(identity("bob"))
            .with_adapter(right)
            .with_config(fast_config())
            .with_middleware(middleware),
    )
    .await
    .unwrap();

    let doc_a = repo_a.get("rated").await.unwrap();
    let doc_b = repo_b.get("rated").await.unwrap();
    doc_a.change(|doc| doc.get_text("title").insert(0, "0").unwrap());
    wait_until("initial sync", || !title(&doc_b).is_empty()).await;

    // A burst of rapid changes; most of the per-change updates get dropped
    // at b's door.
    for i in 1..=10 {
        doc_a.change(|doc| doc.get_text("title").insert(0, &i.to_string()).unwrap());
    }

    // The periodic version check heals the holes once tokens refill.
    wait_until("b converges despite rate limiting", || {
        title(&doc_b) == title(&doc_a)
    })
    .await;
    let dropped = seen.load(Ordering::Relaxed) - admitted.load(Ordering::Relaxed);
    assert!(dropped > 0, "the limiter never engaged");

    repo_a.stop().await;
    repo_b.stop().await;
}

#[tokio::test]
async fn presence_relays_through_a_hub_and_expires() {
    let (a_end, hub_left) = MemoryAdapter::pair("spoke-a");
    let (hub_right, b_end) = MemoryAdapter::pair("spoke-b");

    let repo_a = Repo::new(
        RepoOptions::new(identity("alice"))
            .with_adapter(a_end)
            .with_config(fast_config()),
    )
    .await
    .unwrap();
    let repo_hub = Repo::new(
        RepoOptions::new(PeerIdentity::new("hub", PeerType::Service))
            .with_adapter(hub_left)
            .with_adapter(hub_right)
            .with_config(fast_config()),
    )
    .await
    .unwrap();
    let repo_b = Repo::new(
        RepoOptions::new(identity("bob"))
            .with_adapter(b_end)
            .with_config(fast_config()),
    )
    .await
    .unwrap();

    let doc_a = repo_a.get("shared").await.unwrap();
    let _doc_hub = repo_hub.get("shared").await.unwrap();
    let doc_b = repo_b.get("shared").await.unwrap();
    doc_a.change(|doc| doc.get_text("title").insert(0, "presence").unwrap());
    wait_until("doc reaches b through the hub", || {
        title(&doc_b) == "presence"
    })
    .await;

    // A's cursor travels A -> hub -> B without a direct link.
    let presence_a = doc_a.ephemeral("cursors");
    presence_a.set_self(json!({ "x": 1 }));
    let presence_b = doc_b.ephemeral("cursors");
    let alice_peer = repo_a.identity().peer_id.clone();
    wait_until("b observes a's presence", || {
        presence_b.peer_state(&alice_peer) == Some(json!({ "x": 1 }))
    })
    .await;

    // And symmetrically back.
    presence_b.set_self(json!({ "x": 2 }));
    let bob_peer = repo_b.identity().peer_id.clone();
    wait_until("a observes b's presence", || {
        presence_a.peer_state(&bob_peer) == Some(json!({ "x": 2 }))
    })
    .await;

    // Once alice goes away her presence ages out of b's store.
    repo_a.stop().await;
    wait_until("a's presence expires on b", || {
        presence_b.peer_state(&alice_peer).is_none()
    })
    .await;

    repo_hub.stop().await;
    repo_b.stop().await;
}

#[tokio::test]
async fn documents_persist_through_storage() {
    let storage = MemoryStorage::new();

    let repo_first = Repo::new(
        RepoOptions::new(identity("writer"))
            .with_adapter(StorageAdapter::new(
                Arc::clone(&storage) as Arc<dyn loro_repo::storage::DocStorage>
            )),
    )
    .await
    .unwrap();
    let doc = repo_first.get("durable").await.unwrap();
    doc.wait_for_sync(WaitForSync::storage().with_timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    doc.change(|d| d.get_text("title").insert(0, "saved").unwrap());

    // Give the write a moment to land, then start over from storage alone.
    tokio::time::sleep(Duration::from_millis(300)).await;
    repo_first.stop().await;

    let repo_second = Repo::new(
        RepoOptions::new(identity("reader"))
            .with_adapter(StorageAdapter::new(
                Arc::clone(&storage) as Arc<dyn loro_repo::storage::DocStorage>
            )),
    )
    .await
    .unwrap();
    let restored = repo_second.get("durable").await.unwrap();
    restored
        .wait_for_sync(WaitForSync::storage().with_timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    wait_until("content restored from storage", || {
        title(&restored) == "saved"
    })
    .await;

    repo_second.stop().await;
}

#[tokio::test]
async fn wait_for_sync_without_adapters_fails_fast() {
    let repo = Repo::new(RepoOptions::new(identity("loner")))
        .await
        .unwrap();
    let doc = repo.get("doc").await.unwrap();
    let result = doc.wait_for_sync(WaitForSync::network()).await;
    assert!(matches!(
        result,
        Err(SyncError::NoAdapters {
            kind: ChannelKind::Network
        })
    ));
    repo.stop().await;
}

#[tokio::test]
async fn wait_for_sync_can_be_aborted() {
    let (left, _right_unstarted) = MemoryAdapter::pair("abort");
    let repo = Repo::new(RepoOptions::new(identity("alice")).with_adapter(left))
        .await
        .unwrap();
    let doc = repo.get("doc").await.unwrap();

    let signal = tokio_util::sync::CancellationToken::new();
    let abort = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        abort.cancel();
    });
    // The peer never starts, so without the signal this would hang.
    let result = doc
        .wait_for_sync(WaitForSync::network().with_signal(signal))
        .await;
    assert!(matches!(result, Err(SyncError::Aborted)));
    repo.stop().await;
}
