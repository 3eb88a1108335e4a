use docmesh_storage::{
    BulkDocsOptions, BulkGetItem, BulkGetRequest, ChangesRequest, ChangesStyle, DocumentStore,
    GetOptions, MemoryDocumentStore, PutOptions, RevsDiffRequest, StorageError,
};
use docmesh_types::{DocId, Document, Revision, RevisionHistory, Seq};
use pretty_assertions::assert_eq;

async fn put_new(store: &MemoryDocumentStore, id: &str, title: &str) -> Revision {
    store
        .put(Document::new(id).with_field("title", title), PutOptions::default())
        .await
        .unwrap()
        .rev
        .unwrap()
}

fn branch(id: &str, leaf: &str, parent: &Revision, title: &str) -> Document {
    let leaf = Revision::new(parent.generation() + 1, leaf);
    let mut doc = Document::new(id)
        .with_field("title", title)
        .with_rev(leaf.clone());
    doc.revisions = RevisionHistory::from_chain(&[leaf, parent.clone()]);
    doc
}

// ── put / get ───────────────────────────────────────────────────

#[tokio::test]
async fn put_creates_first_generation() {
    let store = MemoryDocumentStore::new("local");
    let rev = put_new(&store, "note", "hello").await;

    assert_eq!(rev.generation(), 1);
    assert_eq!(rev.hash().len(), 32);

    let doc = store.get(&DocId::new("note"), &GetOptions::default()).await.unwrap();
    assert_eq!(doc.rev, Some(rev));
    assert_eq!(doc.field("title").unwrap(), "hello");

    let info = store.info().await.unwrap();
    assert_eq!(info.db_name, "local");
    assert_eq!(info.update_seq, Seq::from(1));
}

#[tokio::test]
async fn put_without_rev_on_existing_doc_conflicts() {
    let store = MemoryDocumentStore::new("local");
    put_new(&store, "note", "v1").await;

    let err = store
        .put(Document::new("note").with_field("title", "v2"), PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
}

#[tokio::test]
async fn put_with_stale_rev_conflicts() {
    let store = MemoryDocumentStore::new("local");
    let first = put_new(&store, "note", "v1").await;
    let second = store
        .put(
            Document::new("note").with_field("title", "v2").with_rev(first.clone()),
            PutOptions::default(),
        )
        .await
        .unwrap()
        .rev
        .unwrap();
    assert_eq!(second.generation(), 2);

    let err = store
        .put(
            Document::new("note").with_field("title", "v3").with_rev(first),
            PutOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
}

#[tokio::test]
async fn deleted_doc_is_not_found_but_can_be_recreated() {
    let store = MemoryDocumentStore::new("local");
    let rev = put_new(&store, "note", "v1").await;
    store
        .put(Document::new("note").with_rev(rev).deleted(), PutOptions::default())
        .await
        .unwrap();

    let err = store
        .get(&DocId::new("note"), &GetOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));

    let recreated = put_new(&store, "note", "again").await;
    assert_eq!(recreated.generation(), 3);
}

#[tokio::test]
async fn get_unknown_doc_is_not_found() {
    let store = MemoryDocumentStore::new("local");
    let err = store
        .get(&DocId::new("missing"), &GetOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

// ── As-is writes and conflicts ──────────────────────────────────

#[tokio::test]
async fn as_is_writes_preserve_branches() {
    let store = MemoryDocumentStore::new("local");
    let root = put_new(&store, "note", "base").await;

    let results = store
        .bulk_docs(
            vec![
                branch("note", "bbbb", &root, "left"),
                branch("note", "cccc", &root, "right"),
            ],
            BulkDocsOptions::as_is(),
        )
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.ok));

    let leaves = store.leaf_revisions(&DocId::new("note")).await;
    assert_eq!(leaves, vec![Revision::new(2, "bbbb"), Revision::new(2, "cccc")]);

    let doc = store
        .get(
            &DocId::new("note"),
            &GetOptions {
                conflicts: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(doc.rev, Some(Revision::new(2, "cccc")));
    assert_eq!(doc.conflicts, vec![Revision::new(2, "bbbb")]);
}

#[tokio::test]
async fn live_leaf_beats_higher_tombstone() {
    let store = MemoryDocumentStore::new("local");
    let root = put_new(&store, "note", "base").await;

    let mut tombstone = branch("note", "ffff", &root, "gone");
    tombstone.deleted = true;
    store
        .bulk_docs(
            vec![tombstone, branch("note", "aaaa", &root, "alive")],
            BulkDocsOptions::as_is(),
        )
        .await
        .unwrap();

    let doc = store
        .get(&DocId::new("note"), &GetOptions::default())
        .await
        .unwrap();
    assert_eq!(doc.rev, Some(Revision::new(2, "aaaa")));
    assert_eq!(doc.field("title").unwrap(), "alive");
}

#[tokio::test]
async fn repeating_an_as_is_write_does_not_bump_seq() {
    let store = MemoryDocumentStore::new("local");
    let root = put_new(&store, "note", "base").await;
    let doc = branch("note", "bbbb", &root, "left");

    store
        .bulk_docs(vec![doc.clone()], BulkDocsOptions::as_is())
        .await
        .unwrap();
    let before = store.info().await.unwrap().update_seq;
    store
        .bulk_docs(vec![doc], BulkDocsOptions::as_is())
        .await
        .unwrap();
    assert_eq!(store.info().await.unwrap().update_seq, before);
}

#[tokio::test]
async fn as_is_write_without_rev_is_rejected_per_doc() {
    let store = MemoryDocumentStore::new("local");
    let results = store
        .bulk_docs(vec![Document::new("norev")], BulkDocsOptions::as_is())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].ok);
    assert_eq!(results[0].error.as_deref(), Some("bad_request"));
}

// ── Change feed ─────────────────────────────────────────────────

#[tokio::test]
async fn changes_are_ordered_by_last_seq() {
    let store = MemoryDocumentStore::new("local");
    let a = put_new(&store, "a", "1").await;
    put_new(&store, "b", "1").await;
    store
        .put(
            Document::new("a").with_field("title", "2").with_rev(a),
            PutOptions::default(),
        )
        .await
        .unwrap();

    let feed = store.changes(&ChangesRequest::default()).await.unwrap();
    let ids: Vec<&str> = feed.results.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "a"]);
    assert_eq!(feed.last_seq, Seq::from(3));

    let tail = store
        .changes(&ChangesRequest {
            since: Seq::from(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(tail.results.len(), 1);
    assert_eq!(tail.results[0].id.as_str(), "a");
}

#[tokio::test]
async fn changes_limit_and_empty_tail() {
    let store = MemoryDocumentStore::new("local");
    for id in ["a", "b", "c"] {
        put_new(&store, id, "x").await;
    }

    let page = store
        .changes(&ChangesRequest {
            since: Seq::start(),
            style: ChangesStyle::MainOnly,
            limit: Some(2),
        })
        .await
        .unwrap();
    assert_eq!(page.results.len(), 2);
    assert_eq!(page.last_seq, Seq::from(2));

    let empty = store
        .changes(&ChangesRequest {
            since: Seq::from(3),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(empty.results.is_empty());
    assert_eq!(empty.last_seq, Seq::from(3));
}

#[tokio::test]
async fn all_docs_style_reports_every_leaf() {
    let store = MemoryDocumentStore::new("local");
    let root = put_new(&store, "note", "base").await;
    store
        .bulk_docs(
            vec![
                branch("note", "bbbb", &root, "left"),
                branch("note", "cccc", &root, "right"),
            ],
            BulkDocsOptions::as_is(),
        )
        .await
        .unwrap();

    let main_only = store.changes(&ChangesRequest::default()).await.unwrap();
    assert_eq!(main_only.results[0].changes.len(), 1);

    let all_docs = store
        .changes(&ChangesRequest {
            style: ChangesStyle::AllDocs,
            ..Default::default()
        })
        .await
        .unwrap();
    let revs: Vec<Revision> = all_docs.results[0].revisions().cloned().collect();
    assert_eq!(revs, vec![Revision::new(2, "cccc"), Revision::new(2, "bbbb")]);
}

#[tokio::test]
async fn watch_changes_sees_new_writes() {
    let store = MemoryDocumentStore::new("local");
    let mut sub = store.watch_changes().unwrap();

    let rev = put_new(&store, "note", "hello").await;
    let entry = sub.next().await.unwrap().unwrap();
    assert_eq!(entry.id.as_str(), "note");
    assert_eq!(entry.revisions().next(), Some(&rev));
}

// ── Local documents ─────────────────────────────────────────────

#[tokio::test]
async fn local_docs_stay_out_of_the_feed() {
    let store = MemoryDocumentStore::new("local");
    let written = store
        .put(
            Document::new("_local/checkpoint").with_field("since", "5"),
            PutOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(written.rev, Some(Revision::new(0, "1")));

    assert_eq!(store.info().await.unwrap().update_seq, Seq::from(0));
    assert!(store.changes(&ChangesRequest::default()).await.unwrap().results.is_empty());

    let doc = store
        .get(&DocId::new("_local/checkpoint"), &GetOptions::default())
        .await
        .unwrap();
    assert_eq!(doc.field("since").unwrap(), "5");
}

#[tokio::test]
async fn local_doc_update_requires_current_rev() {
    let store = MemoryDocumentStore::new("local");
    let first = store
        .put(Document::new("_local/cp"), PutOptions::default())
        .await
        .unwrap()
        .rev
        .unwrap();

    let second = store
        .put(
            Document::new("_local/cp").with_field("n", 2).with_rev(first.clone()),
            PutOptions::default(),
        )
        .await
        .unwrap()
        .rev
        .unwrap();
    assert_eq!(second, Revision::new(0, "2"));

    let err = store
        .put(Document::new("_local/cp").with_rev(first), PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
}

// ── revs_diff / bulk_get ────────────────────────────────────────

#[tokio::test]
async fn revs_diff_lists_only_missing() {
    let store = MemoryDocumentStore::new("local");
    let known = put_new(&store, "note", "x").await;

    let mut request = RevsDiffRequest::new();
    request.insert(
        DocId::new("note"),
        vec![known.clone(), Revision::new(2, "beef")],
    );
    request.insert(DocId::new("other"), vec![Revision::new(1, "abcd")]);

    let diff = store.revs_diff(&request).await.unwrap();
    assert_eq!(diff.len(), 2);
    assert_eq!(diff[&DocId::new("note")].missing, vec![Revision::new(2, "beef")]);
    assert_eq!(diff[&DocId::new("note")].possible_ancestors, vec![known.clone()]);
    assert_eq!(diff[&DocId::new("other")].missing, vec![Revision::new(1, "abcd")]);

    let mut all_known = RevsDiffRequest::new();
    all_known.insert(DocId::new("note"), vec![known]);
    assert!(store.revs_diff(&all_known).await.unwrap().is_empty());
}

#[tokio::test]
async fn bulk_get_attaches_history() {
    let store = MemoryDocumentStore::new("local");
    let first = put_new(&store, "note", "v1").await;
    let second = store
        .put(
            Document::new("note").with_field("title", "v2").with_rev(first.clone()),
            PutOptions::default(),
        )
        .await
        .unwrap()
        .rev
        .unwrap();

    let response = store
        .bulk_get(&BulkGetRequest {
            docs: vec![
                BulkGetItem {
                    id: DocId::new("note"),
                    rev: Some(second.clone()),
                },
                BulkGetItem {
                    id: DocId::new("missing"),
                    rev: None,
                },
            ],
            revs: true,
        })
        .await
        .unwrap();
    assert_eq!(response.results.len(), 2);

    let docs = response.into_documents();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].revision_chain(), vec![second, first]);
}
