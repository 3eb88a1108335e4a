use docmesh_storage::{
    BulkDocsOptions, BulkGetItem, BulkGetRequest, ChangesRequest, ChangesStyle, DocumentStore,
    GetOptions, HttpDocumentStore, HttpStoreConfig, PutOptions, StorageError,
};
use docmesh_types::{DocId, Document, Revision, Seq};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store_for(server: &MockServer) -> HttpDocumentStore {
    HttpDocumentStore::new(HttpStoreConfig {
        base_url: server.uri(),
        database: "notes".to_string(),
        ..Default::default()
    })
    .unwrap()
}

// ── Config ──────────────────────────────────────────────────────

#[test]
fn http_config_default() {
    let cfg = HttpStoreConfig::default();
    assert_eq!(cfg.base_url, "http://127.0.0.1:5984");
    assert_eq!(cfg.database, "docmesh");
    assert!(cfg.username.is_none());
    assert_eq!(cfg.timeout_secs, 60);
}

#[test]
fn http_config_fills_missing_fields() {
    let cfg: HttpStoreConfig =
        serde_json::from_str(r#"{"base_url":"http://db:5984","database":"vault"}"#).unwrap();
    assert_eq!(cfg.database, "vault");
    assert_eq!(cfg.timeout_secs, 60);
}

#[test]
fn http_store_name_includes_database() {
    let store = HttpDocumentStore::new(HttpStoreConfig {
        base_url: "http://db:5984/".to_string(),
        database: "vault".to_string(),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(store.name(), "http://db:5984/vault");
}

// ── Reads ───────────────────────────────────────────────────────

#[tokio::test]
async fn info_accepts_string_sequences() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "db_name": "notes",
            "update_seq": "12-g1AAAA",
            "doc_count": 4
        })))
        .mount(&server)
        .await;

    let info = store_for(&server).info().await.unwrap();
    assert_eq!(info.db_name, "notes");
    assert_eq!(info.update_seq.ordinal(), 12);
}

#[tokio::test]
async fn changes_sends_since_and_style() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notes/_changes"))
        .and(query_param("since", "7"))
        .and(query_param("style", "all_docs"))
        .and(query_param("limit", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"seq": 8, "id": "a", "changes": [{"rev": "2-aa"}, {"rev": "2-bb"}]},
                {"seq": 9, "id": "b", "changes": [{"rev": "3-cc"}], "deleted": true}
            ],
            "last_seq": 9
        })))
        .expect(1)
        .mount(&server)
        .await;

    let feed = store_for(&server)
        .changes(&ChangesRequest {
            since: Seq::from(7),
            style: ChangesStyle::AllDocs,
            limit: Some(50),
        })
        .await
        .unwrap();
    assert_eq!(feed.results.len(), 2);
    assert_eq!(feed.results[0].changes.len(), 2);
    assert!(feed.results[1].deleted);
    assert_eq!(feed.last_seq, Seq::from(9));
}

#[tokio::test]
async fn get_missing_doc_maps_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notes/absent"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": "not_found",
            "reason": "missing"
        })))
        .mount(&server)
        .await;

    let err = store_for(&server)
        .get(&DocId::new("absent"), &GetOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(ref m) if m.contains("missing")));
}

#[tokio::test]
async fn local_doc_keeps_prefix_in_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notes/_local/docmesh-mark-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "_local/docmesh-mark-abc",
            "_rev": "0-3",
            "mark": "m1"
        })))
        .mount(&server)
        .await;

    let doc = store_for(&server)
        .get(&DocId::new("_local/docmesh-mark-abc"), &GetOptions::default())
        .await
        .unwrap();
    assert_eq!(doc.rev, Some(Revision::new(0, "3")));
    assert_eq!(doc.field("mark").unwrap(), "m1");
}

#[tokio::test]
async fn bulk_get_requests_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notes/_bulk_get"))
        .and(query_param("revs", "true"))
        .and(body_partial_json(json!({"docs": [{"id": "a", "rev": "2-bb"}]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{
                "id": "a",
                "docs": [{"ok": {
                    "_id": "a",
                    "_rev": "2-bb",
                    "_revisions": {"start": 2, "ids": ["bb", "aa"]},
                    "title": "hi"
                }}]
            }]
        })))
        .mount(&server)
        .await;

    let docs = store_for(&server)
        .bulk_get(&BulkGetRequest {
            docs: vec![BulkGetItem {
                id: DocId::new("a"),
                rev: Some(Revision::new(2, "bb")),
            }],
            revs: true,
        })
        .await
        .unwrap()
        .into_documents();
    assert_eq!(docs.len(), 1);
    assert_eq!(
        docs[0].revision_chain(),
        vec![Revision::new(2, "bb"), Revision::new(1, "aa")]
    );
}

// ── Writes ──────────────────────────────────────────────────────

#[tokio::test]
async fn bulk_docs_sends_new_edits_flag() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notes/_bulk_docs"))
        .and(body_partial_json(json!({"new_edits": false})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let results = store_for(&server)
        .bulk_docs(
            vec![Document::new("a").with_rev(Revision::new(1, "aa"))],
            BulkDocsOptions::as_is(),
        )
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn put_conflict_maps_to_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/notes/a"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": "conflict",
            "reason": "Document update conflict."
        })))
        .mount(&server)
        .await;

    let err = store_for(&server)
        .put(Document::new("a"), PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
}

#[tokio::test]
async fn put_returns_new_revision() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/notes/a"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "ok": true,
            "id": "a",
            "rev": "1-abc"
        })))
        .mount(&server)
        .await;

    let result = store_for(&server)
        .put(Document::new("a").with_field("x", 1), PutOptions::default())
        .await
        .unwrap();
    assert!(result.ok);
    assert_eq!(result.rev, Some(Revision::new(1, "abc")));
}

// ── Errors and auth ─────────────────────────────────────────────

#[tokio::test]
async fn credentials_are_sent_as_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notes"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "db_name": "notes",
            "update_seq": 0
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = HttpDocumentStore::new(HttpStoreConfig {
        base_url: server.uri(),
        database: "notes".to_string(),
        username: Some("admin".to_string()),
        password: Some("secret".to_string()),
        ..Default::default()
    })
    .unwrap();
    store.info().await.unwrap();
}

#[tokio::test]
async fn unauthorized_status_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notes"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = store_for(&server).info().await.unwrap_err();
    assert!(matches!(err, StorageError::Unauthorized(_)));
}

#[tokio::test]
async fn server_error_keeps_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notes"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = store_for(&server).info().await.unwrap_err();
    assert!(matches!(err, StorageError::Http { status: 500, .. }));
}

#[tokio::test]
async fn refused_connection_is_unreachable() {
    let store = HttpDocumentStore::new(HttpStoreConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        database: "notes".to_string(),
        timeout_secs: 2,
        ..Default::default()
    })
    .unwrap();

    let err = store.info().await.unwrap_err();
    assert!(err.is_unreachable());
}
