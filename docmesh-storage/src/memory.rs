//! In-process document store with full revision-tree semantics.

use crate::error::{StorageError, StorageResult};
use crate::rev_tree::RevTree;
use crate::store::{
    BulkDocsOptions, BulkGetDoc, BulkGetError, BulkGetRequest, BulkGetResponse, BulkGetResult,
    ChangeSubscription, ChangesRequest, ChangesResponse, ChangesStyle, DatabaseInfo,
    DocumentStore, GetOptions, PutOptions, RevsDiffEntry, RevsDiffRequest, RevsDiffResponse,
    WriteResult,
};
use async_trait::async_trait;
use docmesh_types::{ChangeEntry, ChangeRev, DocId, Document, Revision, RevisionHistory, Seq};
use std::collections::HashMap;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

const LIVE_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct DocRecord {
    tree: RevTree,
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    docs: HashMap<DocId, DocRecord>,
    local: HashMap<DocId, Document>,
    update_seq: u64,
}

/// A document store held entirely in memory.
///
/// Behaves like a CouchDB-compatible database: revisions form a tree per
/// document, deletions are tombstone revisions, and `new_edits=false`
/// grafts foreign revisions without conflict checks.
pub struct MemoryDocumentStore {
    name: String,
    state: RwLock<State>,
    live: broadcast::Sender<ChangeEntry>,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        let (live, _) = broadcast::channel(LIVE_FEED_CAPACITY);
        Self {
            name: name.into(),
            state: RwLock::new(State::default()),
            live,
        }
    }

    /// Every revision known for a document, lowest first. Includes stubs.
    pub async fn all_revisions(&self, id: &DocId) -> Vec<Revision> {
        let state = self.state.read().await;
        let mut revs: Vec<Revision> = state
            .docs
            .get(id)
            .map(|rec| rec.tree.revisions().cloned().collect())
            .unwrap_or_default();
        revs.sort();
        revs
    }

    /// Leaf revisions of a document, lowest first.
    pub async fn leaf_revisions(&self, id: &DocId) -> Vec<Revision> {
        let state = self.state.read().await;
        state
            .docs
            .get(id)
            .map(|rec| rec.tree.leaves())
            .unwrap_or_default()
    }

    /// Ids of all replicated documents, tombstones included.
    pub async fn doc_ids(&self) -> Vec<DocId> {
        let state = self.state.read().await;
        let mut ids: Vec<DocId> = state.docs.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn put_local(state: &mut State, doc: Document, options: PutOptions) -> StorageResult<WriteResult> {
        let current = state.local.get(&doc.id).and_then(|d| d.rev.clone());
        if options.new_edits && current.is_some() && doc.rev != current {
            return Err(StorageError::Conflict(doc.id.to_string()));
        }

        let next = current.map_or(1, |rev| rev.hash().parse::<u64>().unwrap_or(0) + 1);
        let rev = Revision::new(0, next.to_string());
        let id = doc.id.clone();
        if doc.deleted {
            state.local.remove(&id);
        } else {
            let mut stored = doc;
            stored.rev = Some(rev.clone());
            stored.revisions = None;
            stored.conflicts.clear();
            state.local.insert(id.clone(), stored);
        }
        Ok(WriteResult::ok(id, rev))
    }

    fn write_new_edit(state: &mut State, doc: Document) -> StorageResult<(WriteResult, ChangeEntry)> {
        let id = doc.id.clone();
        let existing = state.docs.get(&id).map(|rec| &rec.tree);

        let parent = match (&doc.rev, existing) {
            (None, None) => None,
            (None, Some(tree)) => {
                if !tree.winner_deleted() {
                    return Err(StorageError::Conflict(id.to_string()));
                }
                tree.winner()
            }
            (Some(rev), Some(tree)) if tree.is_leaf(rev) => Some(rev.clone()),
            (Some(_), _) => return Err(StorageError::Conflict(id.to_string())),
        };

        let record = state.docs.entry(id.clone()).or_default();
        let rev = record.tree.extend(parent.as_ref(), doc.body, doc.deleted);
        state.update_seq += 1;
        let seq = state.update_seq;
        let record = state
            .docs
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        record.seq = seq;
        let entry = change_entry(&id, record, ChangesStyle::AllDocs);
        Ok((WriteResult::ok(id, rev), entry))
    }

    fn write_as_is(state: &mut State, doc: Document) -> StorageResult<(WriteResult, Option<ChangeEntry>)> {
        let chain = doc.revision_chain();
        let Some(leaf) = chain.first().cloned() else {
            return Err(StorageError::InvalidData(format!(
                "{}: revision required when new_edits=false",
                doc.id
            )));
        };

        let id = doc.id.clone();
        let record = state.docs.entry(id.clone()).or_default();
        if !record.tree.graft(&chain, doc.body, doc.deleted) {
            return Ok((WriteResult::ok(id, leaf), None));
        }

        state.update_seq += 1;
        let seq = state.update_seq;
        let record = state
            .docs
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        record.seq = seq;
        let entry = change_entry(&id, record, ChangesStyle::AllDocs);
        Ok((WriteResult::ok(id, leaf), Some(entry)))
    }

    fn write(
        state: &mut State,
        doc: Document,
        new_edits: bool,
    ) -> StorageResult<(WriteResult, Option<ChangeEntry>)> {
        if doc.is_local() {
            return Self::put_local(state, doc, PutOptions { new_edits }).map(|r| (r, None));
        }
        if new_edits {
            Self::write_new_edit(state, doc).map(|(r, e)| (r, Some(e)))
        } else {
            Self::write_as_is(state, doc)
        }
    }

    fn publish(&self, entries: Vec<ChangeEntry>) {
        for entry in entries {
            // No subscribers is fine.
            let _ = self.live.send(entry);
        }
    }

    fn read_document(
        record: &DocRecord,
        id: &DocId,
        rev: &Revision,
        options: &GetOptions,
    ) -> StorageResult<Document> {
        let node = record
            .tree
            .node(rev)
            .ok_or_else(|| StorageError::NotFound(format!("{id}@{rev}")))?;
        let body = node
            .body
            .clone()
            .ok_or_else(|| StorageError::NotFound(format!("{id}@{rev} (missing body)")))?;

        let mut doc = Document {
            id: id.clone(),
            rev: Some(rev.clone()),
            deleted: node.deleted,
            body,
            ..Default::default()
        };
        if options.revs {
            doc.revisions = RevisionHistory::from_chain(&record.tree.chain(rev));
        }
        if options.conflicts {
            doc.conflicts = record.tree.conflicts();
        }
        Ok(doc)
    }
}

fn change_entry(id: &DocId, record: &DocRecord, style: ChangesStyle) -> ChangeEntry {
    let winner = record.tree.winner();
    let revs: Vec<Revision> = match style {
        ChangesStyle::MainOnly => winner.clone().into_iter().collect(),
        ChangesStyle::AllDocs => {
            let mut leaves = record.tree.leaves();
            leaves.retain(|r| Some(r) != winner.as_ref());
            winner.clone().into_iter().chain(leaves).collect()
        }
    };
    ChangeEntry {
        id: id.clone(),
        seq: Seq::from(record.seq),
        changes: revs.into_iter().map(|rev| ChangeRev { rev }).collect(),
        deleted: record.tree.winner_deleted(),
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn info(&self) -> StorageResult<DatabaseInfo> {
        let state = self.state.read().await;
        Ok(DatabaseInfo {
            db_name: self.name.clone(),
            update_seq: Seq::from(state.update_seq),
        })
    }

    async fn changes(&self, request: &ChangesRequest) -> StorageResult<ChangesResponse> {
        let state = self.state.read().await;
        let since = request.since.ordinal();

        let mut records: Vec<(&DocId, &DocRecord)> = state
            .docs
            .iter()
            .filter(|(_, rec)| rec.seq > since)
            .collect();
        records.sort_by_key(|(_, rec)| rec.seq);
        if let Some(limit) = request.limit {
            records.truncate(limit);
        }

        let results: Vec<ChangeEntry> = records
            .into_iter()
            .map(|(id, rec)| change_entry(id, rec, request.style))
            .collect();
        let last_seq = results
            .last()
            .map(|e| e.seq.clone())
            .unwrap_or_else(|| Seq::from(state.update_seq));
        Ok(ChangesResponse { results, last_seq })
    }

    async fn revs_diff(&self, revs: &RevsDiffRequest) -> StorageResult<RevsDiffResponse> {
        let state = self.state.read().await;
        let mut response = RevsDiffResponse::new();

        for (id, candidates) in revs {
            let record = state.docs.get(id);
            let missing: Vec<Revision> = candidates
                .iter()
                .filter(|rev| !record.is_some_and(|r| r.tree.contains(rev)))
                .cloned()
                .collect();
            if missing.is_empty() {
                continue;
            }
            let possible_ancestors = record
                .map(|r| {
                    let max_missing = missing.iter().map(Revision::generation).max().unwrap_or(0);
                    r.tree
                        .leaves()
                        .into_iter()
                        .filter(|leaf| leaf.generation() < max_missing)
                        .collect()
                })
                .unwrap_or_default();
            response.insert(
                id.clone(),
                RevsDiffEntry {
                    missing,
                    possible_ancestors,
                },
            );
        }
        Ok(response)
    }

    async fn bulk_docs(
        &self,
        docs: Vec<Document>,
        options: BulkDocsOptions,
    ) -> StorageResult<Vec<WriteResult>> {
        let mut published = Vec::new();
        let mut results = Vec::with_capacity(docs.len());
        {
            let mut state = self.state.write().await;
            for doc in docs {
                let id = doc.id.clone();
                match Self::write(&mut state, doc, options.new_edits) {
                    Ok((result, entry)) => {
                        published.extend(entry);
                        results.push(result);
                    }
                    Err(StorageError::Conflict(_)) => {
                        results.push(WriteResult::failed(id, "conflict", "Document update conflict."));
                    }
                    Err(e) => results.push(WriteResult::failed(id, "bad_request", e.to_string())),
                }
            }
        }
        debug!(store = %self.name, written = published.len(), "bulk_docs applied");
        self.publish(published);
        Ok(results)
    }

    async fn bulk_get(&self, request: &BulkGetRequest) -> StorageResult<BulkGetResponse> {
        let state = self.state.read().await;
        let options = GetOptions {
            rev: None,
            revs: request.revs,
            conflicts: false,
        };

        let mut results = Vec::with_capacity(request.docs.len());
        for item in &request.docs {
            let lookup = state.docs.get(&item.id).and_then(|record| {
                let rev = item.rev.clone().or_else(|| record.tree.winner())?;
                Some(Self::read_document(record, &item.id, &rev, &options))
            });
            let doc = match lookup {
                Some(Ok(doc)) => BulkGetDoc::Ok { ok: doc },
                Some(Err(e)) => BulkGetDoc::Error {
                    error: BulkGetError {
                        id: item.id.clone(),
                        rev: item.rev.as_ref().map(ToString::to_string),
                        error: "not_found".into(),
                        reason: e.to_string(),
                    },
                },
                None => BulkGetDoc::Error {
                    error: BulkGetError {
                        id: item.id.clone(),
                        rev: item.rev.as_ref().map(ToString::to_string),
                        error: "not_found".into(),
                        reason: "missing".into(),
                    },
                },
            };
            results.push(BulkGetResult {
                id: item.id.clone(),
                docs: vec![doc],
            });
        }
        Ok(BulkGetResponse { results })
    }

    async fn put(&self, doc: Document, options: PutOptions) -> StorageResult<WriteResult> {
        let (result, entry) = {
            let mut state = self.state.write().await;
            Self::write(&mut state, doc, options.new_edits)?
        };
        self.publish(entry.into_iter().collect());
        Ok(result)
    }

    async fn get(&self, id: &DocId, options: &GetOptions) -> StorageResult<Document> {
        let state = self.state.read().await;
        if id.is_local() {
            return state
                .local
                .get(id)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(id.to_string()));
        }

        let record = state
            .docs
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let rev = match &options.rev {
            Some(rev) => rev.clone(),
            None => {
                if record.tree.winner_deleted() {
                    return Err(StorageError::NotFound(format!("{id} (deleted)")));
                }
                record
                    .tree
                    .winner()
                    .ok_or_else(|| StorageError::NotFound(id.to_string()))?
            }
        };
        Self::read_document(record, id, &rev, options)
    }

    fn watch_changes(&self) -> StorageResult<ChangeSubscription> {
        Ok(ChangeSubscription::new(self.live.subscribe()))
    }
}
