//! Revision tree of a single document.
//!
//! Every revision points at its parent. Leaves are revisions nothing points
//! at; the winner is the highest non-deleted leaf, or the highest leaf when
//! all of them are tombstones.

use docmesh_types::Revision;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub(crate) struct RevNode {
    pub parent: Option<Revision>,
    /// `None` for ancestors known only by id (stubs).
    pub body: Option<Map<String, Value>>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RevTree {
    nodes: HashMap<Revision, RevNode>,
}

impl RevTree {
    pub fn contains(&self, rev: &Revision) -> bool {
        self.nodes.contains_key(rev)
    }

    pub fn node(&self, rev: &Revision) -> Option<&RevNode> {
        self.nodes.get(rev)
    }

    pub fn revisions(&self) -> impl Iterator<Item = &Revision> {
        self.nodes.keys()
    }

    pub fn leaves(&self) -> Vec<Revision> {
        let parents: HashSet<&Revision> =
            self.nodes.values().filter_map(|n| n.parent.as_ref()).collect();
        let mut leaves: Vec<Revision> = self
            .nodes
            .keys()
            .filter(|rev| !parents.contains(rev))
            .cloned()
            .collect();
        leaves.sort();
        leaves
    }

    pub fn is_leaf(&self, rev: &Revision) -> bool {
        self.contains(rev) && !self.nodes.values().any(|n| n.parent.as_ref() == Some(rev))
    }

    pub fn winner(&self) -> Option<Revision> {
        let leaves = self.leaves();
        let live = leaves
            .iter()
            .filter(|rev| self.nodes.get(*rev).is_some_and(|n| !n.deleted))
            .max()
            .cloned();
        live.or_else(|| leaves.into_iter().max())
    }

    pub fn winner_deleted(&self) -> bool {
        self.winner()
            .and_then(|rev| self.nodes.get(&rev).map(|n| n.deleted))
            .unwrap_or(true)
    }

    /// Non-deleted leaves other than the winner, highest first.
    pub fn conflicts(&self) -> Vec<Revision> {
        let winner = self.winner();
        let mut out: Vec<Revision> = self
            .leaves()
            .into_iter()
            .filter(|rev| Some(rev) != winner.as_ref())
            .filter(|rev| self.nodes.get(rev).is_some_and(|n| !n.deleted))
            .collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    /// Ancestry of `rev`, newest first, including `rev` itself.
    pub fn chain(&self, rev: &Revision) -> Vec<Revision> {
        let mut chain = Vec::new();
        let mut cursor = Some(rev.clone());
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get(&current) else {
                break;
            };
            cursor = node.parent.clone();
            chain.push(current);
        }
        chain
    }

    /// Adds a new child of `parent` (or a root when `None`) and returns its
    /// revision.
    pub fn extend(
        &mut self,
        parent: Option<&Revision>,
        body: Map<String, Value>,
        deleted: bool,
    ) -> Revision {
        let generation = parent.map_or(0, Revision::generation) + 1;
        let rev = Revision::new(generation, content_hash(parent, deleted, &body));
        self.nodes.insert(
            rev.clone(),
            RevNode {
                parent: parent.cloned(),
                body: Some(body),
                deleted,
            },
        );
        rev
    }

    /// Grafts a revision chain (newest first) into the tree, keeping
    /// whatever is already present. Returns whether the leaf was new.
    pub fn graft(&mut self, chain: &[Revision], body: Map<String, Value>, deleted: bool) -> bool {
        let Some(leaf) = chain.first() else {
            return false;
        };
        let leaf_was_new = !self.contains(leaf);

        for (i, rev) in chain.iter().enumerate().rev() {
            let parent = chain.get(i + 1).cloned();
            self.nodes.entry(rev.clone()).or_insert(RevNode {
                parent,
                body: None,
                deleted: false,
            });
        }

        if let Some(node) = self.nodes.get_mut(leaf) {
            if leaf_was_new || node.body.is_none() {
                node.body = Some(body);
                node.deleted = deleted;
            }
        }
        leaf_was_new
    }
}

/// Deterministic hash of a new revision's content.
fn content_hash(parent: Option<&Revision>, deleted: bool, body: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    if let Some(parent) = parent {
        hasher.update(parent.to_string().as_bytes());
    }
    hasher.update([u8::from(deleted)]);
    hasher.update(Value::Object(body.clone()).to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}
