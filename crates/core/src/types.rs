//! Document types
//!
//! This module defines:
//! - Rev: opaque parent document revision
//! - Document: stored parent document
//! - AttachedDocument: sub-document owned by a parent, addressed by position
//! - AttachedWithParent: attached document joined with its parent projection
//! - PutDocument / PutAttachedDocument: write requests
//! - PutResponse / PutAttachedResponse: write acknowledgements
//! - Change: one entry of the store's change feed

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Field map of a document or attached document
pub type Fields = BTreeMap<String, Value>;

/// Opaque parent document revision
///
/// Encoded as `<generation>-<token>`. Only the store interprets the
/// generation; callers must treat the whole string as opaque and hand it
/// back unchanged on the next write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rev(String);

impl Rev {
    /// First revision of a new document
    pub fn first() -> Self {
        Rev(format!("1-{}", token()))
    }

    /// Successor revision
    pub fn next(&self) -> Self {
        Rev(format!("{}-{}", self.generation() + 1, token()))
    }

    /// Generation counter encoded in the revision
    pub fn generation(&self) -> u64 {
        self.0
            .split('-')
            .next()
            .and_then(|g| g.parse().ok())
            .unwrap_or(0)
    }

    /// The revision as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Rev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn token() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Stored parent document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id
    pub id: String,
    /// Current revision
    pub rev: Rev,
    /// Soft-delete flag; deleted documents are never physically removed
    pub deleted: bool,
    /// User fields
    pub fields: Fields,
    /// Attached documents; positional arena, tombstoned rather than compacted
    pub attached: Vec<AttachedDocument>,
    /// Attached positions touched by the most recent write
    ///
    /// Lets the change feed expand only the entries that changed instead
    /// of re-scanning the whole sequence.
    pub last_touched_attached: Vec<usize>,
}

impl Document {
    /// Field lookup
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Copy of this document with the attached sequence stripped
    ///
    /// This is the projection handed to document-level readers and change
    /// handlers; attached content is only reachable through the attached
    /// accessors.
    pub fn parent_projection(&self) -> Document {
        Document {
            attached: Vec::new(),
            ..self.clone()
        }
    }
}

/// Attached sub-document
///
/// Exclusively owned by its parent; `id` equals its index in the parent's
/// attached sequence and never changes. `rev` is a local counter that
/// increases by exactly 1 per successful write to this position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedDocument {
    /// Position in the parent's attached sequence
    pub id: usize,
    /// Local revision counter
    pub rev: u64,
    /// Tombstone flag; slots are never reclaimed
    pub deleted: bool,
    /// User fields
    pub fields: Fields,
}

impl AttachedDocument {
    /// Field lookup
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Attached document joined with its parent's projection
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedWithParent {
    /// The attached document
    pub attached: AttachedDocument,
    /// Parent document with its attached sequence stripped
    pub parent: Document,
}

/// Write request for a parent document
#[derive(Debug, Clone, Default)]
pub struct PutDocument {
    /// Target id; omitted for creation with a generated id
    pub id: Option<String>,
    /// Revision read previously; must be present for updates
    pub rev: Option<Rev>,
    /// Soft-delete request
    pub deleted: bool,
    /// User fields
    pub fields: Fields,
    /// Attached sequence handling:
    /// - `None` stores the document without attached entries
    /// - `Some(empty)` preserves the currently stored sequence
    /// - `Some(entries)` replaces the full sequence (ids must match positions)
    pub attached: Option<Vec<AttachedDocument>>,
}

impl PutDocument {
    /// New empty put request
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the document id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the revision for an update
    pub fn with_rev(mut self, rev: Rev) -> Self {
        self.rev = Some(rev);
        self
    }

    /// Set a field
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Acknowledgement of a parent document write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResponse {
    /// Document id (generated when the request omitted one)
    pub id: String,
    /// Newly assigned revision
    pub rev: Rev,
}

/// Write request for an attached document
#[derive(Debug, Clone, Default)]
pub struct PutAttachedDocument {
    /// Existing position for updates; omitted to append a new entry
    pub id: Option<usize>,
    /// Stored local revision for updates; must match or the write conflicts
    pub rev: Option<u64>,
    /// Tombstone request
    pub deleted: bool,
    /// User fields
    pub fields: Fields,
}

impl PutAttachedDocument {
    /// New empty attached put request
    pub fn new() -> Self {
        Self::default()
    }

    /// Target an existing position
    pub fn with_id(mut self, id: usize) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the local revision for an update
    pub fn with_rev(mut self, rev: u64) -> Self {
        self.rev = Some(rev);
        self
    }

    /// Set a field
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Acknowledgement of an attached document write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutAttachedResponse {
    /// Position of the attached document
    pub id: usize,
    /// New local revision
    pub rev: u64,
    /// Parent document id
    pub parent_id: String,
    /// Parent revision assigned by the carrying write
    pub parent_rev: Rev,
}

/// One entry of the store's change feed
#[derive(Debug, Clone)]
pub struct Change {
    /// Store-assigned sequence number; delivery follows this order
    pub seq: u64,
    /// The document as stored after the change, attached sequence included
    pub doc: Document,
}
