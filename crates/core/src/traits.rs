//! Store abstraction
//!
//! The query layer does not implement a storage engine; it assumes a
//! store exposing get/put/bulk-write by key, a change feed, and an
//! incremental grouped-index primitive. This trait is that boundary, so
//! implementations can be swapped without touching the layers above.

use crate::error::Result;
use crate::types::{AttachedDocument, Change, Document, Fields, PutResponse, Rev};
use crate::view::{GroupedQueryOptions, GroupedRow, IndexDefinition};
use std::sync::Arc;
use uuid::Uuid;

/// Callback invoked synchronously, in store order, for every committed write
///
/// Shared so that implementations can snapshot the handler set and fan
/// out after releasing their internal locks.
pub type ChangeHandler = Arc<dyn Fn(&Change) + Send + Sync>;

/// Token for a change-feed subscription at the store boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Fresh token
    pub fn new() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Store-level write request
///
/// Unlike the facade's put request, the attached sequence is fully
/// resolved here: the facade has already merged preserved entries and
/// recorded which positions the write touches.
#[derive(Debug, Clone, Default)]
pub struct StorePut {
    /// Target id; generated when omitted
    pub id: Option<String>,
    /// Revision guard; must match the stored revision
    pub rev: Option<Rev>,
    /// Soft-delete flag
    pub deleted: bool,
    /// User fields
    pub fields: Fields,
    /// Full attached sequence to store
    pub attached: Vec<AttachedDocument>,
    /// Attached positions touched by this write
    pub last_touched_attached: Vec<usize>,
}

/// Minimal document store consumed by the query layer
///
/// Thread safety: all methods must be safe to call concurrently
/// (requires `Send + Sync`). Writes to one document serialize through
/// the revision guard; the change feed delivers events in commit order.
pub trait DocStore: Send + Sync {
    /// Read a document by id, soft-deleted documents included
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn get(&self, id: &str) -> Result<Option<Document>>;

    /// Write a document under optimistic concurrency
    ///
    /// # Errors
    ///
    /// `Conflict` when the revision guard does not match the stored
    /// revision (or when creating over an existing id).
    fn put(&self, request: StorePut) -> Result<PutResponse>;

    /// Write several documents; per-document outcomes, in input order
    ///
    /// # Errors
    ///
    /// Returns an error only when the store itself fails; individual
    /// conflicts are reported in the per-document results.
    fn bulk_put(&self, requests: Vec<StorePut>) -> Result<Vec<Result<PutResponse>>>;

    /// Create an index artifact
    ///
    /// # Errors
    ///
    /// `Conflict` when an artifact with this id already exists.
    fn create_index(&self, id: &str, definition: IndexDefinition) -> Result<()>;

    /// Replace an existing artifact's definition in place and rebuild it
    ///
    /// # Errors
    ///
    /// `NotFound` when no artifact with this id exists.
    fn rebuild_index(&self, id: &str, definition: IndexDefinition) -> Result<()>;

    /// Grouped read over an index artifact
    ///
    /// # Errors
    ///
    /// `NotFound` when no artifact with this id exists.
    fn grouped_query(&self, index_id: &str, options: GroupedQueryOptions)
        -> Result<Vec<GroupedRow>>;

    /// Register a change handler; fires for every subsequent commit
    fn subscribe(&self, handler: ChangeHandler) -> SubscriptionId;

    /// Remove a change handler; unknown ids are ignored
    fn unsubscribe(&self, id: SubscriptionId);

    /// Drop all documents, index artifacts and subscriptions
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn destroy(&self) -> Result<()>;
}
