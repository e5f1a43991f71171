//! Query and indexing engine for TideDB
//!
//! This crate implements the layers between the condition grammar and a
//! document store:
//! - compile: conditions to emit/output/settle predicate triples
//! - descriptor: content-addressed index definitions
//! - store: in-memory reference store with materialized views
//! - executor: grouped reads, lazy index creation, staleness rebuilds
//! - attached: atomic attached-document batches with bounded retry
//! - changes: handler pools over a single store subscription
//! - reactive: live query handles with timer and change-feed refresh
//! - database: the user-facing facade tying it all together

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attached;
pub mod changes;
pub mod compile;
pub mod database;
pub mod descriptor;
pub mod executor;
pub mod reactive;
pub mod store;

// Re-export commonly used types at the crate root
pub use changes::{AttachedHandler, ChangeFeed, DocHandler, HandlerToken};
pub use compile::{compile, CompiledConditions};
pub use database::{
    Configuration, Database, DatabaseOptions, Migration, MigrationCallback, ResetCallback,
    StoreFactory,
};
pub use descriptor::{IndexDescriptor, RowFilter, SortSpec};
pub use executor::{
    AttachedUpdatePredicate, QueryExecutor, QueryOptions, RawQueryRequest, RawQueryResponse,
    UpdatePredicate,
};
pub use reactive::{set_error_hook, ErrorHook, ReactiveHandle};
pub use store::MemoryStore;

// Re-export the core vocabulary so users need a single crate
pub use tide_core::{
    emit_rows, instant_secs, reduce, AttachedDocument, AttachedPredicates, AttachedWithParent,
    Change, ChangeHandler, Clock, CmpOp, ConditionGroup, Conditions, DocStore, Document,
    EmittedDoc, Error, FieldOp, Fields, GroupedQueryOptions, GroupedRow, IndexDefinition,
    IndexKey, KeySpec, ManualClock, Predicate, PutAttachedDocument, PutAttachedResponse,
    PutDocument, PutResponse, Reduced, Result, Rev, RowDoc, StorePut, SubscriptionId, SystemClock,
    TimeAnchor, TimeRef, TimeUnit, Value, SETTLE_MARGIN_SECS,
};
