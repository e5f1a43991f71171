//! Core types and traits for Tide
//!
//! This crate defines the foundational types used throughout the system:
//! - Value: unified field value enum with collation order
//! - Document / AttachedDocument: the stored data model
//! - Conditions: the declarative condition grammar
//! - Predicate / IndexDefinition: the grouped-view boundary
//! - Clock: the time collaborator
//! - DocStore: the store abstraction the query layer runs against
//! - Error: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod condition;
pub mod error;
pub mod traits;
pub mod types;
pub mod value;
pub mod view;

pub use clock::{Clock, ManualClock, SystemClock};
pub use condition::{ConditionGroup, Conditions, FieldOp, TimeAnchor, TimeRef, TimeUnit};
pub use error::{Error, Result};
pub use traits::{ChangeHandler, DocStore, StorePut, SubscriptionId};
pub use types::{
    AttachedDocument, AttachedWithParent, Change, Document, Fields, PutAttachedDocument,
    PutAttachedResponse, PutDocument, PutResponse, Rev,
};
pub use value::Value;
pub use view::{
    emit_rows, instant_secs, reduce, AttachedPredicates, CmpOp, EmittedDoc, GroupedQueryOptions,
    GroupedRow, IndexDefinition, IndexKey, KeySpec, Predicate, Reduced, RowDoc,
    SETTLE_MARGIN_SECS,
};
