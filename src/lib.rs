//! TideDB - Condition queries and live views over a document store
//!
//! TideDB layers declarative condition queries, content-addressed
//! secondary indexes and reactive result handles on top of a minimal
//! document store with optimistic concurrency.
//!
//! # Quick Start
//!
//! ```
//! use tidedb::{Conditions, Configuration, Database, DatabaseOptions, FieldOp, PutDocument,
//!     QueryOptions, Value};
//!
//! # fn main() -> tidedb::Result<()> {
//! let db = Database::open("demo", DatabaseOptions::default(), Configuration::default());
//!
//! db.put(PutDocument::new().with_id("alice").field("age", 32i64))?;
//! db.put(PutDocument::new().with_id("bob").field("age", 27i64))?;
//!
//! let adults = db.query(
//!     Conditions::field("age", FieldOp::Gte(Value::Number(30.0))),
//!     &QueryOptions::default(),
//! )?;
//! assert_eq!(adults.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! Conditions compile to predicate triples (emit / output / settle)
//! that define a content-addressed index; identical queries share one
//! index artifact. Time-relative conditions index conservatively and
//! re-filter exactly at read time, so results stay correct while the
//! index catches up lazily.

// Re-export the public API from tide-engine
pub use tide_engine::*;
