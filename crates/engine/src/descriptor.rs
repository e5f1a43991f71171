//! Index descriptor builder
//!
//! From compiled predicates and a sort specification, derives the
//! complete definition of an index artifact: emit/settle logic, the
//! ordering-key spec, read-time filters, the grouping depth, and a
//! stable content-addressed identifier.
//!
//! Two queries with identical compiled predicates and sort spec always
//! resolve to the same descriptor id; the id never depends on document
//! content, so previously built artifacts are reused without
//! recompilation.

use crate::compile::CompiledConditions;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tide_core::{
    AttachedPredicates, EmittedDoc, IndexDefinition, KeySpec, Predicate,
};

/// Read-time row filter over emitted documents
#[derive(Debug, Clone)]
pub struct RowFilter {
    parent: Predicate,
    attached: Option<Predicate>,
}

impl RowFilter {
    /// Evaluate the filter against an emitted row at the given instant
    pub fn matches(&self, doc: &EmittedDoc, now: chrono::DateTime<chrono::Utc>) -> bool {
        match (doc, &self.attached) {
            (EmittedDoc::Parent(doc), _) => self.parent.eval(&doc.fields, now),
            (EmittedDoc::Attached(row), Some(attached)) => {
                attached.eval(&row.attached.fields, now) && self.parent.eval(&row.parent.fields, now)
            }
            // Attached row against a parent-scope filter: parent fields only.
            (EmittedDoc::Attached(row), None) => self.parent.eval(&row.parent.fields, now),
        }
    }
}

/// Compiled, cacheable definition of a secondary index
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    /// Content-addressed identifier (hex SHA-256 over compiled inputs)
    pub id: String,
    /// Grouping depth for document reads (1 is used for count reads)
    pub group_depth: usize,
    /// What the store materializes
    pub definition: IndexDefinition,
    /// Exact read-time match filter
    pub output: RowFilter,
    /// Read-time settle re-check
    pub settle: RowFilter,
}

/// Sort inputs contributing to the descriptor
#[derive(Debug, Clone, Default)]
pub struct SortSpec {
    /// Field to sort by
    pub sort_by: Option<String>,
    /// Reverse the final order
    pub descending: bool,
    /// Disable case folding of string sort values
    pub case_sensitive: bool,
}

#[derive(Serialize)]
struct IdParams<'a> {
    conditions: [&'a Predicate; 3],
    parent_conditions: Option<[&'a Predicate; 3]>,
    sort_by: &'a Option<String>,
    descending: bool,
    case_sensitive: bool,
}

fn triple(compiled: &CompiledConditions) -> [&Predicate; 3] {
    [&compiled.to_emit, &compiled.to_output, &compiled.to_settle]
}

fn content_id(
    compiled: &CompiledConditions,
    parent: Option<&CompiledConditions>,
    sort: &SortSpec,
) -> String {
    let params = IdParams {
        conditions: triple(compiled),
        parent_conditions: parent.map(triple),
        sort_by: &sort.sort_by,
        descending: sort.descending,
        case_sensitive: sort.case_sensitive,
    };
    // Predicate serialization is deterministic (ordered maps, no floats
    // from user input reach the tree unquoted), so this hash is a pure
    // function of the compiled shape.
    let encoded = serde_json::to_vec(&params).expect("predicate trees always serialize");
    let digest = Sha256::digest(&encoded);
    let mut id = String::with_capacity(64);
    for byte in digest {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

/// Build the descriptor for a plain document query
pub fn build(compiled: &CompiledConditions, sort: &SortSpec) -> IndexDescriptor {
    IndexDescriptor {
        id: content_id(compiled, None, sort),
        group_depth: 3,
        definition: IndexDefinition {
            parent_emit: compiled.to_emit.clone(),
            parent_settle: compiled.to_settle.clone(),
            attached: None,
            key: key_spec(sort),
        },
        output: RowFilter {
            parent: compiled.to_output.clone(),
            attached: None,
        },
        settle: RowFilter {
            parent: compiled.to_settle.clone(),
            attached: None,
        },
    }
}

/// Build the descriptor for an attached document query
pub fn build_attached(
    compiled: &CompiledConditions,
    parent_compiled: &CompiledConditions,
    sort: &SortSpec,
) -> IndexDescriptor {
    IndexDescriptor {
        id: content_id(compiled, Some(parent_compiled), sort),
        group_depth: 4,
        definition: IndexDefinition {
            parent_emit: parent_compiled.to_emit.clone(),
            parent_settle: parent_compiled.to_settle.clone(),
            attached: Some(AttachedPredicates {
                emit: compiled.to_emit.clone(),
                settle: compiled.to_settle.clone(),
            }),
            key: key_spec(sort),
        },
        output: RowFilter {
            parent: parent_compiled.to_output.clone(),
            attached: Some(compiled.to_output.clone()),
        },
        settle: RowFilter {
            parent: parent_compiled.to_settle.clone(),
            attached: Some(compiled.to_settle.clone()),
        },
    }
}

fn key_spec(sort: &SortSpec) -> KeySpec {
    KeySpec {
        sort_by: sort.sort_by.clone(),
        descending: sort.descending,
        case_sensitive: sort.case_sensitive,
    }
}
