//! Query executor
//!
//! Resolves (or lazily creates) the index artifact for a compiled
//! condition shape, runs the grouped read, reconciles unsettled rows
//! against the read-time instant, triggers in-place rebuilds once
//! enough rows have newly settled, and post-processes results into
//! count/docs/unsettled-count form.

use crate::compile::compile;
use crate::descriptor::{self, IndexDescriptor, SortSpec};
use std::sync::Arc;
use tide_core::{
    Clock, Conditions, DocStore, Document, EmittedDoc, GroupedQueryOptions, GroupedRow, Result,
    RowDoc,
};
use tracing::debug;

/// Predicate gating change-feed refreshes of a document-level reactive handle
pub type UpdatePredicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

/// Predicate gating change-feed refreshes of an attached-level reactive handle
pub type AttachedUpdatePredicate =
    Arc<dyn Fn(&tide_core::AttachedWithParent) -> bool + Send + Sync>;

/// Query options
///
/// `update` and `update_interval` only matter for reactive handles;
/// plain queries ignore them.
#[derive(Clone, Default)]
pub struct QueryOptions {
    /// Field to sort by
    pub sort_by: Option<String>,
    /// Reverse the result order
    pub descending: bool,
    /// Maximum number of documents returned
    pub limit: Option<usize>,
    /// Documents skipped from the front of the result
    pub skip: Option<usize>,
    /// Interval for timer-driven reactive refresh
    pub update_interval: Option<std::time::Duration>,
    /// Change-feed refresh gate for document-level reactive handles
    pub update: Option<UpdatePredicate>,
    /// Change-feed refresh gate for attached-level reactive handles
    pub update_attached: Option<AttachedUpdatePredicate>,
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("sort_by", &self.sort_by)
            .field("descending", &self.descending)
            .field("limit", &self.limit)
            .field("skip", &self.skip)
            .field("update_interval", &self.update_interval)
            .finish_non_exhaustive()
    }
}

/// What a raw query should compute
#[derive(Debug, Clone, Default)]
pub struct RawQueryRequest {
    /// Conditions over the queried source (parent fields for plain
    /// queries, attached fields for attached queries)
    pub conditions: Conditions,
    /// Present for attached queries: conditions over the parent
    pub parent_conditions: Option<Conditions>,
    /// Compute the exact match count
    pub count: bool,
    /// Collect matching documents
    pub docs: bool,
    /// Compute the number of unsettled rows
    pub unsettled_count: bool,
}

/// Raw query result
#[derive(Debug, Clone, Default)]
pub struct RawQueryResponse {
    /// Exact match count (0 unless requested)
    pub count: usize,
    /// Matching documents in final order (empty unless requested)
    pub docs: Vec<EmittedDoc>,
    /// Unsettled row count (0 unless requested)
    pub unsettled_count: usize,
}

/// Executes raw queries against a store
pub struct QueryExecutor {
    clock: Arc<dyn Clock>,
    reindex_threshold: usize,
    case_sensitive_sorting: bool,
}

impl QueryExecutor {
    /// Create an executor
    pub fn new(clock: Arc<dyn Clock>, reindex_threshold: usize, case_sensitive_sorting: bool) -> Self {
        Self {
            clock,
            reindex_threshold,
            case_sensitive_sorting,
        }
    }

    fn descriptor(&self, options: &QueryOptions, raw: &RawQueryRequest) -> Result<IndexDescriptor> {
        let sort = SortSpec {
            sort_by: options.sort_by.clone(),
            descending: options.descending,
            case_sensitive: self.case_sensitive_sorting,
        };
        let compiled = compile(&raw.conditions)?;
        Ok(match &raw.parent_conditions {
            None => descriptor::build(&compiled, &sort),
            Some(parent) => {
                let parent_compiled = compile(parent)?;
                descriptor::build_attached(&compiled, &parent_compiled, &sort)
            }
        })
    }

    /// Run a raw query
    ///
    /// On "index not found" the artifact is created and the read retried
    /// exactly once; a duplicate create (a racing query built it first)
    /// counts as success. Any other store failure propagates unchanged.
    pub fn raw_query(
        &self,
        store: &dyn DocStore,
        options: &QueryOptions,
        raw: &RawQueryRequest,
    ) -> Result<RawQueryResponse> {
        let descriptor = self.descriptor(options, raw)?;

        let skip = options.skip.unwrap_or(0);
        let read = GroupedQueryOptions {
            group_level: if raw.count { 1 } else { descriptor.group_depth },
            descending: options.descending,
            limit: options.limit.map(|limit| limit + skip + 1),
        };

        let rows = match store.grouped_query(&descriptor.id, read.clone()) {
            Ok(rows) => rows,
            Err(e) if e.is_not_found() => {
                match store.create_index(&descriptor.id, descriptor.definition.clone()) {
                    Ok(()) => {}
                    // A racing query created it first; the artifact exists
                    // either way.
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e),
                }
                store.grouped_query(&descriptor.id, read)?
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();

        let newly_settled = rows
            .iter()
            .filter(|row| !row.value.settled)
            .flat_map(|row| row.value.docs.iter())
            .filter(|row_doc| descriptor.settle.matches(&row_doc.doc, now))
            .count();
        if newly_settled >= self.reindex_threshold {
            debug!(
                index = descriptor.id.as_str(),
                newly_settled, "staleness threshold crossed, rebuilding index"
            );
            store.rebuild_index(&descriptor.id, descriptor.definition.clone())?;
        }

        Ok(RawQueryResponse {
            count: if raw.count {
                self.exact_count(&descriptor, &rows, now)
            } else {
                0
            },
            docs: if raw.docs {
                self.collect_docs(&descriptor, rows.clone(), options, now)
            } else {
                Vec::new()
            },
            unsettled_count: if raw.unsettled_count {
                rows.iter()
                    .filter(|row| !row.value.settled)
                    .map(|row| row.value.docs.len())
                    .sum()
            } else {
                0
            },
        })
    }

    /// Settled groups contribute their pre-aggregated counts; unsettled
    /// groups are exact-filtered row by row.
    fn exact_count(
        &self,
        descriptor: &IndexDescriptor,
        rows: &[GroupedRow],
        now: chrono::DateTime<chrono::Utc>,
    ) -> usize {
        rows.iter()
            .map(|row| {
                if row.value.settled {
                    row.value.count
                } else {
                    row.value
                        .docs
                        .iter()
                        .filter(|row_doc| descriptor.output.matches(&row_doc.doc, now))
                        .count()
                }
            })
            .sum()
    }

    fn collect_docs(
        &self,
        descriptor: &IndexDescriptor,
        rows: Vec<GroupedRow>,
        options: &QueryOptions,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Vec<EmittedDoc> {
        let mut candidates: Vec<RowDoc> = rows
            .into_iter()
            .flat_map(|row| row.value.docs)
            .filter(|row_doc| descriptor.output.matches(&row_doc.doc, now))
            .collect();

        candidates.sort_by(|a, b| a.key.collate(&b.key));
        if options.descending {
            candidates.reverse();
        }

        let skip = options.skip.unwrap_or(0);
        let sliced: Box<dyn Iterator<Item = RowDoc>> = match options.limit {
            Some(limit) => Box::new(candidates.into_iter().skip(skip).take(limit)),
            None => Box::new(candidates.into_iter().skip(skip)),
        };
        sliced.map(|row_doc| row_doc.doc).collect()
    }
}
