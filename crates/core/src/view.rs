//! Grouped-view boundary types
//!
//! The store's incremental grouped-index primitive executes a view
//! definition against every document. This module defines that boundary:
//!
//! - Predicate: typed predicate tree, interpreted directly (no runtime
//!   code generation)
//! - KeySpec / IndexKey: ordering-key generation and collation
//! - IndexDefinition: what the store materializes per index artifact
//! - Reduced / RowDoc / GroupedRow: the shape of grouped read results
//! - `emit_rows` / `reduce`: the emit and reduce logic shared by store
//!   implementations
//!
//! ## Ordering groups
//!
//! Documents are bucketed into four priority groups so sorting happens
//! purely through native key order:
//!
//! 1. unsettled rows
//! 2. settled, no sort field requested
//! 3. settled, sort value missing or empty
//! 4. settled, sort value present
//!
//! Group numbers are mirrored under descending order so that one final
//! reversal of the ascending read yields the requested order.

use crate::condition::TimeRef;
use crate::types::{AttachedWithParent, Document, Fields};
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;

/// Safety margin for settle classification: 25 hours, rounded to the hour
///
/// A row may keep a stale settled/unsettled classification for at most
/// this long past the anchor's own resolution.
pub const SETTLE_MARGIN_SECS: i64 = 25 * 3600;

/// Comparison operator inside predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CmpOp {
    /// Equal
    Eq,
    /// Not equal
    Neq,
    /// Greater than
    Gt,
    /// Greater or equal
    Gte,
    /// Less than
    Lt,
    /// Less or equal
    Lte,
}

impl CmpOp {
    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Neq => ord != Ordering::Equal,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Gte => ord != Ordering::Less,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Lte => ord != Ordering::Greater,
        }
    }
}

/// Typed predicate tree evaluated against a field map and an explicit `now`
///
/// Time references stay symbolic: index-build evaluation passes the
/// build moment, read-time evaluation passes the query moment. The tree
/// serializes deterministically, which is what the descriptor content
/// hash is computed over.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Predicate {
    /// Constant truth value
    Const(bool),
    /// All sub-predicates hold
    And(Vec<Predicate>),
    /// Field is present and non-null
    IsSet {
        /// Field name
        field: String,
    },
    /// Field is absent or null
    IsUnset {
        /// Field name
        field: String,
    },
    /// Direct scalar comparison; false on missing field or type mismatch
    /// (except `Neq`, which holds for a missing field)
    Cmp {
        /// Field name
        field: String,
        /// Operator
        op: CmpOp,
        /// Comparison operand
        value: Value,
    },
    /// Field instant compared against a resolved time reference
    TimeCmp {
        /// Field name
        field: String,
        /// Operator
        op: CmpOp,
        /// Symbolic reference resolved at evaluation
        rel: TimeRef,
    },
    /// Truth of the time comparison can no longer change: the field lies
    /// at least the anchor resolution plus [`SETTLE_MARGIN_SECS`] before
    /// the resolved reference
    TimeSettled {
        /// Field name
        field: String,
        /// Symbolic reference
        rel: TimeRef,
    },
    /// Conservative emit guard for time comparisons: the field parses as
    /// an instant and, when `bounded`, still lies within reach of the
    /// reference (rows safely past it can never match again)
    TimeEmittable {
        /// Field name
        field: String,
        /// Symbolic reference
        rel: TimeRef,
        /// Apply the conservative lower bound
        bounded: bool,
    },
}

/// Interpret a field value as epoch seconds
///
/// Accepts RFC 3339 strings and numeric epoch seconds.
pub fn instant_secs(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.timestamp()),
        Value::Number(n) if n.is_finite() => Some(*n as i64),
        _ => None,
    }
}

fn scalar_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl Predicate {
    /// Evaluate against a field map at the given instant
    pub fn eval(&self, fields: &Fields, now: DateTime<Utc>) -> bool {
        match self {
            Predicate::Const(b) => *b,
            Predicate::And(parts) => parts.iter().all(|p| p.eval(fields, now)),
            Predicate::IsSet { field } => fields.get(field).map_or(false, |v| !v.is_null()),
            Predicate::IsUnset { field } => fields.get(field).map_or(true, Value::is_null),
            Predicate::Cmp { field, op, value } => match fields.get(field) {
                Some(actual) => scalar_cmp(actual, value).map_or(false, |ord| op.accepts(ord)),
                None => *op == CmpOp::Neq,
            },
            Predicate::TimeCmp { field, op, rel } => {
                match fields.get(field).and_then(instant_secs) {
                    Some(at) => op.accepts(at.cmp(&rel.resolve_secs(now))),
                    None => false,
                }
            }
            Predicate::TimeSettled { field, rel } => {
                match fields.get(field).and_then(instant_secs) {
                    Some(at) => at < rel.resolve_secs(now) - settle_window(rel),
                    None => false,
                }
            }
            Predicate::TimeEmittable { field, rel, bounded } => {
                match fields.get(field).and_then(instant_secs) {
                    Some(at) => !bounded || at > rel.resolve_secs(now) - settle_window(rel),
                    None => false,
                }
            }
        }
    }
}

fn settle_window(rel: &TimeRef) -> i64 {
    rel.anchor.resolution_secs() + SETTLE_MARGIN_SECS
}

/// Ordering key emitted into an index
///
/// A sequence of values compared in collation order, element-wise, with
/// shorter keys sorting before their extensions.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKey(pub Vec<Value>);

impl IndexKey {
    /// Leading portion of the key used for grouping
    pub fn prefix(&self, depth: usize) -> IndexKey {
        IndexKey(self.0.iter().take(depth).cloned().collect())
    }

    /// Collation comparison
    pub fn collate(&self, other: &IndexKey) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let ord = a.collate(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.collate(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.collate(other)
    }
}

/// Sort specification baked into an index definition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeySpec {
    /// Field to sort by; `None` sorts by document id only
    pub sort_by: Option<String>,
    /// Reverse the final order
    pub descending: bool,
    /// Compare string sort values without case folding
    pub case_sensitive: bool,
}

impl KeySpec {
    /// Priority group number, mirrored under descending order
    fn group(&self, n: u8) -> Value {
        let n = if self.descending { 5 - n } else { n };
        Value::Number(f64::from(n))
    }

    fn tiebreak(&self, key: &mut Vec<Value>, doc_id: &str, attached_id: Option<usize>) {
        key.push(Value::String(doc_id.to_string()));
        if let Some(id) = attached_id {
            key.push(Value::Number(id as f64));
        }
    }

    /// Ordering key for a settled row
    pub fn settled_key(&self, fields: &Fields, doc_id: &str, attached_id: Option<usize>) -> IndexKey {
        let mut key = match &self.sort_by {
            None => vec![self.group(2), Value::Null],
            Some(field) => match fields.get(field) {
                Some(v) if !v.is_empty_for_sorting() => {
                    let v = match v {
                        Value::String(s) if !self.case_sensitive => {
                            Value::String(s.to_lowercase())
                        }
                        other => other.clone(),
                    };
                    vec![self.group(4), v]
                }
                _ => vec![self.group(3), Value::Null],
            },
        };
        self.tiebreak(&mut key, doc_id, attached_id);
        IndexKey(key)
    }

    /// Ordering key for an unsettled row
    ///
    /// One element longer than settled keys, so at document grouping
    /// depth every unsettled row lands in a single shared group and the
    /// reduce step keeps its per-document rows intact.
    pub fn unsettled_key(&self, doc_id: &str, attached_id: Option<usize>) -> IndexKey {
        let mut key = vec![self.group(1), Value::Null, Value::Null];
        self.tiebreak(&mut key, doc_id, attached_id);
        IndexKey(key)
    }
}

/// Predicates applied to attached entries of an attached-scope index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachedPredicates {
    /// Emit guard over attached fields
    pub emit: Predicate,
    /// Settle classification over attached fields
    pub settle: Predicate,
}

/// Complete definition of one index artifact
///
/// The store materializes one artifact per definition, keyed by the
/// descriptor id, with a single `default` view inside.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDefinition {
    /// Emit guard over parent fields
    pub parent_emit: Predicate,
    /// Settle classification over parent fields
    pub parent_settle: Predicate,
    /// Present for attached-scope indexes
    pub attached: Option<AttachedPredicates>,
    /// Ordering-key generation
    pub key: KeySpec,
}

/// A document as emitted into index rows
#[derive(Debug, Clone, PartialEq)]
pub enum EmittedDoc {
    /// Parent-scope row: document with attached sequence stripped
    Parent(Document),
    /// Attached-scope row: attached entry joined with parent projection
    Attached(AttachedWithParent),
}

/// One emitted document with its settled ordering key
#[derive(Debug, Clone, PartialEq)]
pub struct RowDoc {
    /// Settled ordering key, used for final sorting even while unsettled
    pub key: IndexKey,
    /// The emitted document
    pub doc: EmittedDoc,
}

/// Reduce accumulator for one group
#[derive(Debug, Clone, PartialEq)]
pub struct Reduced {
    /// Number of contributing rows
    pub count: usize,
    /// Per-document rows; settled shards collapse to their own list,
    /// unsettled shards concatenate so no row is lost before exact
    /// filtering
    pub docs: Vec<RowDoc>,
    /// True only when every contributing shard was settled
    pub settled: bool,
}

/// One row of a grouped read
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedRow {
    /// Group key (emit key truncated to the grouping depth)
    pub key: IndexKey,
    /// Reduced value for the group
    pub value: Reduced,
}

/// Options for a grouped read
#[derive(Debug, Clone, Default)]
pub struct GroupedQueryOptions {
    /// Grouping depth over emitted keys
    pub group_level: usize,
    /// Return groups in descending key order
    pub descending: bool,
    /// Upper bound on returned groups
    pub limit: Option<usize>,
}

/// Emit index rows for one document
///
/// This is the map step every store implementation runs, at index build
/// and whenever a document changes. `now` is the build/update moment;
/// the settled classification recorded here is exactly what goes stale
/// and what index rebuilds refresh.
pub fn emit_rows(
    def: &IndexDefinition,
    doc: &Document,
    now: DateTime<Utc>,
) -> Vec<(IndexKey, Reduced)> {
    if doc.deleted {
        return Vec::new();
    }
    match &def.attached {
        None => emit_parent_rows(def, doc, now),
        Some(attached) => emit_attached_rows(def, attached, doc, now),
    }
}

fn emit_parent_rows(
    def: &IndexDefinition,
    doc: &Document,
    now: DateTime<Utc>,
) -> Vec<(IndexKey, Reduced)> {
    if !def.parent_emit.eval(&doc.fields, now) {
        return Vec::new();
    }
    let settled = def.parent_settle.eval(&doc.fields, now);
    let sort_key = def.key.settled_key(&doc.fields, &doc.id, None);
    let emit_key = if settled {
        sort_key.clone()
    } else {
        def.key.unsettled_key(&doc.id, None)
    };
    vec![(
        emit_key,
        Reduced {
            count: 1,
            docs: vec![RowDoc {
                key: sort_key,
                doc: EmittedDoc::Parent(doc.parent_projection()),
            }],
            settled,
        },
    )]
}

fn emit_attached_rows(
    def: &IndexDefinition,
    attached: &AttachedPredicates,
    doc: &Document,
    now: DateTime<Utc>,
) -> Vec<(IndexKey, Reduced)> {
    if doc.attached.is_empty() || !def.parent_emit.eval(&doc.fields, now) {
        return Vec::new();
    }
    let parent_settled = def.parent_settle.eval(&doc.fields, now);
    let parent = doc.parent_projection();
    let mut rows = Vec::new();
    for entry in &doc.attached {
        if entry.deleted || !attached.emit.eval(&entry.fields, now) {
            continue;
        }
        let settled = parent_settled && attached.settle.eval(&entry.fields, now);
        let sort_key = def.key.settled_key(&entry.fields, &doc.id, Some(entry.id));
        let emit_key = if settled {
            sort_key.clone()
        } else {
            def.key.unsettled_key(&doc.id, Some(entry.id))
        };
        rows.push((
            emit_key,
            Reduced {
                count: 1,
                docs: vec![RowDoc {
                    key: sort_key,
                    doc: EmittedDoc::Attached(AttachedWithParent {
                        attached: entry.clone(),
                        parent: parent.clone(),
                    }),
                }],
                settled,
            },
        ));
    }
    rows
}

/// Reduce shard values of one group
///
/// Settled shards carry pre-aggregated lists and replace the running
/// list; an unsettled shard concatenates its raw rows forward so the
/// group never loses per-document information needed for exact
/// filtering later.
pub fn reduce<I>(values: I) -> Reduced
where
    I: IntoIterator<Item = Reduced>,
{
    let mut count = 0;
    let mut docs = Vec::new();
    let mut settled = false;
    for value in values {
        count += value.count;
        if value.settled {
            docs = value.docs;
        } else {
            docs.extend(value.docs);
        }
        settled = value.settled;
    }
    Reduced { count, docs, settled }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{TimeAnchor, TimeRef};
    use crate::types::Rev;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap()
    }

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn doc(id: &str, f: Fields) -> Document {
        Document {
            id: id.into(),
            rev: Rev::first(),
            deleted: false,
            fields: f,
            attached: Vec::new(),
            last_touched_attached: Vec::new(),
        }
    }

    fn plain_spec(sort_by: Option<&str>) -> KeySpec {
        KeySpec {
            sort_by: sort_by.map(String::from),
            descending: false,
            case_sensitive: false,
        }
    }

    #[test]
    fn test_cmp_predicate() {
        let f = fields(&[("x", Value::Number(2.0))]);
        let gt1 = Predicate::Cmp {
            field: "x".into(),
            op: CmpOp::Gt,
            value: Value::Number(1.0),
        };
        assert!(gt1.eval(&f, now()));
        let gt5 = Predicate::Cmp {
            field: "x".into(),
            op: CmpOp::Gt,
            value: Value::Number(5.0),
        };
        assert!(!gt5.eval(&f, now()));
    }

    #[test]
    fn test_cmp_missing_field() {
        let f = Fields::new();
        let eq = Predicate::Cmp {
            field: "x".into(),
            op: CmpOp::Eq,
            value: Value::Bool(true),
        };
        let neq = Predicate::Cmp {
            field: "x".into(),
            op: CmpOp::Neq,
            value: Value::Bool(true),
        };
        assert!(!eq.eval(&f, now()));
        assert!(neq.eval(&f, now()));
    }

    #[test]
    fn test_cmp_type_mismatch_is_false() {
        let f = fields(&[("x", Value::String("2".into()))]);
        let gt = Predicate::Cmp {
            field: "x".into(),
            op: CmpOp::Gt,
            value: Value::Number(1.0),
        };
        assert!(!gt.eval(&f, now()));
    }

    #[test]
    fn test_is_set_and_unset() {
        let f = fields(&[("x", Value::Null), ("y", Value::Bool(false))]);
        let set = |field: &str| Predicate::IsSet { field: field.into() };
        let unset = |field: &str| Predicate::IsUnset { field: field.into() };
        assert!(!set("x").eval(&f, now()));
        assert!(set("y").eval(&f, now()));
        assert!(unset("x").eval(&f, now()));
        assert!(unset("z").eval(&f, now()));
    }

    #[test]
    fn test_time_cmp_and_settle() {
        let rel = TimeRef::anchor(TimeAnchor::Now);
        let in_one_hour = now() + chrono::Duration::hours(1);
        let f = fields(&[("d", Value::String(in_one_hour.to_rfc3339()))]);
        let gt = Predicate::TimeCmp {
            field: "d".into(),
            op: CmpOp::Gt,
            rel,
        };
        let settled = Predicate::TimeSettled {
            field: "d".into(),
            rel,
        };
        assert!(gt.eval(&f, now()));
        assert!(!settled.eval(&f, now()));
        // Two hours later the comparison flips but stays unsettled.
        let later = now() + chrono::Duration::hours(2);
        assert!(!gt.eval(&f, later));
        assert!(!settled.eval(&f, later));
        // Past the margin the row settles.
        let much_later = now() + chrono::Duration::hours(27);
        assert!(settled.eval(&f, much_later));
    }

    #[test]
    fn test_time_emittable_bound() {
        let rel = TimeRef::anchor(TimeAnchor::Now);
        let long_ago = now() - chrono::Duration::hours(30);
        let f = fields(&[("d", Value::String(long_ago.to_rfc3339()))]);
        let bounded = Predicate::TimeEmittable {
            field: "d".into(),
            rel,
            bounded: true,
        };
        let unbounded = Predicate::TimeEmittable {
            field: "d".into(),
            rel,
            bounded: false,
        };
        assert!(!bounded.eval(&f, now()));
        assert!(unbounded.eval(&f, now()));
    }

    #[test]
    fn test_settled_key_groups() {
        let spec = plain_spec(Some("name"));
        let with_value = spec.settled_key(&fields(&[("name", Value::String("Ada".into()))]), "d1", None);
        assert_eq!(
            with_value.0,
            vec![
                Value::Number(4.0),
                Value::String("ada".into()),
                Value::String("d1".into())
            ]
        );
        let missing = spec.settled_key(&Fields::new(), "d1", None);
        assert_eq!(missing.0[0], Value::Number(3.0));
        let no_sort = plain_spec(None).settled_key(&Fields::new(), "d1", None);
        assert_eq!(no_sort.0[0], Value::Number(2.0));
    }

    #[test]
    fn test_descending_mirrors_groups() {
        let spec = KeySpec {
            sort_by: Some("name".into()),
            descending: true,
            case_sensitive: false,
        };
        let key = spec.settled_key(&fields(&[("name", Value::String("a".into()))]), "d", None);
        assert_eq!(key.0[0], Value::Number(1.0));
        assert_eq!(spec.unsettled_key("d", None).0[0], Value::Number(4.0));
    }

    #[test]
    fn test_case_sensitive_key_keeps_case() {
        let spec = KeySpec {
            sort_by: Some("name".into()),
            descending: false,
            case_sensitive: true,
        };
        let key = spec.settled_key(&fields(&[("name", Value::String("Ada".into()))]), "d", None);
        assert_eq!(key.0[1], Value::String("Ada".into()));
    }

    #[test]
    fn test_emit_skips_deleted_docs() {
        let def = IndexDefinition {
            parent_emit: Predicate::Const(true),
            parent_settle: Predicate::Const(true),
            attached: None,
            key: plain_spec(None),
        };
        let mut d = doc("d1", Fields::new());
        d.deleted = true;
        assert!(emit_rows(&def, &d, now()).is_empty());
    }

    #[test]
    fn test_emit_unsettled_key_shape() {
        let def = IndexDefinition {
            parent_emit: Predicate::Const(true),
            parent_settle: Predicate::Const(false),
            attached: None,
            key: plain_spec(None),
        };
        let rows = emit_rows(&def, &doc("d1", Fields::new()), now());
        assert_eq!(rows.len(), 1);
        let (emit_key, value) = &rows[0];
        assert_eq!(emit_key.0.len(), 4);
        assert_eq!(emit_key.0[0], Value::Number(1.0));
        assert!(!value.settled);
        // The row doc still carries its settled sort key.
        assert_eq!(value.docs[0].key.0[0], Value::Number(2.0));
    }

    #[test]
    fn test_reduce_concatenates_unsettled() {
        let row = |id: &str, settled: bool| Reduced {
            count: 1,
            docs: vec![RowDoc {
                key: IndexKey(vec![Value::String(id.into())]),
                doc: EmittedDoc::Parent(doc(id, Fields::new())),
            }],
            settled,
        };
        let out = reduce(vec![row("a", false), row("b", false)]);
        assert_eq!(out.count, 2);
        assert_eq!(out.docs.len(), 2);
        assert!(!out.settled);
    }

    #[test]
    fn test_index_key_prefix_grouping() {
        let key = IndexKey(vec![
            Value::Number(2.0),
            Value::Null,
            Value::String("d1".into()),
        ]);
        assert_eq!(key.prefix(1).0, vec![Value::Number(2.0)]);
        assert!(key.prefix(1) < key);
    }
}
