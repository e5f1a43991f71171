//! Condition compiler
//!
//! Turns a structured condition set into three predicate trees:
//!
//! - `to_emit`: necessary and time-insensitive; decides whether a row is
//!   emitted into the index at all. For time-relative operators this is
//!   conservative (the field parses as an instant, plus a lower bound
//!   for operators whose match set only shrinks as time passes).
//! - `to_output`: the exact condition, evaluated against the read-time
//!   instant to accept rows.
//! - `to_settle`: true once the predicate's truth can never change
//!   again; decides whether a row's indexed position can be trusted
//!   without re-filtering.
//!
//! Field conditions join with logical AND. An empty condition set
//! compiles to the constant `true`; an impossible AND (a constant
//! `false` term) is rejected as a validation failure instead of
//! silently compiling to `false`.

use tide_core::{CmpOp, Conditions, Error, FieldOp, Predicate, Result, TimeRef, Value};

/// Compiled predicate triple for one evaluation source
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledConditions {
    /// Emit guard
    pub to_emit: Predicate,
    /// Exact read-time filter
    pub to_output: Predicate,
    /// Settle classification
    pub to_settle: Predicate,
}

/// Compile a condition set
///
/// # Errors
///
/// `Validation` for unsupported operand types (anything other than
/// bool, number or string) and for impossible constant conjunctions.
pub fn compile(conditions: &Conditions) -> Result<CompiledConditions> {
    let mut to_emit = Vec::new();
    let mut to_output = Vec::new();
    let mut to_settle = Vec::new();

    for group in conditions.iter() {
        for (field, op) in group.iter() {
            compile_op(field, op, &mut to_emit, &mut to_output, &mut to_settle)?;
        }
    }

    Ok(CompiledConditions {
        to_emit: and(to_emit)?,
        to_output: and(to_output)?,
        to_settle: and(to_settle)?,
    })
}

fn compile_op(
    field: &str,
    op: &FieldOp,
    to_emit: &mut Vec<Predicate>,
    to_output: &mut Vec<Predicate>,
    to_settle: &mut Vec<Predicate>,
) -> Result<()> {
    match op {
        FieldOp::IsSet(true) => to_emit.push(Predicate::IsSet { field: field.into() }),
        FieldOp::IsSet(false) => to_emit.push(Predicate::IsUnset { field: field.into() }),

        // Direct comparisons are time-insensitive: they are both
        // necessary and exact, so the emit guard alone filters them.
        FieldOp::Eq(v) => to_emit.push(cmp(field, CmpOp::Eq, v)?),
        FieldOp::Neq(v) => to_emit.push(cmp(field, CmpOp::Neq, v)?),
        FieldOp::Gt(v) => to_emit.push(cmp(field, CmpOp::Gt, v)?),
        FieldOp::Gte(v) => to_emit.push(cmp(field, CmpOp::Gte, v)?),
        FieldOp::Lt(v) => to_emit.push(cmp(field, CmpOp::Lt, v)?),
        FieldOp::Lte(v) => to_emit.push(cmp(field, CmpOp::Lte, v)?),

        // Match set shrinks as time passes: once the field falls behind
        // the reference by the settle window, gt/gte/eq can never hold
        // again. Bound the emit guard so such rows are never indexed.
        FieldOp::DateGt(rel) => time_op(field, CmpOp::Gt, *rel, true, to_emit, to_output, to_settle),
        FieldOp::DateGte(rel) => {
            time_op(field, CmpOp::Gte, *rel, true, to_emit, to_output, to_settle)
        }
        FieldOp::DateEq(rel) => time_op(field, CmpOp::Eq, *rel, true, to_emit, to_output, to_settle),

        // Settled rows keep matching forever, so they stay emitted.
        FieldOp::DateNeq(rel) => {
            time_op(field, CmpOp::Neq, *rel, false, to_emit, to_output, to_settle)
        }
        FieldOp::DateLt(rel) => time_op(field, CmpOp::Lt, *rel, false, to_emit, to_output, to_settle),
        FieldOp::DateLte(rel) => {
            time_op(field, CmpOp::Lte, *rel, false, to_emit, to_output, to_settle)
        }
    }
    Ok(())
}

fn cmp(field: &str, op: CmpOp, value: &Value) -> Result<Predicate> {
    match value {
        Value::Bool(_) | Value::Number(_) | Value::String(_) => Ok(Predicate::Cmp {
            field: field.into(),
            op,
            value: value.clone(),
        }),
        other => Err(Error::validation(format!(
            "unsupported condition operand type: {}",
            other.type_name()
        ))),
    }
}

fn time_op(
    field: &str,
    op: CmpOp,
    rel: TimeRef,
    bounded: bool,
    to_emit: &mut Vec<Predicate>,
    to_output: &mut Vec<Predicate>,
    to_settle: &mut Vec<Predicate>,
) {
    to_emit.push(Predicate::TimeEmittable {
        field: field.into(),
        rel,
        bounded,
    });
    to_output.push(Predicate::TimeCmp {
        field: field.into(),
        op,
        rel,
    });
    to_settle.push(Predicate::TimeSettled {
        field: field.into(),
        rel,
    });
}

/// AND-join predicates, dropping constant-true terms
///
/// # Errors
///
/// `Validation` when a constant `false` term makes the conjunction
/// impossible.
fn and(mut parts: Vec<Predicate>) -> Result<Predicate> {
    parts.retain(|p| *p != Predicate::Const(true));
    if parts.iter().any(|p| *p == Predicate::Const(false)) {
        return Err(Error::validation("impossible condition: constant false term"));
    }
    Ok(match parts.len() {
        0 => Predicate::Const(true),
        1 => parts.into_iter().next().unwrap(),
        _ => Predicate::And(parts),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tide_core::{ConditionGroup, Fields, TimeAnchor};

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_empty_conditions_compile_to_true() {
        let compiled = compile(&Conditions::new()).unwrap();
        assert_eq!(compiled.to_emit, Predicate::Const(true));
        assert_eq!(compiled.to_output, Predicate::Const(true));
        assert_eq!(compiled.to_settle, Predicate::Const(true));
    }

    #[test]
    fn test_group_sequence_is_logical_and() {
        // [{x: gt 1}, {x: lt 3}] means 1 < x < 3.
        let conds = Conditions::new()
            .group(ConditionGroup::new().field("x", FieldOp::Gt(Value::Number(1.0))))
            .group(ConditionGroup::new().field("x", FieldOp::Lt(Value::Number(3.0))));
        let compiled = compile(&conds).unwrap();

        let eval = |x: f64| {
            let mut f = Fields::new();
            f.insert("x".into(), Value::Number(x));
            compiled.to_emit.eval(&f, now())
        };
        assert!(!eval(1.0));
        assert!(eval(2.0));
        assert!(!eval(3.0));
    }

    #[test]
    fn test_scalar_ops_do_not_touch_output_or_settle() {
        let conds = Conditions::field("x", FieldOp::Eq(Value::Bool(true)));
        let compiled = compile(&conds).unwrap();
        assert_ne!(compiled.to_emit, Predicate::Const(true));
        assert_eq!(compiled.to_output, Predicate::Const(true));
        assert_eq!(compiled.to_settle, Predicate::Const(true));
    }

    #[test]
    fn test_date_op_produces_all_three() {
        let conds = Conditions::field(
            "d",
            FieldOp::DateGt(TimeRef::anchor(TimeAnchor::Now)),
        );
        let compiled = compile(&conds).unwrap();
        assert!(matches!(
            compiled.to_emit,
            Predicate::TimeEmittable { bounded: true, .. }
        ));
        assert!(matches!(compiled.to_output, Predicate::TimeCmp { op: CmpOp::Gt, .. }));
        assert!(matches!(compiled.to_settle, Predicate::TimeSettled { .. }));
    }

    #[test]
    fn test_date_eq_is_bounded_on_emit() {
        // An equality against a moving reference stops matching for good
        // once the field is past the settle window, like gt/gte.
        let conds = Conditions::field("d", FieldOp::DateEq(TimeRef::anchor(TimeAnchor::Now)));
        let compiled = compile(&conds).unwrap();
        assert!(matches!(
            compiled.to_emit,
            Predicate::TimeEmittable { bounded: true, .. }
        ));
    }

    #[test]
    fn test_date_lt_and_neq_are_unbounded_on_emit() {
        let conds = Conditions::field(
            "d",
            FieldOp::DateLt(TimeRef::anchor(TimeAnchor::StartOfDay)),
        );
        let compiled = compile(&conds).unwrap();
        assert!(matches!(
            compiled.to_emit,
            Predicate::TimeEmittable { bounded: false, .. }
        ));

        let conds = Conditions::field("d", FieldOp::DateNeq(TimeRef::anchor(TimeAnchor::Now)));
        let compiled = compile(&conds).unwrap();
        assert!(matches!(
            compiled.to_emit,
            Predicate::TimeEmittable { bounded: false, .. }
        ));
    }

    #[test]
    fn test_unsupported_operand_type_names_the_type() {
        let conds = Conditions::field("x", FieldOp::Eq(Value::Array(vec![])));
        let err = compile(&conds).unwrap_err();
        assert!(err.to_string().contains("array"), "got: {err}");

        let conds = Conditions::field("x", FieldOp::Gt(Value::Null));
        let err = compile(&conds).unwrap_err();
        assert!(err.to_string().contains("null"));
    }

    #[test]
    fn test_impossible_conjunction_rejected() {
        let err = and(vec![Predicate::Const(false), Predicate::IsSet { field: "x".into() }])
            .unwrap_err();
        assert!(err.to_string().contains("impossible"));
    }

    #[test]
    fn test_is_set_false_selects_absence() {
        let conds = Conditions::field("x", FieldOp::IsSet(false));
        let compiled = compile(&conds).unwrap();
        assert!(compiled.to_emit.eval(&Fields::new(), now()));
        let mut f = Fields::new();
        f.insert("x".into(), Value::Bool(false));
        assert!(!compiled.to_emit.eval(&f, now()));
    }
}
