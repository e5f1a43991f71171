//! Declarative condition grammar
//!
//! A condition maps field names to operator applications. Supported
//! operators per field:
//!
//! - `isSet: bool`
//! - `eq / neq / gt / gte / lt / lte` over bool, number or string
//! - `dateEq / dateNeq / dateGt / dateGte / dateLt / dateLte` against a
//!   symbolic time reference (anchor, optionally offset by a signed
//!   amount of a unit)
//!
//! A query argument is a single group or a sequence of groups; a
//! sequence is a pure logical AND across all contained field conditions,
//! so `[{x: gt 1}, {x: lt 3}]` means `1 < x < 3`.

use crate::value::Value;
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Symbolic time anchor, resolved against an explicit `now`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeAnchor {
    /// The evaluation instant itself
    Now,
    /// Midnight at the start of the current day
    StartOfDay,
    /// Midnight at the end of the current day
    EndOfDay,
    /// Start of the current hour
    StartOfHour,
    /// End of the current hour
    EndOfHour,
    /// Start of the current ISO week (Monday 00:00)
    StartOfWeek,
    /// End of the current ISO week
    EndOfWeek,
    /// Start of the current month
    StartOfMonth,
    /// End of the current month
    EndOfMonth,
}

impl TimeAnchor {
    /// Inherent resolution of the anchor in seconds
    ///
    /// The widest amount the resolved instant can move between two
    /// evaluations; feeds the settle safety margin.
    pub fn resolution_secs(&self) -> i64 {
        match self {
            TimeAnchor::Now => 0,
            TimeAnchor::StartOfHour | TimeAnchor::EndOfHour => 3600,
            TimeAnchor::StartOfDay | TimeAnchor::EndOfDay => 86_400,
            TimeAnchor::StartOfWeek | TimeAnchor::EndOfWeek => 7 * 86_400,
            TimeAnchor::StartOfMonth | TimeAnchor::EndOfMonth => 31 * 86_400,
        }
    }

    /// Resolve the anchor relative to `now`
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let start_of_day = Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .unwrap();
        match self {
            TimeAnchor::Now => now,
            TimeAnchor::StartOfDay => start_of_day,
            TimeAnchor::EndOfDay => start_of_day + Duration::days(1),
            TimeAnchor::StartOfHour => now
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now),
            TimeAnchor::EndOfHour => TimeAnchor::StartOfHour.resolve(now) + Duration::hours(1),
            TimeAnchor::StartOfWeek => {
                let days = now.weekday().num_days_from_monday() as i64;
                start_of_day - Duration::days(days)
            }
            TimeAnchor::EndOfWeek => TimeAnchor::StartOfWeek.resolve(now) + Duration::weeks(1),
            TimeAnchor::StartOfMonth => Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .unwrap(),
            TimeAnchor::EndOfMonth => {
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
            }
        }
    }
}

/// Offset unit for time references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    /// Seconds
    Seconds,
    /// Minutes
    Minutes,
    /// Hours
    Hours,
    /// Days
    Days,
}

impl TimeUnit {
    /// Seconds per unit
    pub fn secs(&self) -> i64 {
        match self {
            TimeUnit::Seconds => 1,
            TimeUnit::Minutes => 60,
            TimeUnit::Hours => 3600,
            TimeUnit::Days => 86_400,
        }
    }
}

/// Symbolic time reference: an anchor plus a signed offset
///
/// The reference stays symbolic inside compiled predicates; every
/// evaluation site supplies its own `now`, so the same compiled shape
/// hashes to the same index id regardless of when it was compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRef {
    /// Symbolic anchor
    pub anchor: TimeAnchor,
    /// Signed offset amount
    pub amount: i64,
    /// Offset unit
    pub unit: TimeUnit,
}

impl TimeRef {
    /// Bare anchor without offset
    pub fn anchor(anchor: TimeAnchor) -> Self {
        Self {
            anchor,
            amount: 0,
            unit: TimeUnit::Seconds,
        }
    }

    /// Anchor shifted by a signed amount of a unit
    pub fn offset(anchor: TimeAnchor, amount: i64, unit: TimeUnit) -> Self {
        Self { anchor, amount, unit }
    }

    /// Resolve to epoch seconds relative to `now`
    pub fn resolve_secs(&self, now: DateTime<Utc>) -> i64 {
        self.anchor.resolve(now).timestamp() + self.amount * self.unit.secs()
    }
}

/// One operator applied to a field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    /// Field presence (`isSet: false` selects documents without the field)
    IsSet(bool),
    /// Equality
    Eq(Value),
    /// Inequality
    Neq(Value),
    /// Greater-than
    Gt(Value),
    /// Greater-or-equal
    Gte(Value),
    /// Less-than
    Lt(Value),
    /// Less-or-equal
    Lte(Value),
    /// Field instant equals the reference
    DateEq(TimeRef),
    /// Field instant differs from the reference
    DateNeq(TimeRef),
    /// Field instant after the reference
    DateGt(TimeRef),
    /// Field instant at or after the reference
    DateGte(TimeRef),
    /// Field instant before the reference
    DateLt(TimeRef),
    /// Field instant at or before the reference
    DateLte(TimeRef),
}

/// One condition group: field name to applied operators
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionGroup {
    entries: Vec<(String, FieldOp)>,
}

impl ConditionGroup {
    /// Empty group (compiles to the constant `true`)
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an operator to a field
    pub fn field(mut self, name: impl Into<String>, op: FieldOp) -> Self {
        self.entries.push((name.into(), op));
        self
    }

    /// Iterate (field, operator) pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &(String, FieldOp)> {
        self.entries.iter()
    }

    /// True when the group carries no operators
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A full condition set: one or more AND-joined groups
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions {
    groups: Vec<ConditionGroup>,
}

impl Conditions {
    /// Empty condition set (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group
    pub fn group(mut self, group: ConditionGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Shorthand for a single-group condition on one field
    pub fn field(name: impl Into<String>, op: FieldOp) -> Self {
        Conditions::new().group(ConditionGroup::new().field(name, op))
    }

    /// Iterate groups
    pub fn iter(&self) -> impl Iterator<Item = &ConditionGroup> {
        self.groups.iter()
    }
}

impl From<ConditionGroup> for Conditions {
    fn from(group: ConditionGroup) -> Self {
        Conditions::new().group(group)
    }
}
