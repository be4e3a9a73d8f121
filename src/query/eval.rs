//! In-process evaluation of the filter DSL.
//!
//! Used by the engines that cannot (or do not) push a condition down: the
//! embedded store evaluates every condition here after a full scan, the
//! document store evaluates range conditions here.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::query::{FilterCondition, Operator, QuerySpec, SortDirection, SortSpec};
use crate::record::{Record, Value};

/// Equality with numeric widening and RFC 3339 text/datetime coercion.
/// A missing field equals `Null`.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => compare_values(left, right) == Some(Ordering::Equal),
    }
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Ordering between two values of compatible kinds; `None` when the kinds
/// cannot be compared (range filters never match in that case).
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
        (Value::DateTime(a), Value::Text(b)) => parse_datetime(b).map(|b| a.cmp(&b)),
        (Value::Text(a), Value::DateTime(b)) => parse_datetime(a).map(|a| a.cmp(b)),
        (Value::Json(a), Value::Json(b)) if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::Text(_) => 3,
        Value::DateTime(_) => 4,
        Value::Json(_) => 5,
    }
}

/// Total order used for sorting: nulls first, then by kind, then by value.
pub fn sort_order(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
        _ => match kind_rank(left).cmp(&kind_rank(right)) {
            Ordering::Equal => compare_values(left, right).unwrap_or(Ordering::Equal),
            other => other,
        },
    }
}

pub fn matches_condition(record: &Record, condition: &FilterCondition) -> bool {
    let actual = record.value_or_null(&condition.field);
    let values = condition.value.values();
    match condition.operator {
        Operator::Eq => values.first().is_some_and(|v| values_equal(actual, v)),
        Operator::Ne => values.first().is_some_and(|v| !values_equal(actual, v)),
        Operator::In => values.iter().any(|candidate| values_equal(actual, candidate)),
        op => {
            let Some(expected) = values.first() else {
                return false;
            };
            if actual.is_null() {
                return false;
            }
            match compare_values(actual, expected) {
                Some(ordering) => match op {
                    Operator::Gt => ordering == Ordering::Greater,
                    Operator::Gte => ordering != Ordering::Less,
                    Operator::Lt => ordering == Ordering::Less,
                    Operator::Lte => ordering != Ordering::Greater,
                    _ => false,
                },
                None => false,
            }
        }
    }
}

/// AND of every condition.
pub fn matches_all(record: &Record, conditions: &[FilterCondition]) -> bool {
    conditions.iter().all(|c| matches_condition(record, c))
}

/// Stable multi-key sort; the first spec is the primary key.
pub fn sort_records(records: &mut [Record], order_by: &[SortSpec]) {
    if order_by.is_empty() {
        return;
    }
    records.sort_by(|a, b| {
        for spec in order_by {
            let ordering = sort_order(a.value_or_null(&spec.field), b.value_or_null(&spec.field));
            let ordering = match spec.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Filter, sort, limit and project a scanned record set.
pub fn apply(records: Vec<Record>, query: &QuerySpec, limit: Option<usize>) -> Vec<Record> {
    let mut matched: Vec<Record> = records
        .into_iter()
        .filter(|record| matches_all(record, &query.conditions))
        .collect();
    sort_records(&mut matched, &query.order_by);
    if let Some(limit) = limit {
        matched.truncate(limit);
    }
    match &query.select {
        Some(select) => matched.into_iter().map(|r| r.project(select)).collect(),
        None => matched,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::{apply, matches_condition, sort_records};
    use crate::query::{FilterCondition, QuerySpec, SortSpec};
    use crate::record::{Record, Value};

    fn dataset() -> Vec<Record> {
        (1..=10)
            .map(|i| {
                Record::new()
                    .with("id", format!("r{i}"))
                    .with("x", i64::from(i))
                    .with("group", if i % 2 == 0 { "even" } else { "odd" })
            })
            .collect()
    }

    fn ids(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| r.id().map(str::to_string))
            .collect()
    }

    #[test]
    fn gte_filters_by_numeric_range() {
        let query = QuerySpec::new()
            .filter(FilterCondition::gte("x", 5))
            .order_by(SortSpec::asc("x"));
        let result = apply(dataset(), &query, None);
        assert_eq!(ids(&result), vec!["r5", "r6", "r7", "r8", "r9", "r10"]);
    }

    #[test]
    fn in_matches_any_listed_value() {
        let query = QuerySpec::new()
            .filter(FilterCondition::is_in("id", ["r2", "r4", "missing"]))
            .order_by(SortSpec::asc("x"));
        assert_eq!(ids(&apply(dataset(), &query, None)), vec!["r2", "r4"]);
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let query = QuerySpec::new().filter(FilterCondition::is_in("id", Vec::<String>::new()));
        assert!(apply(dataset(), &query, None).is_empty());
    }

    #[test]
    fn ne_includes_records_missing_the_field() {
        let record = Record::new().with("id", "a");
        assert!(matches_condition(&record, &FilterCondition::ne("workspaceId", "w1")));
        assert!(matches_condition(&record, &FilterCondition::eq("workspaceId", Value::Null)));
        assert!(!matches_condition(&record, &FilterCondition::gt("workspaceId", "a")));
    }

    #[test]
    fn multi_key_sort_honors_priority_and_is_stable() {
        let mut records = dataset();
        sort_records(
            &mut records,
            &[SortSpec::asc("group"), SortSpec::desc("x")],
        );
        assert_eq!(
            ids(&records),
            vec!["r10", "r8", "r6", "r4", "r2", "r9", "r7", "r5", "r3", "r1"]
        );

        let mut tied = vec![
            Record::new().with("id", "first").with("k", 1),
            Record::new().with("id", "second").with("k", 1),
        ];
        sort_records(&mut tied, &[SortSpec::asc("k")]);
        assert_eq!(ids(&tied), vec!["first", "second"]);
    }

    #[test]
    fn datetimes_compare_with_rfc3339_text() {
        let ts = chrono::Utc
            .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .single()
            .expect("valid ts");
        let record = Record::new().with("id", "a").with("createdAt", ts);
        assert!(matches_condition(
            &record,
            &FilterCondition::lt("createdAt", "2026-06-01T00:00:00Z")
        ));
        assert!(matches_condition(
            &record,
            &FilterCondition::eq("createdAt", "2026-01-01T00:00:00.000Z")
        ));
    }

    #[test]
    fn apply_limits_and_projects_after_sorting() {
        let query = QuerySpec::new()
            .order_by(SortSpec::desc("x"))
            .select(["id"]);
        let result = apply(dataset(), &query, Some(2));
        assert_eq!(
            result,
            vec![
                Record::new().with("id", "r10"),
                Record::new().with("id", "r9"),
            ]
        );
    }

    #[test]
    fn mismatched_kinds_never_satisfy_range_filters() {
        let record = Record::new().with("id", "a").with("x", "5");
        assert!(!matches_condition(&record, &FilterCondition::gte("x", 5)));
    }
}
