//! Filter, ordering and limit applied identically by both stores.
//!
//! The remote store receives the [`Query`] pushed down into its request; the
//! local cache evaluates it with [`Query::apply`] so a fallback read returns
//! rows in the same order with the same bound.

use crate::model::Row;
use serde_json::Value;
use std::cmp::Ordering;

/// Equality filter on one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(column.into(), value.into())
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(column, _) => column,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Eq(column, expected) => row
                .get(column)
                .is_some_and(|actual| values_equal(actual, expected)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Option<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query for a single row by primary key.
    pub fn by_id(id: i64) -> Self {
        Self::new().filter(Filter::eq("id", id)).limit(1)
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order_by = Some(OrderBy {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate the query over rows held locally.
    pub fn apply(&self, rows: Vec<Row>) -> Vec<Row> {
        let mut rows: Vec<Row> = match &self.filter {
            Some(filter) => rows.into_iter().filter(|row| filter.matches(row)).collect(),
            None => rows,
        };

        if let Some(order) = &self.order_by {
            rows.sort_by(|a, b| {
                let ordering = compare_values(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }

        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }

        rows
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over scalars; missing and null sort first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn sample() -> Vec<Row> {
        vec![
            row(json!({"id": 3, "name": "C", "zone": "north"})),
            row(json!({"id": 1, "name": "A", "zone": "south"})),
            row(json!({"id": 2, "name": "B", "zone": null})),
        ]
    }

    #[test]
    fn order_and_limit_are_applied_after_filtering() {
        let rows = Query::new()
            .order_by("id", false)
            .limit(2)
            .apply(sample());
        let ids: Vec<_> = rows.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn nulls_sort_first_ascending() {
        let rows = Query::new().order_by("zone", true).apply(sample());
        assert_eq!(rows[0]["id"], json!(2));
        assert_eq!(rows[1]["zone"], json!("north"));
    }

    #[test]
    fn eq_filter_compares_numbers_by_value() {
        let rows = Query::new()
            .filter(Filter::Eq("id".into(), json!(1.0)))
            .apply(sample());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("A"));
    }

    #[test]
    fn by_id_selects_single_row() {
        let rows = Query::by_id(2).apply(sample());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("B"));
    }

    #[test]
    fn missing_column_never_matches() {
        let rows = Query::new()
            .filter(Filter::eq("lock_key", "K1"))
            .apply(sample());
        assert!(rows.is_empty());
    }
}
