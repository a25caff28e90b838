use rusqlite::types::ToSql;

use crate::error::{ApiError, ApiResult};
use crate::models::query::{AttributeOp, QueryEnvelope};

/// Which telemetry table a query envelope targets. Each entity carries its
/// own column allow-lists; anything outside them is rejected before SQL is
/// composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Traces,
    Events,
}

impl Entity {
    pub fn table(self) -> &'static str {
        match self {
            Entity::Traces => "trace_spans",
            Entity::Events => "wide_events",
        }
    }

    fn where_columns(self) -> &'static [&'static str] {
        match self {
            Entity::Traces => &[
                "trace_id",
                "span_id",
                "parent_span_id",
                "service_name",
                "operation_name",
                "status",
            ],
            Entity::Events => &[
                "trace_id",
                "service_name",
                "operation_type",
                "field_name",
                "outcome",
                "user_id",
            ],
        }
    }

    fn range_columns(self) -> &'static [&'static str] {
        match self {
            Entity::Traces => &["start_time", "end_time", "duration_ms", "created_at"],
            Entity::Events => &["duration_ms", "error_count", "rpc_call_count", "created_at"],
        }
    }

    /// Columns covered by the free-text search, alongside the raw attributes
    /// JSON.
    fn text_columns(self) -> &'static [&'static str] {
        match self {
            Entity::Traces => &["service_name", "operation_name"],
            Entity::Events => &["service_name", "operation_type", "field_name", "outcome"],
        }
    }
}

/// The compiled conjunction: SQL fragments (all user values bound as `?`)
/// plus the parameter list in matching order. The caller prepends the
/// `drop_id = ?` guard and appends `LIMIT ? OFFSET ?`.
pub struct CompiledQuery {
    pub conditions: Vec<String>,
    pub params: Vec<Box<dyn ToSql + Send>>,
    pub limit: i64,
    pub offset: i64,
    pub order: &'static str,
}

/// `limit` below 1 falls back to the default page size; above 2000 is capped.
pub fn clamp_limit(limit: i64) -> i64 {
    if limit < 1 { 100 } else { limit.min(2000) }
}

pub fn clamp_offset(offset: i64) -> i64 {
    offset.max(0)
}

/// A dotted attribute key becomes a single quoted JSON path segment.
/// Backslashes and quotes inside the key are escaped so the key can never
/// terminate the path expression early.
pub fn json_path(key: &str) -> String {
    let escaped = key.replace('\\', "\\\\").replace('"', "\\\"");
    format!("$.\"{escaped}\"")
}

/// Substring pattern for LIKE with `%`, `_`, and `\` neutralized.
pub fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn bind_scalar(value: &serde_json::Value) -> ApiResult<Box<dyn ToSql + Send>> {
    match value {
        serde_json::Value::String(s) => Ok(Box::new(s.clone())),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Box::new(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Box::new(f))
            } else {
                Err(ApiError::BadInput("unsupported numeric value".to_string()))
            }
        }
        serde_json::Value::Bool(b) => Ok(Box::new(*b as i64)),
        other => Err(ApiError::BadInput(format!(
            "unsupported filter value: {other}"
        ))),
    }
}

fn numeric_value(value: Option<&serde_json::Value>) -> ApiResult<f64> {
    let value = value.ok_or_else(|| ApiError::BadInput("missing comparison value".to_string()))?;
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .ok_or_else(|| ApiError::BadInput("non-finite comparison value".to_string())),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .ok_or_else(|| ApiError::BadInput(format!("not a number: {s}"))),
        other => Err(ApiError::BadInput(format!("not a number: {other}"))),
    }
}

/// Compile the envelope into a parameterized conjunction for `entity`.
pub fn compile(entity: Entity, env: &QueryEnvelope) -> ApiResult<CompiledQuery> {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<Box<dyn ToSql + Send>> = Vec::new();

    // Free-text substring search across name-typed columns and the raw JSON.
    if let Some(q) = env.q.as_deref() {
        let q = q.trim();
        if !q.is_empty() {
            let pattern = like_pattern(q);
            let mut ors: Vec<String> = Vec::new();
            for col in entity.text_columns() {
                ors.push(format!("{col} LIKE ? ESCAPE '\\'"));
                params.push(Box::new(pattern.clone()));
            }
            ors.push("attributes LIKE ? ESCAPE '\\'".to_string());
            params.push(Box::new(pattern));
            conditions.push(format!("({})", ors.join(" OR ")));
        }
    }

    // Scalar equality over the per-entity allow-list.
    for (column, value) in &env.where_ {
        if !entity.where_columns().contains(&column.as_str()) {
            return Err(ApiError::BadInput(format!(
                "unknown filter column: {column}"
            )));
        }
        conditions.push(format!("{column} = ?"));
        params.push(bind_scalar(value)?);
    }

    // Range bounds over allow-listed numeric/time columns.
    for (column, bound) in &env.range {
        if !entity.range_columns().contains(&column.as_str()) {
            return Err(ApiError::BadInput(format!(
                "unknown range column: {column}"
            )));
        }
        if let Some(gte) = bound.gte {
            conditions.push(format!("{column} >= ?"));
            params.push(Box::new(gte));
        }
        if let Some(lte) = bound.lte {
            conditions.push(format!("{column} <= ?"));
            params.push(Box::new(lte));
        }
    }

    // Attribute predicates pushed into the JSON blob. The path itself is a
    // bound parameter, so hostile keys cannot escape into the SQL text.
    for pred in &env.attributes {
        let path = json_path(&pred.key);
        match pred.op {
            AttributeOp::Exists => {
                conditions.push("json_type(attributes, ?) IS NOT NULL".to_string());
                params.push(Box::new(path));
            }
            AttributeOp::Eq => {
                let value = pred.value.as_ref().ok_or_else(|| {
                    ApiError::BadInput("missing value for eq predicate".to_string())
                })?;
                match value {
                    serde_json::Value::Number(_) => {
                        conditions
                            .push("CAST(json_extract(attributes, ?) AS REAL) = ?".to_string());
                        params.push(Box::new(path));
                        params.push(Box::new(numeric_value(Some(value))?));
                    }
                    _ => {
                        conditions.push("json_extract(attributes, ?) = ?".to_string());
                        params.push(Box::new(path));
                        params.push(bind_scalar(value)?);
                    }
                }
            }
            AttributeOp::Like => {
                let term = pred
                    .value
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ApiError::BadInput("like predicate requires a string value".to_string())
                    })?;
                conditions.push("json_extract(attributes, ?) LIKE ? ESCAPE '\\'".to_string());
                params.push(Box::new(path));
                params.push(Box::new(like_pattern(term)));
            }
            AttributeOp::Gt | AttributeOp::Gte | AttributeOp::Lt | AttributeOp::Lte => {
                let op = match pred.op {
                    AttributeOp::Gt => ">",
                    AttributeOp::Gte => ">=",
                    AttributeOp::Lt => "<",
                    _ => "<=",
                };
                conditions.push(format!("CAST(json_extract(attributes, ?) AS REAL) {op} ?"));
                params.push(Box::new(path));
                params.push(Box::new(numeric_value(pred.value.as_ref())?));
            }
        }
    }

    Ok(CompiledQuery {
        conditions,
        params,
        limit: clamp_limit(env.limit),
        offset: clamp_offset(env.offset),
        order: env.order.as_sql(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::query::{AttributePredicate, Order, RangeBound};

    fn envelope() -> QueryEnvelope {
        QueryEnvelope::default()
    }

    #[test]
    fn limit_clamps() {
        assert_eq!(clamp_limit(0), 100);
        assert_eq!(clamp_limit(-5), 100);
        assert_eq!(clamp_limit(1), 1);
        assert_eq!(clamp_limit(2000), 2000);
        assert_eq!(clamp_limit(5000), 2000);
        assert_eq!(clamp_offset(-1), 0);
        assert_eq!(clamp_offset(7), 7);
    }

    #[test]
    fn json_path_quotes_dotted_keys_and_escapes() {
        assert_eq!(json_path("duration.total_ms"), "$.\"duration.total_ms\"");
        assert_eq!(json_path("we\"ird"), "$.\"we\\\"ird\"");
        assert_eq!(json_path("back\\slash"), "$.\"back\\\\slash\"");
    }

    #[test]
    fn like_pattern_neutralizes_wildcards() {
        assert_eq!(like_pattern("a%b_c"), "%a\\%b\\_c%");
    }

    #[test]
    fn unknown_where_column_is_rejected() {
        let mut env = envelope();
        env.where_
            .insert("evil; DROP TABLE".to_string(), serde_json::json!("x"));
        assert!(compile(Entity::Events, &env).is_err());
    }

    #[test]
    fn unknown_range_column_is_rejected() {
        let mut env = envelope();
        env.range
            .insert("attributes".to_string(), RangeBound::default());
        assert!(compile(Entity::Traces, &env).is_err());
    }

    #[test]
    fn where_and_range_compile_to_parameterized_conjunction() {
        let mut env = envelope();
        env.where_
            .insert("service_name".to_string(), serde_json::json!("gw"));
        env.range.insert(
            "duration_ms".to_string(),
            RangeBound {
                gte: Some(10.0),
                lte: Some(500.0),
            },
        );
        let compiled = compile(Entity::Events, &env).unwrap();
        assert_eq!(compiled.conditions.len(), 3);
        assert_eq!(compiled.params.len(), 3);
        assert!(
            compiled
                .conditions
                .contains(&"service_name = ?".to_string())
        );
        assert!(
            compiled
                .conditions
                .contains(&"duration_ms >= ?".to_string())
        );
        assert!(
            compiled
                .conditions
                .contains(&"duration_ms <= ?".to_string())
        );
    }

    #[test]
    fn attribute_ops_compile() {
        let mut env = envelope();
        env.attributes = vec![
            AttributePredicate {
                key: "a".to_string(),
                op: AttributeOp::Gte,
                value: Some(serde_json::json!(2)),
            },
            AttributePredicate {
                key: "user.id".to_string(),
                op: AttributeOp::Exists,
                value: None,
            },
            AttributePredicate {
                key: "route".to_string(),
                op: AttributeOp::Like,
                value: Some(serde_json::json!("/api")),
            },
        ];
        let compiled = compile(Entity::Events, &env).unwrap();
        assert_eq!(
            compiled.conditions[0],
            "CAST(json_extract(attributes, ?) AS REAL) >= ?"
        );
        assert_eq!(
            compiled.conditions[1],
            "json_type(attributes, ?) IS NOT NULL"
        );
        assert_eq!(
            compiled.conditions[2],
            "json_extract(attributes, ?) LIKE ? ESCAPE '\\'"
        );
        // gte: path + value, exists: path, like: path + pattern
        assert_eq!(compiled.params.len(), 5);
    }

    #[test]
    fn numeric_predicate_requires_a_number() {
        let mut env = envelope();
        env.attributes = vec![AttributePredicate {
            key: "a".to_string(),
            op: AttributeOp::Gt,
            value: Some(serde_json::json!({"nested": true})),
        }];
        assert!(compile(Entity::Events, &env).is_err());
    }

    #[test]
    fn order_and_clamps_flow_through() {
        let mut env = envelope();
        env.limit = 9_999;
        env.offset = -3;
        env.order = Order::Asc;
        let compiled = compile(Entity::Traces, &env).unwrap();
        assert_eq!(compiled.limit, 2000);
        assert_eq!(compiled.offset, 0);
        assert_eq!(compiled.order, "ASC");
    }
}
