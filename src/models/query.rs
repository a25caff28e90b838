use serde::Deserialize;
use std::collections::HashMap;

/// The query envelope accepted by `/v1/query/traces` and `/v1/query/events`.
///
/// `where` matches scalar columns by equality, `range` bounds numeric/time
/// columns, and `attributes` pushes predicates into the JSON attributes blob.
#[derive(Debug, Default, Deserialize)]
pub struct QueryEnvelope {
    /// Free-text substring match across name-typed columns and the raw
    /// attributes JSON.
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default, rename = "where")]
    pub where_: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub range: HashMap<String, RangeBound>,
    #[serde(default)]
    pub attributes: Vec<AttributePredicate>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub order: Order,

    /// Drop selection may also travel in the body.
    #[serde(default)]
    pub drop: Option<String>,
    #[serde(default, rename = "dropId")]
    pub drop_id: Option<String>,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeBound {
    pub gte: Option<f64>,
    pub lte: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct AttributePredicate {
    pub key: String,
    pub op: AttributeOp,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeOp {
    Eq,
    Like,
    Gt,
    Gte,
    Lt,
    Lte,
    Exists,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    Asc,
    #[default]
    Desc,
}

impl Order {
    pub fn as_sql(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}
