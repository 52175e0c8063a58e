//! Typed model of the JSON query document.
//!
//! Every key is optional; an empty document selects all rows. The wire
//! shapes are the ones the storage-service clients send, so the model
//! leans on untagged enums for the string-or-object forms and converts
//! the recursive where clause into a tagged tree the compiler walks.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// A parsed query document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Query {
    /// Projection list.
    #[serde(rename = "return")]
    pub returns: Option<Vec<ReturnColumn>>,
    /// Aggregation, single or list.
    pub aggregate: Option<OneOrMany<Aggregate>>,
    /// Raw SELECT modifier, e.g. `DISTINCT`.
    pub modifier: Option<String>,
    /// Filter tree.
    #[serde(rename = "where")]
    pub condition: Option<WhereNode>,
    /// GROUP BY column.
    pub group: Option<Group>,
    /// ORDER BY, single or list. Mutually exclusive with `timebucket`.
    pub sort: Option<OneOrMany<Sort>>,
    /// LIMIT.
    pub limit: Option<i64>,
    /// OFFSET. Without `limit`, an unbounded limit sentinel is emitted.
    pub skip: Option<i64>,
    /// Julian-day time bucketing.
    pub timebucket: Option<TimeBucket>,
}

impl Query {
    /// Parse a query document, mapping malformed JSON to a parse error.
    pub fn parse(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }

    /// Whether the document carries no keys at all.
    pub fn is_empty(&self) -> bool {
        self.returns.is_none()
            && self.aggregate.is_none()
            && self.modifier.is_none()
            && self.condition.is_none()
            && self.group.is_none()
            && self.sort.is_none()
            && self.limit.is_none()
            && self.skip.is_none()
            && self.timebucket.is_none()
    }
}

/// A value that may appear as a bare element or an array of elements.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// View as a slice regardless of the wire form.
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item),
            OneOrMany::Many(items) => items,
        }
    }
}

/// One entry of the `return` projection list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReturnColumn {
    /// Bare column name. `user_ts` and `ts` receive default formatting.
    Name(String),
    /// JSON sub-field access via `json_extract`.
    Json {
        json: JsonSelector,
        alias: Option<String>,
    },
    /// Column with optional alias, date format or timezone.
    Column {
        column: String,
        alias: Option<String>,
        format: Option<String>,
        timezone: Option<String>,
    },
}

/// `{json: {column, properties}}`: a path into a JSON document column.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonSelector {
    pub column: String,
    pub properties: Properties,
}

/// A JSON path: a single key or a list of nested keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Properties {
    One(String),
    Many(Vec<String>),
}

impl Properties {
    /// The dotted `$.a.b` path body.
    pub fn path(&self) -> String {
        match self {
            Properties::One(p) => p.clone(),
            Properties::Many(ps) => ps.join("."),
        }
    }
}

/// One aggregate: `{operation, column | json, alias?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Aggregate {
    pub operation: String,
    pub column: Option<String>,
    pub json: Option<JsonSelector>,
    pub alias: Option<String>,
}

/// GROUP BY target: a bare column name or `{column, format?, alias?}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Group {
    Name(String),
    Column {
        column: String,
        format: Option<String>,
        alias: Option<String>,
    },
}

/// One ORDER BY entry; direction defaults to ascending.
#[derive(Debug, Clone, Deserialize)]
pub struct Sort {
    pub column: String,
    pub direction: Option<String>,
}

/// `{timebucket: {timestamp, size?, format?, alias?}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeBucket {
    pub timestamp: String,
    pub size: Option<BucketSize>,
    pub format: Option<String>,
    pub alias: Option<String>,
}

/// Bucket width in seconds; clients send it as a number or a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BucketSize {
    Number(u64),
    Text(String),
}

impl BucketSize {
    pub fn as_sql(&self) -> String {
        match self {
            BucketSize::Number(n) => n.to_string(),
            BucketSize::Text(s) => s.clone(),
        }
    }
}

/// The recursive wire form of a where clause.
#[derive(Debug, Clone, Deserialize)]
pub struct WhereNode {
    pub column: String,
    pub condition: String,
    pub value: Value,
    pub and: Option<Box<WhereNode>>,
    pub or: Option<Box<WhereNode>>,
}

/// A where clause as a tagged tree. `and` binds before `or` exactly as the
/// nesting of the wire form dictates; the compiler emits parentheses
/// matching the tree.
#[derive(Debug, Clone)]
pub enum Where {
    Leaf {
        column: String,
        op: Condition,
    },
    And(Box<Where>, Box<Where>),
    Or(Box<Where>, Box<Where>),
}

/// A leaf comparison.
#[derive(Debug, Clone)]
pub enum Condition {
    /// `=`, `!=`, `<`, `<=`, `>`, `>=` against a scalar.
    Compare { operator: String, value: Scalar },
    /// `user_ts < datetime('now', '-N seconds')`.
    Older(i64),
    /// `user_ts > datetime('now', '-N seconds')`.
    Newer(i64),
    /// `IN` / `NOT IN` over a non-empty scalar list.
    In { negated: bool, values: Vec<Scalar> },
}

/// A scalar comparison value.
#[derive(Debug, Clone)]
pub enum Scalar {
    Integer(i64),
    Double(f64),
    Text(String),
}

impl Scalar {
    fn from_value(value: &Value, context: &str) -> Result<Self> {
        match value {
            Value::Number(n) if n.is_i64() => Ok(Scalar::Integer(n.as_i64().unwrap())),
            Value::Number(n) => Ok(Scalar::Double(n.as_f64().unwrap())),
            Value::String(s) => Ok(Scalar::Text(s.clone())),
            _ => Err(Error::shape(
                "where clause",
                format!("The \"value\" of a \"{context}\" condition must be a string, integer or double"),
            )),
        }
    }
}

const COMPARE_OPERATORS: [&str; 6] = ["=", "!=", "<", "<=", ">", ">="];

impl Where {
    /// Convert the wire form into the tagged tree, validating conditions
    /// and value types as the original clause walker did.
    pub fn from_node(node: &WhereNode) -> Result<Self> {
        let op = match node.condition.as_str() {
            "older" | "newer" => {
                let seconds = node.value.as_i64().ok_or_else(|| {
                    Error::shape(
                        "where clause",
                        format!(
                            "The \"value\" of a \"{}\" condition must be an integer",
                            node.condition
                        ),
                    )
                })?;
                if node.condition == "older" {
                    Condition::Older(seconds)
                } else {
                    Condition::Newer(seconds)
                }
            }
            "in" | "not in" => {
                let values = node.value.as_array().filter(|v| !v.is_empty()).ok_or_else(|| {
                    Error::shape(
                        "where clause",
                        format!(
                            "The \"value\" of a \"{}\" condition must be an array and must not be empty",
                            node.condition
                        ),
                    )
                })?;
                let values = values
                    .iter()
                    .map(|v| Scalar::from_value(v, &node.condition))
                    .collect::<Result<Vec<_>>>()?;
                Condition::In {
                    negated: node.condition == "not in",
                    values,
                }
            }
            op if COMPARE_OPERATORS.contains(&op) => Condition::Compare {
                operator: op.to_string(),
                value: Scalar::from_value(&node.value, op)?,
            },
            other => {
                return Err(Error::shape(
                    "where clause",
                    format!("Unsupported condition \"{other}\""),
                ));
            }
        };

        let mut tree = Where::Leaf {
            column: node.column.clone(),
            op,
        };
        if let Some(and) = &node.and {
            tree = Where::And(Box::new(tree), Box::new(Self::from_node(and)?));
        }
        if let Some(or) = &node.or {
            tree = Where::Or(Box::new(tree), Box::new(Self::from_node(or)?));
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_where(json: &str) -> Where {
        let node: WhereNode = serde_json::from_str(json).unwrap();
        Where::from_node(&node).unwrap()
    }

    #[test]
    fn test_empty_document() {
        let query = Query::parse("{}").unwrap();
        assert!(query.is_empty());
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        assert!(matches!(Query::parse("{nope"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_return_forms() {
        let query = Query::parse(
            r#"{"return":["user_ts",
                        {"column":"asset_code","alias":"asset"},
                        {"json":{"column":"reading","properties":["a","b"]}}]}"#,
        )
        .unwrap();
        let returns = query.returns.unwrap();
        assert!(matches!(&returns[0], ReturnColumn::Name(n) if n == "user_ts"));
        assert!(matches!(&returns[1], ReturnColumn::Column { alias: Some(a), .. } if a == "asset"));
        match &returns[2] {
            ReturnColumn::Json { json, .. } => assert_eq!(json.properties.path(), "a.b"),
            other => panic!("expected json column, got {other:?}"),
        }
    }

    #[test]
    fn test_aggregate_one_or_many() {
        let one = Query::parse(r#"{"aggregate":{"operation":"count","column":"*"}}"#).unwrap();
        assert_eq!(one.aggregate.unwrap().as_slice().len(), 1);

        let many = Query::parse(
            r#"{"aggregate":[{"operation":"min","column":"x"},
                             {"operation":"max","column":"x"}]}"#,
        )
        .unwrap();
        assert_eq!(many.aggregate.unwrap().as_slice().len(), 2);
    }

    #[test]
    fn test_where_leaf_tree() {
        let tree = parse_where(r#"{"column":"asset_code","condition":"=","value":"pump1"}"#);
        match tree {
            Where::Leaf { column, op } => {
                assert_eq!(column, "asset_code");
                assert!(matches!(op, Condition::Compare { .. }));
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_where_and_binds_before_or() {
        // a AND b OR c nests as ((a AND b) OR c)
        let tree = parse_where(
            r#"{"column":"a","condition":"=","value":1,
                "and":{"column":"b","condition":"=","value":2},
                "or":{"column":"c","condition":"=","value":3}}"#,
        );
        match tree {
            Where::Or(left, right) => {
                assert!(matches!(*left, Where::And(_, _)));
                assert!(matches!(*right, Where::Leaf { .. }));
            }
            other => panic!("expected or at the root, got {other:?}"),
        }
    }

    #[test]
    fn test_where_older_requires_integer() {
        let node: WhereNode = serde_json::from_str(
            r#"{"column":"user_ts","condition":"older","value":"soon"}"#,
        )
        .unwrap();
        assert!(Where::from_node(&node).is_err());
    }

    #[test]
    fn test_where_in_rejects_empty_array() {
        let node: WhereNode =
            serde_json::from_str(r#"{"column":"id","condition":"in","value":[]}"#).unwrap();
        assert!(Where::from_node(&node).is_err());
    }

    #[test]
    fn test_where_unknown_condition() {
        let node: WhereNode =
            serde_json::from_str(r#"{"column":"id","condition":"like","value":"x"}"#).unwrap();
        assert!(Where::from_node(&node).is_err());
    }

    #[test]
    fn test_timebucket_size_forms() {
        let query = Query::parse(
            r#"{"timebucket":{"timestamp":"user_ts","size":"5","alias":"bucket"}}"#,
        )
        .unwrap();
        assert_eq!(query.timebucket.unwrap().size.unwrap().as_sql(), "5");

        let query =
            Query::parse(r#"{"timebucket":{"timestamp":"user_ts","size":5}}"#).unwrap();
        assert_eq!(query.timebucket.unwrap().size.unwrap().as_sql(), "5");
    }
}
