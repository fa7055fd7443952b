use crate::core::{PersistError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A scalar SQL value as rendered into DML statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Integer(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::Text(_) => "TEXT",
            Value::Boolean(_) => "BOOLEAN",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render this value as a SQL literal under the given quoting rules.
    pub fn to_sql_literal(&self, quoting: &QuoteContext) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Integer(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Text(v) => quoting.quote_text(v),
            Value::Boolean(v) => {
                if *v {
                    "TRUE".to_string()
                } else {
                    "FALSE".to_string()
                }
            }
            Value::Timestamp(v) => quoting.quote_text(&v.to_rfc3339()),
            Value::Uuid(v) => quoting.quote_text(&v.to_string()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Uuid(v) => write!(f, "{}", v),
        }
    }
}

/// Quoting rules applied when rendering statements.
///
/// Identifier quoting is kept separate from string quoting so a backend
/// with different conventions only needs a different context instance.
#[derive(Debug, Clone)]
pub struct QuoteContext {
    identifier_quote: char,
}

impl QuoteContext {
    pub fn new() -> Self {
        Self {
            identifier_quote: '"',
        }
    }

    pub fn quote_text(&self, value: &str) -> String {
        format!("'{}'", sql_escape_string(value))
    }

    pub fn quote_identifier(&self, name: &str) -> String {
        let q = self.identifier_quote;
        format!("{q}{}{q}", name.replace(q, ""))
    }
}

impl Default for QuoteContext {
    fn default() -> Self {
        Self::new()
    }
}

pub fn sql_escape_string(value: &str) -> String {
    value.replace('\'', "''")
}

/// Identity key of a persisted entity.
///
/// Unlike [`Value`] this type is hashable and comparable, so it can key the
/// identity map. Composite keys cover link tables with multi-column
/// primary keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    Int(i64),
    Text(String),
    Uuid(Uuid),
    Composite(Vec<EntityKey>),
}

impl EntityKey {
    /// Generate a fresh surrogate key.
    pub fn generate() -> Self {
        EntityKey::Uuid(Uuid::new_v4())
    }

    pub fn as_value(&self) -> Result<Value> {
        match self {
            EntityKey::Int(v) => Ok(Value::Integer(*v)),
            EntityKey::Text(v) => Ok(Value::Text(v.clone())),
            EntityKey::Uuid(v) => Ok(Value::Uuid(*v)),
            EntityKey::Composite(_) => Err(PersistError::Execution(
                "Composite key has no single-value form".to_string(),
            )),
        }
    }

    /// Render a `col = literal` predicate (AND-joined for composite keys).
    pub fn to_predicate(&self, key_columns: &[String], quoting: &QuoteContext) -> Result<String> {
        let parts: Vec<&EntityKey> = match self {
            EntityKey::Composite(parts) => parts.iter().collect(),
            single => vec![single],
        };

        if parts.len() != key_columns.len() {
            return Err(PersistError::Execution(format!(
                "Key has {} component(s) but entity declares {} key column(s)",
                parts.len(),
                key_columns.len()
            )));
        }

        let mut clauses = Vec::with_capacity(parts.len());
        for (column, part) in key_columns.iter().zip(parts) {
            let literal = part.as_value()?.to_sql_literal(quoting);
            clauses.push(format!("{} = {}", quoting.quote_identifier(column), literal));
        }
        Ok(clauses.join(" AND "))
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKey::Int(v) => write!(f, "{}", v),
            EntityKey::Text(v) => write!(f, "{}", v),
            EntityKey::Uuid(v) => write!(f, "{}", v),
            EntityKey::Composite(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", rendered.join(", "))
            }
        }
    }
}
