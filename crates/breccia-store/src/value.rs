//! Typed values, rows, and projection schemas.
//!
//! A projection's table schema is fixed at registration: an ordered list of
//! columns with exactly one primary key. Rows are maps from column name to
//! [`Value`]; upserts are validated against the schema before anything is
//! journalled.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A column value.
///
/// `Real` carries `f64` bit-pattern equality/hashing so values can serve as
/// map keys; schemas nevertheless reject `real` primary-key columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Returns the column type this value inhabits, or `None` for null.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Real(_) => Some(ColumnType::Real),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Blob(_) => Some(ColumnType::Blob),
        }
    }

    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Real(r) => r.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Blob(b) => b.hash(state),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    Blob,
}

/// One column of a projection schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name, unique within the schema.
    pub name: String,
    /// Declared type.
    pub ty: ColumnType,
    /// Whether this column is the primary key.
    pub primary_key: bool,
    /// Whether null values are accepted.
    pub nullable: bool,
}

impl ColumnDef {
    /// A non-nullable, non-key column.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            primary_key: false,
            nullable: false,
        }
    }

    /// Marks the column as the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Marks the column as nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A row: column name → value. Ordered for stable serialization.
pub type Row = BTreeMap<String, Value>;

/// An ordered, validated projection schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnDef>,
}

impl Schema {
    /// Validates and builds a schema.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::InvalidSchema`] if there is not exactly one
    /// primary key, a name repeats, the key is nullable, or the key column
    /// is `real`.
    pub fn new(columns: Vec<ColumnDef>) -> crate::Result<Self> {
        if columns.is_empty() {
            return Err(crate::StoreError::InvalidSchema(
                "schema has no columns".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for column in &columns {
            if !names.insert(column.name.as_str()) {
                return Err(crate::StoreError::InvalidSchema(format!(
                    "duplicate column name '{}'",
                    column.name
                )));
            }
        }

        let keys: Vec<&ColumnDef> = columns.iter().filter(|c| c.primary_key).collect();
        match keys.as_slice() {
            [key] => {
                if key.nullable {
                    return Err(crate::StoreError::InvalidSchema(format!(
                        "primary key '{}' cannot be nullable",
                        key.name
                    )));
                }
                if key.ty == ColumnType::Real {
                    return Err(crate::StoreError::InvalidSchema(format!(
                        "primary key '{}' cannot be real-typed",
                        key.name
                    )));
                }
            }
            [] => {
                return Err(crate::StoreError::InvalidSchema(
                    "schema has no primary key".to_string(),
                ))
            }
            _ => {
                return Err(crate::StoreError::InvalidSchema(
                    "schema has more than one primary key".to_string(),
                ))
            }
        }

        Ok(Self { columns })
    }

    /// The schema's columns, in declaration order.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// The primary-key column.
    pub fn primary_key(&self) -> &ColumnDef {
        self.columns
            .iter()
            .find(|c| c.primary_key)
            .expect("validated schema has a primary key")
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Validates an upsert against the schema.
    ///
    /// `key` must match the primary-key column's type; `row` may not carry
    /// unknown columns, type-mismatched values, or nulls in non-nullable
    /// columns. Non-key columns may be absent (they read back as absent).
    /// If the row carries the key column its value must equal `key`.
    pub fn check_upsert(&self, table: &str, key: &Value, row: &Row) -> crate::Result<()> {
        let pk = self.primary_key();
        if key.column_type() != Some(pk.ty) {
            return Err(crate::StoreError::TypeMismatch {
                table: table.to_string(),
                column: pk.name.clone(),
            });
        }

        for (name, value) in row {
            let Some(column) = self.column(name) else {
                return Err(crate::StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: name.clone(),
                });
            };
            if value.is_null() {
                if !column.nullable {
                    return Err(crate::StoreError::MissingColumn {
                        table: table.to_string(),
                        column: name.clone(),
                    });
                }
                continue;
            }
            if value.column_type() != Some(column.ty) {
                return Err(crate::StoreError::TypeMismatch {
                    table: table.to_string(),
                    column: name.clone(),
                });
            }
        }

        if let Some(stored_key) = row.get(&pk.name) {
            if stored_key != key {
                return Err(crate::StoreError::TypeMismatch {
                    table: table.to_string(),
                    column: pk.name.clone(),
                });
            }
        }

        Ok(())
    }
}
