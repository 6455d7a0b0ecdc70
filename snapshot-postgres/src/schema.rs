use std::fmt;
use std::str::FromStr;

use pg_escape::quote_identifier;
use serde::{Deserialize, Serialize};
use tokio_postgres::types::Type;

use crate::types::is_integer_type;

/// Schema used when a configured table name carries no schema.
pub const DEFAULT_SCHEMA: &str = "public";

/// A fully qualified table name.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableName {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Returns the name quoted for use inside SQL statements.
    pub fn as_quoted_identifier(&self) -> String {
        let quoted_schema = quote_identifier(&self.schema);
        let quoted_name = quote_identifier(&self.name);

        format!("{quoted_schema}.{quoted_name}")
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Error returned when a table reference cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTableNameError(pub String);

impl fmt::Display for ParseTableNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid table reference '{}'", self.0)
    }
}

impl std::error::Error for ParseTableNameError {}

impl FromStr for TableName {
    type Err = ParseTableNameError;

    /// Parses `schema.table`, or `table` in the [`DEFAULT_SCHEMA`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (schema, name) = match s.split_once('.') {
            Some((schema, name)) => (schema.trim(), name.trim()),
            None => (DEFAULT_SCHEMA, s),
        };

        if schema.is_empty() || name.is_empty() || name.contains('.') {
            return Err(ParseTableNameError(s.to_string()));
        }

        Ok(TableName::new(schema, name))
    }
}

type TypeModifier = i32;

/// Schema of a single column.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub typ: Type,
    /// Type-specific modifier, e.g. the length of a varchar.
    pub modifier: TypeModifier,
    pub nullable: bool,
    /// Whether the column is part of the primary key.
    pub primary: bool,
}

impl ColumnSchema {
    pub fn new(
        name: impl Into<String>,
        typ: Type,
        modifier: TypeModifier,
        nullable: bool,
        primary: bool,
    ) -> ColumnSchema {
        Self {
            name: name.into(),
            typ,
            modifier,
            nullable,
            primary,
        }
    }
}

/// Schema of a table, columns listed in attribute order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TableSchema {
    pub name: TableName,
    pub column_schemas: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: TableName, column_schemas: Vec<ColumnSchema>) -> Self {
        Self {
            name,
            column_schemas,
        }
    }

    pub fn has_primary_keys(&self) -> bool {
        self.column_schemas.iter().any(|cs| cs.primary)
    }

    /// Primary key columns in attribute order.
    pub fn primary_key_columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.column_schemas.iter().filter(|cs| cs.primary)
    }

    /// Returns the key column when the primary key is made of a single integer column.
    pub fn single_integer_key(&self) -> Option<&ColumnSchema> {
        let mut keys = self.primary_key_columns();
        let key = keys.next()?;

        if keys.next().is_some() || !is_integer_type(&key.typ) {
            return None;
        }

        Some(key)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_schemas.iter().position(|cs| cs.name == name)
    }
}
