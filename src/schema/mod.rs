pub mod loader;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use loader::SchemaError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataType {
    Integer,
    BigInt,
    Double,
    Decimal,
    String,
    Boolean,
    Date,
    Timestamp,
    Unknown(String),
}

impl DataType {
    pub fn to_sql_type(&self) -> String {
        match self {
            DataType::Integer => "INTEGER".to_string(),
            DataType::BigInt => "BIGINT".to_string(),
            DataType::Double => "DOUBLE".to_string(),
            DataType::Decimal => "DECIMAL".to_string(),
            DataType::String => "VARCHAR".to_string(),
            DataType::Boolean => "BOOLEAN".to_string(),
            DataType::Date => "DATE".to_string(),
            DataType::Timestamp => "TIMESTAMP".to_string(),
            DataType::Unknown(t) => t.clone(),
        }
    }

    /// Maps a type name as written in a schema file or reported by
    /// `information_schema.columns`.
    pub fn from_sql_type(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        // DECIMAL(10,2), VARCHAR(255) and friends
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "INT" | "INTEGER" | "INT4" | "SMALLINT" | "TINYINT" => DataType::Integer,
            "BIGINT" | "INT8" | "LONG" | "HUGEINT" => DataType::BigInt,
            "DOUBLE" | "FLOAT" | "REAL" | "FLOAT8" | "FLOAT4" => DataType::Double,
            "DECIMAL" | "NUMERIC" => DataType::Decimal,
            "VARCHAR" | "TEXT" | "STRING" | "CHAR" | "UUID" => DataType::String,
            "BOOLEAN" | "BOOL" => DataType::Boolean,
            "DATE" => DataType::Date,
            "TIMESTAMP" | "DATETIME" | "TIMESTAMP WITH TIME ZONE" | "TIMESTAMPTZ" => {
                DataType::Timestamp
            }
            _ => DataType::Unknown(name.trim().to_string()),
        }
    }
}

impl From<String> for DataType {
    fn from(value: String) -> Self {
        DataType::from_sql_type(&value)
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.to_sql_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Free-text meaning of the column, shown to the model.
    #[serde(default)]
    pub hint: Option<String>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSchema {
    pub fn to_sql_definition(&self) -> String {
        let nullable_str = if self.nullable { "" } else { " NOT NULL" };
        format!("{} {}{}", self.name, self.data_type.to_sql_type(), nullable_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// DDL rendering used as model context. Hints are emitted as trailing
    /// comments so the text stays readable as SQL.
    pub fn to_ddl(&self) -> String {
        let last = self.columns.len().saturating_sub(1);
        let columns_sql: Vec<String> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let separator = if i < last { "," } else { "" };
                match &col.hint {
                    Some(hint) => format!("{}{} -- {}", col.to_sql_definition(), separator, hint),
                    None => format!("{}{}", col.to_sql_definition(), separator),
                }
            })
            .collect();

        let header = match &self.description {
            Some(d) => format!("-- {}\n", d),
            None => String::new(),
        };

        format!(
            "{}CREATE TABLE {} (\n    {}\n);",
            header,
            self.name,
            columns_sql.join("\n    ")
        )
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(column))
    }
}

/// Immutable description of everything a generated query may touch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Namespace the tables live in (`main` for DuckDB). Qualified references
    /// naming any other namespace are treated as cross-database access.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tables: Vec<TableSchema>,
}

impl SchemaDescriptor {
    pub fn new(name: Option<String>, tables: Vec<TableSchema>) -> Self {
        Self { name, tables }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn is_own_namespace(&self, namespace: &str) -> bool {
        self.name
            .as_deref()
            .is_some_and(|n| n.eq_ignore_ascii_case(namespace))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn to_ddl(&self) -> String {
        self.tables
            .iter()
            .map(|t| t.to_ddl())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl fmt::Display for SchemaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} tables)",
            self.name.as_deref().unwrap_or("<default>"),
            self.tables.len()
        )
    }
}
