use crate::schema::{ColumnSchema, DataType, SchemaDescriptor, TableSchema};
use config::{Config, File, FileFormat};
use duckdb::Connection;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema file: {0}")]
    File(#[from] config::ConfigError),
    #[error("failed to introspect database schema: {0}")]
    Database(#[from] duckdb::Error),
    #[error("no connection for schema introspection: {0}")]
    Pool(#[from] crate::db::pool::PoolError),
    #[error("schema has no tables")]
    Empty,
    #[error("schema loading task failed: {0}")]
    Task(String),
}

/// Reads a descriptor from a TOML file of the form
///
/// ```toml
/// name = "main"
///
/// [[tables]]
/// name = "order_product"
/// columns = [
///   { name = "prod_name", data_type = "VARCHAR", hint = "Product name" },
/// ]
/// ```
pub fn from_file(path: &Path) -> Result<SchemaDescriptor, SchemaError> {
    info!("Loading schema descriptor from {}", path.display());
    let descriptor: SchemaDescriptor = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    check_not_empty(descriptor)
}

pub fn from_toml_str(source: &str) -> Result<SchemaDescriptor, SchemaError> {
    let descriptor: SchemaDescriptor = Config::builder()
        .add_source(File::from_str(source, FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    check_not_empty(descriptor)
}

/// Builds a descriptor from the catalog of a live database, restricted to the
/// base tables of one schema (namespace). Views are left out.
pub fn introspect(conn: &Connection, schema_name: &str) -> Result<SchemaDescriptor, SchemaError> {
    let mut stmt = conn.prepare(
        "SELECT c.table_name, c.column_name, c.data_type, c.is_nullable
         FROM information_schema.columns c
         JOIN information_schema.tables t
           ON t.table_catalog = c.table_catalog
          AND t.table_schema = c.table_schema
          AND t.table_name = c.table_name
         WHERE c.table_schema = ? AND t.table_type = 'BASE TABLE'
         ORDER BY c.table_name, c.ordinal_position",
    )?;

    let columns = stmt.query_map([schema_name], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)? == "YES",
        ))
    })?;

    let mut tables: Vec<TableSchema> = Vec::new();
    for column in columns {
        let (table_name, column_name, data_type, nullable) = column?;
        let column = ColumnSchema {
            name: column_name,
            data_type: DataType::from_sql_type(&data_type),
            nullable,
            hint: None,
        };
        match tables.last_mut() {
            Some(table) if table.name == table_name => table.columns.push(column),
            _ => tables.push(TableSchema {
                name: table_name,
                description: None,
                columns: vec![column],
            }),
        }
    }

    debug!(
        "Introspected {} tables in schema {}",
        tables.len(),
        schema_name
    );
    check_not_empty(SchemaDescriptor::new(Some(schema_name.to_string()), tables))
}

fn check_not_empty(descriptor: SchemaDescriptor) -> Result<SchemaDescriptor, SchemaError> {
    if descriptor.is_empty() {
        return Err(SchemaError::Empty);
    }
    Ok(descriptor)
}
