use crate::db::db_pool::DuckDBConnectionManager;
use crate::db::pool::ConnectionPool;
use crate::llm::models::FewShotExample;
use crate::schema::{SchemaDescriptor, SchemaError, loader};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Schema and few-shot examples as seen by one request.
#[derive(Debug)]
pub struct SchemaSnapshot {
    pub descriptor: SchemaDescriptor,
    pub examples: Vec<FewShotExample>,
    /// Starts at 1 and grows by one on every successful reload.
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn new(descriptor: SchemaDescriptor, examples: Vec<FewShotExample>) -> Self {
        Self {
            descriptor,
            examples,
            version: 1,
            loaded_at: Utc::now(),
        }
    }
}

/// Where descriptors come from.
pub enum SchemaSource {
    /// A TOML descriptor file, re-read on reload.
    File(PathBuf),
    /// The live catalog of one schema in the pooled database.
    Introspect {
        pool: Arc<ConnectionPool<DuckDBConnectionManager>>,
        schema_name: String,
    },
    /// A descriptor fixed at startup.
    Static(SchemaDescriptor),
}

/// Holds the current schema snapshot and swaps it on explicit reload.
///
/// Requests take an `Arc` to the snapshot once at the start; a reload builds a
/// complete new snapshot and replaces the pointer, so a request never sees a
/// half-updated schema.
pub struct SchemaManager {
    source: SchemaSource,
    examples: Vec<FewShotExample>,
    current: RwLock<Arc<SchemaSnapshot>>,
}

impl SchemaManager {
    pub async fn load(source: SchemaSource, examples: Vec<FewShotExample>) -> Result<Self, SchemaError> {
        let descriptor = read_descriptor(&source).await?;
        info!("Loaded schema {} with {} few-shot examples", descriptor, examples.len());

        let snapshot = SchemaSnapshot::new(descriptor, examples.clone());
        Ok(Self {
            source,
            examples,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub async fn snapshot(&self) -> Arc<SchemaSnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Re-reads the source. On failure the previous snapshot stays current.
    pub async fn reload(&self) -> Result<Arc<SchemaSnapshot>, SchemaError> {
        let descriptor = match read_descriptor(&self.source).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Schema reload failed, keeping current snapshot: {}", e);
                return Err(e);
            }
        };

        let mut current = self.current.write().await;
        let snapshot = Arc::new(SchemaSnapshot {
            descriptor,
            examples: self.examples.clone(),
            version: current.version + 1,
            loaded_at: Utc::now(),
        });
        *current = Arc::clone(&snapshot);

        info!("Schema reloaded, now at version {}", snapshot.version);
        Ok(snapshot)
    }
}

async fn read_descriptor(source: &SchemaSource) -> Result<SchemaDescriptor, SchemaError> {
    match source {
        SchemaSource::File(path) => {
            let path = path.clone();
            tokio::task::spawn_blocking(move || loader::from_file(&path))
                .await
                .map_err(|e| SchemaError::Task(e.to_string()))?
        }
        SchemaSource::Introspect { pool, schema_name } => {
            let conn = pool.acquire().await?;
            let schema_name = schema_name.clone();
            tokio::task::spawn_blocking(move || loader::introspect(&conn, &schema_name))
                .await
                .map_err(|e| SchemaError::Task(e.to_string()))?
        }
        SchemaSource::Static(descriptor) => Ok(descriptor.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duckdb::Connection;
    use std::time::Duration;

    fn pool_with(ddl: &str) -> Arc<ConnectionPool<DuckDBConnectionManager>> {
        let conn = Connection::open_in_memory().expect("duckdb");
        conn.execute_batch(ddl).expect("ddl");
        Arc::new(
            ConnectionPool::new(
                DuckDBConnectionManager::from_connection(conn),
                2,
                Duration::from_secs(1),
            )
            .expect("pool"),
        )
    }

    #[tokio::test]
    async fn reload_swaps_whole_snapshot() {
        let pool = pool_with("CREATE TABLE order_product (prod_id VARCHAR, prod_name VARCHAR);");
        let manager = SchemaManager::load(
            SchemaSource::Introspect {
                pool: Arc::clone(&pool),
                schema_name: "main".to_string(),
            },
            vec![FewShotExample {
                question: "How many products?".to_string(),
                sql: "SELECT COUNT(*) FROM order_product".to_string(),
            }],
        )
        .await
        .expect("manager");

        let before = manager.snapshot().await;
        assert_eq!(before.version, 1);
        assert!(before.descriptor.table("cartdetails").is_none());

        {
            let conn = pool.acquire().await.expect("connection");
            conn.execute_batch("CREATE TABLE cartdetails (prod_id VARCHAR, vendor_id VARCHAR);")
                .expect("ddl");
        }
        let after = manager.reload().await.expect("reload");

        assert_eq!(after.version, 2);
        assert!(after.descriptor.table("cartdetails").is_some());
        assert_eq!(after.examples.len(), 1);
        // Holders of the old snapshot keep seeing the old schema.
        assert!(before.descriptor.table("cartdetails").is_none());
        assert_eq!(manager.snapshot().await.version, 2);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let pool = pool_with("CREATE TABLE order_product (prod_id VARCHAR);");
        let manager = SchemaManager::load(
            SchemaSource::Introspect {
                pool: Arc::clone(&pool),
                schema_name: "main".to_string(),
            },
            Vec::new(),
        )
        .await
        .expect("manager");

        {
            let conn = pool.acquire().await.expect("connection");
            conn.execute_batch("DROP TABLE order_product;").expect("ddl");
        }

        let err = manager.reload().await.unwrap_err();
        assert!(matches!(err, SchemaError::Empty));
        let current = manager.snapshot().await;
        assert_eq!(current.version, 1);
        assert!(current.descriptor.table("order_product").is_some());
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let result = SchemaManager::load(
            SchemaSource::File(PathBuf::from("/nonexistent/schema.toml")),
            Vec::new(),
        )
        .await;
        assert!(matches!(result, Err(SchemaError::File(_))));
    }
}
