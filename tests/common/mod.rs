#![allow(dead_code)]

use async_trait::async_trait;
use duckdb::Connection;
use nl_query::db::db_pool::DuckDBConnectionManager;
use nl_query::db::executor::{ExecutionFailure, QueryExecutor, RowLimitPolicy, StatementExecutor};
use nl_query::db::pool::ConnectionPool;
use nl_query::db::record::RowSet;
use nl_query::db::schema_manager::{SchemaManager, SchemaSource};
use nl_query::llm::generator::SqlGenerator;
use nl_query::llm::models::FewShotExample;
use nl_query::llm::{LanguageModel, LlmError};
use nl_query::pipeline::{PipelineSettings, QueryPipeline};
use nl_query::schema::{SchemaDescriptor, loader};
use nl_query::util::retry::RetryPolicy;
use nl_query::ValidatedSql;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const STOREFRONT_SCHEMA: &str = r#"
name = "main"

[[tables]]
name = "order_product"
description = "Products placed in customer orders"
columns = [
  { name = "prod_id", data_type = "VARCHAR" },
  { name = "order_id", data_type = "VARCHAR" },
  { name = "prod_name", data_type = "VARCHAR", hint = "Product name, e.g. Urea fertilizer" },
  { name = "vendor_id", data_type = "VARCHAR" },
  { name = "prod_price", data_type = "DOUBLE", hint = "Unit price in rupees" },
  { name = "discount", data_type = "DOUBLE" },
  { name = "status", data_type = "VARCHAR", hint = "Placed, Accepted, Shipped or Cancelled" },
]

[[tables]]
name = "order_tracking_status"
columns = [
  { name = "order_id", data_type = "VARCHAR" },
  { name = "product_id", data_type = "VARCHAR" },
  { name = "status", data_type = "VARCHAR" },
]
"#;

pub fn storefront() -> SchemaDescriptor {
    loader::from_toml_str(STOREFRONT_SCHEMA).expect("storefront schema")
}

pub fn examples() -> Vec<FewShotExample> {
    vec![FewShotExample {
        question: "How many orders were cancelled?".to_string(),
        sql: "SELECT COUNT(*) AS cancelled_orders FROM order_product WHERE status = 'Cancelled'".to_string(),
    }]
}

/// Storefront tables, where `order_product` also stores `supplier_cost`, a
/// column the descriptor does not list.
pub fn seeded_connection() -> Connection {
    let conn = Connection::open_in_memory().expect("duckdb");
    conn.execute_batch(
        "CREATE TABLE order_product (
            prod_id VARCHAR, order_id VARCHAR, prod_name VARCHAR, vendor_id VARCHAR,
            prod_price DOUBLE, discount DOUBLE, status VARCHAR, supplier_cost DOUBLE
         );
         INSERT INTO order_product VALUES
           ('P1', 'O-1', 'Urea fertilizer', 'VEND123', 350.0, 0.0, 'Placed', 210.0),
           ('P2', 'O-1', 'DAP fertilizer', 'VEND123', 1450.0, 50.0, 'Accepted', 990.0),
           ('P3', 'O-2', 'Neem cake fertilizer', 'VEND456', 420.5, 10.0, 'Cancelled', 300.0),
           ('P4', 'O-3', 'Hand sprayer', 'VEND456', 899.0, 0.0, 'Placed', 640.0);
         CREATE TABLE order_tracking_status (order_id VARCHAR, product_id VARCHAR, status VARCHAR);",
    )
    .expect("seed");
    conn
}

pub fn duckdb_executor(pool_size: usize, acquire_timeout: Duration) -> Arc<QueryExecutor> {
    let pool = ConnectionPool::new(
        DuckDBConnectionManager::from_connection(seeded_connection()),
        pool_size,
        acquire_timeout,
    )
    .expect("pool");
    Arc::new(QueryExecutor::new(Arc::new(pool), 100, RowLimitPolicy::Truncate))
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        query_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(60),
        corrective_retry: false,
    }
}

pub async fn pipeline(
    model: Arc<dyn LanguageModel>,
    executor: Arc<dyn StatementExecutor>,
    settings: PipelineSettings,
) -> QueryPipeline {
    let schema = SchemaManager::load(SchemaSource::Static(storefront()), examples())
        .await
        .expect("schema");
    let generator = SqlGenerator::new(
        model,
        RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(100)),
        Duration::from_secs(5),
    )
    .expect("generator");
    QueryPipeline::new(generator, executor, Arc::new(schema), settings)
}

pub enum Reply {
    Text(String),
    Fail,
    Hang,
}

/// Language model that plays back canned replies and records every prompt.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn answering(texts: &[&str]) -> Arc<Self> {
        Self::new(texts.iter().map(|t| Reply::Text(t.to_string())).collect())
    }

    pub fn always(text: &str) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Some(text.to_string()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let reply = self.replies.lock().unwrap().pop_front();
        let reply = match (reply, &self.fallback) {
            (Some(reply), _) => reply,
            (None, Some(text)) => Reply::Text(text.clone()),
            (None, None) => Reply::Hang,
        };
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail => Err(LlmError::ConnectionError("connection refused".to_string())),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(LlmError::ResponseError("no answer".to_string()))
            }
        }
    }
}

/// Executor that records what it was asked to run and plays back results.
#[derive(Default)]
pub struct SpyExecutor {
    results: Mutex<VecDeque<Result<RowSet, ExecutionFailure>>>,
    executed: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl SpyExecutor {
    pub fn new(results: Vec<Result<RowSet, ExecutionFailure>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            ..Self::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

pub fn empty_rows() -> RowSet {
    RowSet {
        columns: vec!["prod_name".to_string()],
        records: Vec::new(),
        row_count: 0,
        truncated: false,
        elapsed: Duration::from_millis(1),
    }
}

#[async_trait]
impl StatementExecutor for SpyExecutor {
    async fn execute(&self, sql: &ValidatedSql, _timeout: Duration) -> Result<RowSet, ExecutionFailure> {
        self.executed.lock().unwrap().push(sql.as_str().to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(empty_rows()))
    }
}
