use crate::db::executor::RowLimitPolicy;
use crate::llm::models::FewShotExample;
use crate::util::retry::RetryPolicy;
use clap::{Parser, ValueEnum};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub max_rows: usize,
    pub on_row_limit: RowLimitPolicy,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: "nl-query.duckdb".to_string(),
            pool_size: 5,
            acquire_timeout_ms: 2_000,
            query_timeout_ms: 10_000,
            max_rows: 1_000,
            on_row_limit: RowLimitPolicy::Truncate,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: String, // "ollama" or "remote"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".to_string(),
            model: "sqlcoder".to_string(),
            api_key: None,
            api_url: None,
            timeout_ms: 30_000,
            max_retries: 2,
            backoff_base_ms: 500,
            backoff_max_ms: 5_000,
            temperature: 0.1,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub request_timeout_ms: u64,
    /// Re-generate once with the rejection reason when validation fails.
    pub corrective_retry: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 60_000,
            corrective_retry: false,
        }
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchemaConfig {
    /// Descriptor file. Without one the schema is read from the database.
    pub path: Option<PathBuf>,
    pub introspect_schema_name: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            path: None,
            introspect_schema_name: "main".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub schema: SchemaConfig,
    pub logging: LoggingConfig,
    /// Few-shot (question, SQL) pairs shown to the model.
    pub examples: Vec<FewShotExample>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Answer questions about a DuckDB database in plain language", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// DuckDB database file, or :memory:
    #[arg(short, long, value_name = "PATH")]
    pub database: Option<String>,

    /// Schema descriptor file (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub schema: Option<PathBuf>,

    /// Output format for result rows
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Only validate the given SQL against the schema and print the verdict
    #[arg(long, value_name = "SQL")]
    pub check_sql: Option<String>,

    /// Question to answer
    pub question: Option<String>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            let default_locations = ["config.toml", "config/config.toml", "/etc/nl-query/config.toml"];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // NLQ__LLM__API_KEY=... sets llm.api_key
        config_builder = config_builder.add_source(
            Environment::with_prefix("NLQ")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        if let Some(database) = &args.database {
            config.database.connection_string = database.clone();
        }
        if let Some(schema) = &args.schema {
            config.schema.path = Some(schema.clone());
        }

        Ok(config)
    }
}
