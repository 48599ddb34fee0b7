use clap::Parser;
use nl_query::config::{AppConfig, CliArgs, OutputFormat};
use nl_query::db::db_pool::DuckDBConnectionManager;
use nl_query::db::executor::QueryExecutor;
use nl_query::db::pool::ConnectionPool;
use nl_query::db::schema_manager::{SchemaManager, SchemaSource};
use nl_query::llm::LlmManager;
use nl_query::llm::generator::SqlGenerator;
use nl_query::pipeline::{PipelineOutcome, PipelineRequest, PipelineSettings, QueryPipeline};
use nl_query::util::logging::init_tracing;
use nl_query::{ValidationVerdict, validate};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(false);
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    init_tracing(config.logging.json);

    info!(
        "Initializing DuckDB connection pool for {} ({} connections)",
        config.database.connection_string, config.database.pool_size
    );
    let db_manager = DuckDBConnectionManager::new(&config.database.connection_string)?;
    let pool = Arc::new(ConnectionPool::new(
        db_manager,
        config.database.pool_size,
        config.database.acquire_timeout(),
    )?);
    pool.health_check().await?;

    let source = match &config.schema.path {
        Some(path) => SchemaSource::File(path.clone()),
        None => SchemaSource::Introspect {
            pool: Arc::clone(&pool),
            schema_name: config.schema.introspect_schema_name.clone(),
        },
    };
    let schema = Arc::new(SchemaManager::load(source, config.examples.clone()).await?);

    if let Some(sql) = &args.check_sql {
        let snapshot = schema.snapshot().await;
        let report = match validate(sql, &snapshot.descriptor) {
            ValidationVerdict::Accepted(sanitized) => json!({ "accepted": true, "sql": sanitized.as_str() }),
            ValidationVerdict::Rejected(code) => json!({ "accepted": false, "reason": code }),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let question = match &args.question {
        Some(question) => question.clone(),
        None => std::io::read_to_string(std::io::stdin())?,
    };
    if question.trim().is_empty() {
        return Err("no question given".into());
    }

    info!("Initializing LLM backend: {}", config.llm.backend);
    let model = LlmManager::new(&config.llm)?;
    let generator = SqlGenerator::from_config(model, &config.llm)?;
    let executor = Arc::new(QueryExecutor::new(
        pool,
        config.database.max_rows,
        config.database.on_row_limit,
    ));
    let pipeline = QueryPipeline::new(
        generator,
        executor,
        schema,
        PipelineSettings::from_config(&config),
    );

    let outcome = pipeline.run(PipelineRequest::new(question.trim())).await;
    print_outcome(&outcome, args.format)?;

    Ok(())
}

fn print_outcome(outcome: &PipelineOutcome, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match (format, outcome) {
        (OutputFormat::Csv, PipelineOutcome::Success(rows)) => {
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            writer.write_record(&rows.columns)?;
            for record in &rows.records {
                writer.write_record(record.values().map(|v| v.to_plain_string()))?;
            }
            writer.flush()?;
            if rows.truncated {
                eprintln!("{}", outcome.user_message());
            }
        }
        (OutputFormat::Csv, _) => {
            eprintln!("{}", outcome.user_message());
        }
        (OutputFormat::Json, _) => {
            let body = json!({
                "message": outcome.user_message(),
                "result": outcome,
            });
            let mut stdout = std::io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, &body)?;
            writeln!(stdout)?;
        }
    }
    Ok(())
}
