//! Question in, uniform outcome out.
//!
//! A request moves through `Generating → Validating → Executing → Done` and
//! never revisits a stage, except for one optional corrective pass through
//! generation and validation after a rejection. Nothing the model writes
//! reaches the executor without an `Accepted` verdict; [`ValidatedSql`] makes
//! that a type-level guarantee.

use crate::config::AppConfig;
use crate::db::executor::{ExecutionFailure, StatementExecutor};
use crate::db::record::RowSet;
use crate::db::schema_manager::{SchemaManager, SchemaSnapshot};
use crate::llm::generator::SqlGenerator;
use crate::llm::models::{ConversationContext, Generation, GenerationRequest};
use crate::validate::{ReasonCode, ValidatedSql, ValidationVerdict, validate};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub text: String,
    pub context: ConversationContext,
}

impl PipelineRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: ConversationContext::default(),
        }
    }

    pub fn with_context(mut self, context: ConversationContext) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    GenerationUnavailable,
    Timeout,
    ResourceExhausted,
    ConnectionError,
    Truncated,
    StatementFailed,
    InternalInvariantViolation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::GenerationUnavailable => "GENERATION_UNAVAILABLE",
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            FailureKind::ConnectionError => "CONNECTION_ERROR",
            FailureKind::Truncated => "TRUNCATED",
            FailureKind::StatementFailed => "STATEMENT_FAILED",
            FailureKind::InternalInvariantViolation => "INTERNAL_INVARIANT_VIOLATION",
        }
    }
}

impl From<&ExecutionFailure> for FailureKind {
    fn from(failure: &ExecutionFailure) -> Self {
        match failure {
            ExecutionFailure::Timeout(_) => FailureKind::Timeout,
            ExecutionFailure::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            ExecutionFailure::ConnectionError(_) => FailureKind::ConnectionError,
            ExecutionFailure::Truncated(_) => FailureKind::Truncated,
            ExecutionFailure::StatementFailed(_) => FailureKind::StatementFailed,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only thing a caller of [`QueryPipeline::run`] ever gets back.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Success(RowSet),
    NoQueryPossible,
    RejectedQuery(ReasonCode),
    ExecutionError(FailureKind),
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Success(_))
    }

    /// Label for logs and audit records. Not meant for end users.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PipelineOutcome::Success(_) => "OK",
            PipelineOutcome::NoQueryPossible => "NO_QUERY_POSSIBLE",
            PipelineOutcome::RejectedQuery(code) => code.as_str(),
            PipelineOutcome::ExecutionError(kind) => kind.as_str(),
        }
    }

    /// Generic text safe to show to whoever asked. Never reveals SQL, schema
    /// details or internal errors.
    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineOutcome::Success(rows) if rows.truncated => {
                "Here are the first results. Narrow the question to see the rest."
            }
            PipelineOutcome::Success(_) => "Here is what I found.",
            PipelineOutcome::NoQueryPossible => {
                "I couldn't answer that from the available data. Could you rephrase the question?"
            }
            PipelineOutcome::RejectedQuery(_) => {
                "I can't run that request. I can only look information up, not change it."
            }
            PipelineOutcome::ExecutionError(kind) => match kind {
                FailureKind::GenerationUnavailable => {
                    "The assistant is unavailable right now. Please try again shortly."
                }
                FailureKind::Timeout => "That took too long. Please try a more specific question.",
                FailureKind::ResourceExhausted => "The system is busy. Please try again in a moment.",
                FailureKind::Truncated => {
                    "The answer is too large to show. Please narrow down the question."
                }
                FailureKind::ConnectionError
                | FailureKind::StatementFailed
                | FailureKind::InternalInvariantViolation => {
                    "Something went wrong while looking that up. Please try again."
                }
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Generating,
    Validating,
    Executing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Generating => "generating",
            Stage::Validating => "validating",
            Stage::Executing => "executing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub query_timeout: Duration,
    pub request_timeout: Duration,
    pub corrective_retry: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            query_timeout: config.database.query_timeout(),
            request_timeout: config.pipeline.request_timeout(),
            corrective_retry: config.pipeline.corrective_retry,
        }
    }
}

/// What the audit record says about a request besides its outcome.
#[derive(Debug, Default)]
struct Trace {
    schema_version: u64,
    model_latency: Duration,
    model_retries: usize,
    corrective_attempt: bool,
    execution_attempts: usize,
    sql: Option<String>,
}

pub struct QueryPipeline {
    generator: SqlGenerator,
    executor: Arc<dyn StatementExecutor>,
    schema: Arc<SchemaManager>,
    settings: PipelineSettings,
}

impl QueryPipeline {
    pub fn new(
        generator: SqlGenerator,
        executor: Arc<dyn StatementExecutor>,
        schema: Arc<SchemaManager>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            generator,
            executor,
            schema,
            settings,
        }
    }

    pub fn schema(&self) -> &Arc<SchemaManager> {
        &self.schema
    }

    /// Answers one question. Holds no state between calls; concurrent runs
    /// share only the connection pool and the schema snapshot.
    pub async fn run(&self, request: PipelineRequest) -> PipelineOutcome {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let snapshot = self.schema.snapshot().await;
        let mut trace = Trace {
            schema_version: snapshot.version,
            ..Trace::default()
        };

        info!(request_id = %request_id, "Handling question ({} chars)", request.text.len());

        let outcome = match tokio::time::timeout(
            self.settings.request_timeout,
            self.run_stages(request_id, &request, snapshot, &mut trace),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(request_id = %request_id, "Request exceeded {:?}", self.settings.request_timeout);
                PipelineOutcome::ExecutionError(FailureKind::Timeout)
            }
        };

        audit(request_id, &outcome, &trace, started.elapsed());
        outcome
    }

    async fn run_stages(
        &self,
        request_id: Uuid,
        request: &PipelineRequest,
        snapshot: Arc<SchemaSnapshot>,
        trace: &mut Trace,
    ) -> PipelineOutcome {
        let mut generation_request =
            GenerationRequest::new(request.text.clone(), request.context.clone(), Arc::clone(&snapshot));

        let validated = loop {
            enter(request_id, Stage::Generating);
            let candidate = match self.generator.generate(&generation_request).await {
                Ok(Generation::Candidate(candidate)) => candidate,
                Ok(Generation::NoQueryPossible) => return PipelineOutcome::NoQueryPossible,
                Err(e) => {
                    warn!(request_id = %request_id, "SQL generation failed: {}", e);
                    return PipelineOutcome::ExecutionError(FailureKind::GenerationUnavailable);
                }
            };
            trace.model_latency += candidate.metadata.model_latency;
            trace.model_retries += candidate.metadata.retries;

            enter(request_id, Stage::Validating);
            match validate(&candidate.sql, &snapshot.descriptor) {
                ValidationVerdict::Accepted(sql) => break sql,
                ValidationVerdict::Rejected(code) => {
                    warn!(request_id = %request_id, "Candidate SQL rejected: {}", code);
                    debug!(request_id = %request_id, "Rejected SQL: {}", candidate.sql);
                    if self.settings.corrective_retry && !trace.corrective_attempt {
                        info!(request_id = %request_id, "Corrective attempt after {}", code);
                        trace.corrective_attempt = true;
                        generation_request = generation_request.with_feedback(code);
                        continue;
                    }
                    return PipelineOutcome::RejectedQuery(code);
                }
            }
        };
        trace.sql = Some(validated.to_string());

        if !revalidates(&validated, &snapshot) {
            error!(
                request_id = %request_id,
                "Accepted SQL failed re-validation before execution: {}",
                validated
            );
            return PipelineOutcome::ExecutionError(FailureKind::InternalInvariantViolation);
        }

        enter(request_id, Stage::Executing);
        loop {
            trace.execution_attempts += 1;
            match self.executor.execute(&validated, self.settings.query_timeout).await {
                Ok(rows) => return PipelineOutcome::Success(rows),
                Err(ExecutionFailure::ConnectionError(e)) if trace.execution_attempts == 1 => {
                    warn!(request_id = %request_id, "Connection error, retrying once: {}", e);
                }
                Err(failure) => {
                    warn!(request_id = %request_id, "Execution failed: {}", failure);
                    return PipelineOutcome::ExecutionError(FailureKind::from(&failure));
                }
            }
        }
    }
}

fn enter(request_id: Uuid, stage: Stage) {
    debug!(request_id = %request_id, stage = %stage, "Entering stage");
}

/// Sanitized text must be a fixed point of the validator.
fn revalidates(validated: &ValidatedSql, snapshot: &SchemaSnapshot) -> bool {
    matches!(
        validate(validated.as_str(), &snapshot.descriptor),
        ValidationVerdict::Accepted(again) if again == *validated
    )
}

fn audit(request_id: Uuid, outcome: &PipelineOutcome, trace: &Trace, elapsed: Duration) {
    let (row_count, truncated) = match outcome {
        PipelineOutcome::Success(rows) => (rows.row_count, rows.truncated),
        _ => (0, false),
    };

    if matches!(outcome, PipelineOutcome::ExecutionError(FailureKind::InternalInvariantViolation)) {
        error!(
            target: "audit",
            request_id = %request_id,
            outcome = outcome.reason_code(),
            schema_version = trace.schema_version,
            elapsed_ms = elapsed.as_millis() as u64,
            sql = trace.sql.as_deref().unwrap_or(""),
            "request finished"
        );
        return;
    }

    info!(
        target: "audit",
        request_id = %request_id,
        outcome = outcome.reason_code(),
        schema_version = trace.schema_version,
        elapsed_ms = elapsed.as_millis() as u64,
        model_latency_ms = trace.model_latency.as_millis() as u64,
        model_retries = trace.model_retries,
        corrective_attempt = trace.corrective_attempt,
        execution_attempts = trace.execution_attempts,
        row_count = row_count,
        truncated = truncated,
        sql = trace.sql.as_deref().unwrap_or(""),
        "request finished"
    );
}
