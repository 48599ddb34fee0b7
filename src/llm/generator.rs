use crate::config::LlmConfig;
use crate::llm::models::{CandidateQuery, Generation, GenerationMetadata, GenerationRequest, GenerationUnavailable};
use crate::llm::prompt::{NO_QUERY_SENTINEL, PromptBuilder};
use crate::llm::{LanguageModel, LlmError};
use crate::util::retry::RetryPolicy;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Leading keywords of anything that can pass for a SQL statement. Writes are
/// included on purpose: rejecting them is the validator's job.
const STATEMENT_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "VALUES", "FROM", "TABLE", "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT",
    "REPLACE", "CREATE", "ALTER", "DROP", "TRUNCATE", "GRANT", "REVOKE", "ATTACH", "DETACH", "COPY",
    "EXPORT", "IMPORT", "INSTALL", "LOAD", "PRAGMA", "CALL", "EXEC", "EXECUTE", "SET", "SHOW",
    "DESCRIBE", "EXPLAIN", "BEGIN", "COMMIT", "ROLLBACK", "USE",
];

/// Turns a question into candidate SQL by asking the language model.
pub struct SqlGenerator {
    model: Arc<dyn LanguageModel>,
    prompts: PromptBuilder,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl SqlGenerator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let prompts = PromptBuilder::new()
            .map_err(|e| LlmError::ConfigError(format!("invalid prompt template: {}", e)))?;
        Ok(Self {
            model,
            prompts,
            retry,
            call_timeout,
        })
    }

    pub fn from_config(model: Arc<dyn LanguageModel>, config: &LlmConfig) -> Result<Self, LlmError> {
        Self::new(model, config.retry_policy(), config.timeout())
    }

    /// Calls the model once per attempt. Failed or timed-out calls are retried
    /// with jittered backoff; a model that declines is a normal result.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationUnavailable> {
        let prompt = self.prompts.render(request).map_err(|e| GenerationUnavailable {
            attempts: 0,
            last_error: format!("prompt rendering failed: {}", e),
        })?;

        let mut model_latency = Duration::ZERO;
        let mut last_error = String::new();

        for attempt in 0..self.retry.total_attempts() {
            let started = Instant::now();
            let outcome = tokio::time::timeout(self.call_timeout, self.model.complete(&prompt)).await;
            model_latency += started.elapsed();

            match outcome {
                Ok(Ok(answer)) => {
                    let metadata = GenerationMetadata {
                        model_latency,
                        retries: attempt,
                    };
                    return Ok(interpret(&answer, metadata));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("model call timed out after {:?}", self.call_timeout),
            }

            if attempt < self.retry.max_retries {
                let delay = self.retry.jittered_delay(attempt);
                warn!(
                    "LLM attempt {} of {} failed ({}), retrying in {:?}",
                    attempt + 1,
                    self.retry.total_attempts(),
                    last_error,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        warn!("LLM unavailable after {} attempts: {}", self.retry.total_attempts(), last_error);
        Err(GenerationUnavailable {
            attempts: self.retry.total_attempts(),
            last_error,
        })
    }
}

fn interpret(answer: &str, metadata: GenerationMetadata) -> Generation {
    if is_sentinel(answer) {
        info!("Model reported that no query answers the question");
        return Generation::NoQueryPossible;
    }

    match extract_sql(answer) {
        Some(sql) if !is_sentinel(&sql) && looks_like_statement(&sql) => {
            debug!("Extracted SQL: {}", sql);
            Generation::Candidate(CandidateQuery { sql, metadata })
        }
        _ => {
            info!("Model answer holds no SQL statement");
            debug!("Unusable model answer: {}", answer);
            Generation::NoQueryPossible
        }
    }
}

fn is_sentinel(text: &str) -> bool {
    let trimmed = text.trim().trim_matches(|c: char| c == '`' || c == '.' || c.is_whitespace());
    trimmed.eq_ignore_ascii_case(NO_QUERY_SENTINEL)
}

/// Pulls the SQL out of a free-form answer: a ```sql block first, then any
/// fenced block, then the first line that starts with a statement keyword.
pub fn extract_sql(content: &str) -> Option<String> {
    if let Some(start) = content.find("```sql") {
        let after = &content[start + 6..];
        let body = match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        };
        return non_empty(body);
    }

    if let Some(start) = content.find("```") {
        let after = &content[start + 3..];
        if let Some(end) = after.find("```") {
            return non_empty(strip_language_tag(&after[..end]));
        }
    }

    let lines: Vec<&str> = content.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if !starts_with_keyword(line.trim()) {
            continue;
        }

        let mut sql = line.trim().to_string();
        if sql.ends_with(';') {
            return Some(sql);
        }
        for next_line in lines.iter().skip(i + 1).map(|l| l.trim()) {
            if next_line.starts_with("```") || next_line.is_empty() {
                break;
            }
            sql.push(' ');
            sql.push_str(next_line);
            if next_line.ends_with(';') {
                break;
            }
        }
        return Some(sql);
    }

    None
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Drops a one-word info string such as `SQL` or `duckdb` after an opening
/// fence.
fn strip_language_tag(body: &str) -> &str {
    match body.split_once('\n') {
        Some((first, rest))
            if !first.trim().is_empty()
                && first.trim().chars().all(|c| c.is_ascii_alphanumeric())
                && !starts_with_keyword(first.trim()) =>
        {
            rest
        }
        _ => body,
    }
}

fn starts_with_keyword(text: &str) -> bool {
    let word: String = text
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_uppercase();
    STATEMENT_KEYWORDS.contains(&word.as_str())
}

/// True when the first thing after any leading comments is a statement
/// keyword or an opening parenthesis.
fn looks_like_statement(sql: &str) -> bool {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, r)| r).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, r)| r).unwrap_or("").trim_start();
        } else {
            break;
        }
    }
    rest.starts_with('(') || starts_with_keyword(rest)
}
