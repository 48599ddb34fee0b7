use crate::db::schema_manager::SchemaSnapshot;
use crate::validate::ReasonCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A natural-language question paired with the SQL that answers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub question: String,
    pub sql: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

/// Prior turns of the conversation, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationContext {
    turns: Vec<ConversationTurn>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: Role, text: impl Into<String>) {
        self.turns.push(ConversationTurn {
            role,
            text: text.into(),
        });
    }

    pub fn with_turn(mut self, role: Role, text: impl Into<String>) -> Self {
        self.push(role, text);
        self
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Everything the generator needs for one attempt.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub question: String,
    pub context: ConversationContext,
    pub snapshot: Arc<SchemaSnapshot>,
    /// Set on a corrective attempt: why the previous candidate was rejected.
    pub feedback: Option<ReasonCode>,
}

impl GenerationRequest {
    pub fn new(question: impl Into<String>, context: ConversationContext, snapshot: Arc<SchemaSnapshot>) -> Self {
        Self {
            question: question.into(),
            context,
            snapshot,
            feedback: None,
        }
    }

    pub fn with_feedback(mut self, reason: ReasonCode) -> Self {
        self.feedback = Some(reason);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationMetadata {
    /// Time spent waiting on the model, across all attempts.
    pub model_latency: Duration,
    /// Failed model calls before the one that answered.
    pub retries: usize,
}

/// Unvalidated SQL straight from the model. Never executed as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    pub sql: String,
    pub metadata: GenerationMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Candidate(CandidateQuery),
    /// The model declined, or answered with something that is not SQL.
    NoQueryPossible,
}

#[derive(Debug, Clone, Error)]
#[error("language model unavailable after {attempts} attempts: {last_error}")]
pub struct GenerationUnavailable {
    pub attempts: usize,
    pub last_error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_turn_order() {
        let context = ConversationContext::new()
            .with_turn(Role::User, "show fertilizers")
            .with_turn(Role::Assistant, "Here are 3 fertilizers.");

        let roles: Vec<Role> = context.turns().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert!(!context.is_empty());
    }

    #[test]
    fn context_deserializes_from_a_list() {
        let context: ConversationContext = serde_json::from_str(
            r#"[{"role":"user","text":"hi"},{"role":"assistant","text":"hello"}]"#,
        )
        .expect("context");
        assert_eq!(context.turns().len(), 2);
        assert_eq!(context.turns()[1].role, Role::Assistant);
    }
}
