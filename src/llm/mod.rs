pub mod generator;
pub mod models;
pub mod prompt;
pub mod providers;

use crate::config::LlmConfig;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    ConnectionError(String),
    #[error("LLM response error: {0}")]
    ResponseError(String),
    #[error("LLM configuration error: {0}")]
    ConfigError(String),
}

/// The language model as the pipeline sees it: prompt text in, free-form text
/// out.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

pub struct LlmManager;

impl LlmManager {
    /// Picks the backend named in the configuration.
    pub fn new(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>, LlmError> {
        let model: Arc<dyn LanguageModel> = match config.backend.as_str() {
            "remote" => Arc::new(providers::remote::RemoteLlmProvider::new(config)?),
            "ollama" => Arc::new(providers::ollama::OllamaProvider::new(config)?),
            _ => {
                return Err(LlmError::ConfigError(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )));
            }
        };

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_backend() {
        let config = LlmConfig {
            backend: "carrier-pigeon".to_string(),
            ..LlmConfig::default()
        };
        let err = LlmManager::new(&config).err().expect("must fail");
        assert!(matches!(err, LlmError::ConfigError(_)));
    }

    #[test]
    fn remote_backend_needs_a_key() {
        let config = LlmConfig {
            backend: "remote".to_string(),
            api_key: None,
            ..LlmConfig::default()
        };
        assert!(LlmManager::new(&config).is_err());
    }

    #[test]
    fn builds_ollama_backend() {
        let config = LlmConfig {
            backend: "ollama".to_string(),
            ..LlmConfig::default()
        };
        assert!(LlmManager::new(&config).is_ok());
    }
}
