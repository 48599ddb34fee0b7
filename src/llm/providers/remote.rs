use crate::config::LlmConfig;
use crate::llm::{LanguageModel, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// OpenAI-compatible chat-completions endpoint.
pub struct RemoteLlmProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize, Debug)]
struct PromptRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize, Debug)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct PromptResponse {
    choices: Vec<Choice>,
}

impl PromptResponse {
    fn into_content(self) -> Result<String, LlmError> {
        self.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::ResponseError("No choices in response".to_string()))
    }
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

impl RemoteLlmProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config.api_url.clone().ok_or_else(|| {
            LlmError::ConfigError("API URL is required for remote LLM provider".to_string())
        })?;

        let api_key = config.api_key.clone().ok_or_else(|| {
            LlmError::ConfigError("API key is required for remote LLM provider".to_string())
        })?;

        // Per-attempt deadlines are enforced by the generator; this only
        // bounds a connection that never answers at all.
        let client = reqwest::Client::builder()
            .timeout(config.timeout() * 2)
            .build()
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

impl RemoteLlmProvider {
    fn request(&self, prompt: &str) -> PromptRequest {
        PromptRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: self.temperature,
            max_tokens: 2000,
        }
    }
}

#[async_trait]
impl LanguageModel for RemoteLlmProvider {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let request = self.request(prompt);

        debug!("Sending request to {} with model {}", self.api_url, self.model);

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            error!("LLM API responded with status code: {}", response.status());
            return Err(LlmError::ResponseError(format!(
                "API responded with status code: {}",
                response.status()
            )));
        }

        let prompt_response: PromptResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseError(e.to_string()))?;

        prompt_response.into_content()
    }
}
