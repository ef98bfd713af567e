use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ProviderError, TextGenerator};
use crate::config::ProviderConfig;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Chat-completions client speaking the OpenAI wire format.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: String,
    config: ProviderConfig,
}

impl OpenAiGenerator {
    /// Create a client with an explicit API key.
    pub fn new(config: ProviderConfig, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            config,
        })
    }

    /// Create a client reading the key from `config.api_key_env`.
    pub fn from_env(config: ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key()
            .ok_or_else(|| ProviderError::MissingApiKey(config.api_key_env.clone()))?;
        Self::new(config, api_key)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn request<'a>(&'a self, prompt: &'a str, system_prompt: Option<&'a str>) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        if !prompt.is_empty() {
            messages.push(ChatMessage {
                role: "user",
                content: prompt,
            });
        }
        ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }
}

fn completion_text(body: &str) -> Result<String, ProviderError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse("response has no choices".to_string()))?;
    Ok(choice.message.content.unwrap_or_default())
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, ProviderError> {
        let request = self.request(prompt, system_prompt);
        tracing::debug!(model = %self.config.model, "requesting completion");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "completion request failed");
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        completion_text(&body)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn generator() -> OpenAiGenerator {
        OpenAiGenerator::new(ProviderConfig::default(), "sk-test").unwrap()
    }

    #[test]
    fn test_request_omits_empty_system_prompt() {
        let generator = generator();
        let body = serde_json::to_value(generator.request("hello", Some(""))).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "hello"}],
                "max_tokens": 500,
                "temperature": 0.7f32,
            })
        );

        let body = serde_json::to_value(generator.request("hello", Some("be terse"))).unwrap();
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "be terse"}));
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_endpoint() {
        let config = ProviderConfig {
            base_url: "http://localhost:8080/v1/".to_string(),
            ..ProviderConfig::default()
        };
        let generator = OpenAiGenerator::new(config, "k").unwrap();
        assert_eq!(generator.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_completion_text() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "APPROVED"}}]}"#;
        assert_eq!(completion_text(body).unwrap(), "APPROVED");

        let body = r#"{"choices": [{"message": {"role": "assistant", "content": null}}]}"#;
        assert_eq!(completion_text(body).unwrap(), "");

        assert!(matches!(
            completion_text(r#"{"choices": []}"#),
            Err(ProviderError::InvalidResponse(_))
        ));
        assert!(matches!(
            completion_text("not json"),
            Err(ProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_missing_api_key() {
        let config = ProviderConfig {
            api_key_env: "WARDEN_TEST_SURELY_UNSET_KEY".to_string(),
            ..ProviderConfig::default()
        };
        assert_eq!(
            OpenAiGenerator::from_env(config).unwrap_err(),
            ProviderError::MissingApiKey("WARDEN_TEST_SURELY_UNSET_KEY".to_string())
        );
    }
}
