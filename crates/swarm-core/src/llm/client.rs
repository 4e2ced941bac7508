//! LLM API HTTP backend
//!
//! Speaks the Messages API and OpenAI-compatible chat completions

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, BackendResponse, Prompt};
use crate::config::{LlmConfig, LlmProvider};
use crate::error::{Error, Result};

use super::types::*;

/// Backend that sends each worker prompt to an LLM HTTP API
#[derive(Clone)]
pub struct LlmBackend {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    system_prompt: Option<String>,
    provider: LlmProvider,
}

impl LlmBackend {
    /// Create a new LLM backend
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config("LLM_API_KEY not set".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(Error::Http)?;

        // Determine base URL based on provider
        let base_url = match &config.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => match config.provider {
                LlmProvider::Claude => "https://api.anthropic.com/v1".to_string(),
                LlmProvider::OpenAi => "https://api.openai.com/v1".to_string(),
            },
        };

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url,
            system_prompt: config.system_prompt.clone(),
            provider: config.provider.clone(),
        })
    }

    /// Get the model name
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the provider type
    pub fn provider(&self) -> &LlmProvider {
        &self.provider
    }

    fn request_for(&self, prompt: Prompt) -> MessagesRequest {
        MessagesRequest {
            model: self.model.clone(),
            max_tokens: prompt.max_tokens,
            system: self.system_prompt.clone(),
            messages: vec![Message::user(prompt.text)],
        }
    }

    /// Send a request and return the raw body of a successful response
    async fn post(&self, request: reqwest::RequestBuilder) -> std::result::Result<String, BackendError> {
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            warn!("LLM API error: {} - {}", status, body);
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }

    /// Send request to the Messages API
    async fn send_messages_request(
        &self,
        request: MessagesRequest,
    ) -> std::result::Result<MessagesResponse, BackendError> {
        let url = format!("{}/messages", self.base_url);
        debug!("Sending request to Messages API: {}", url);

        let body = self
            .post(
                self.client
                    .post(&url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .header("content-type", "application/json")
                    .json(&request),
            )
            .await?;

        serde_json::from_str(&body)
            .map_err(|e| BackendError::Malformed(format!("{} - {}", e, body)))
    }

    /// Send request to OpenAI-compatible API (GLM, etc.)
    async fn send_openai_request(
        &self,
        request: MessagesRequest,
    ) -> std::result::Result<MessagesResponse, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!("Sending request to OpenAI-compatible API: {}", url);

        let openai_request = ChatCompletionRequest::from_messages_request(&request);

        let body = self
            .post(
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .header("content-type", "application/json")
                    .json(&openai_request),
            )
            .await?;

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::Malformed(format!("{} - {}", e, body)))?;

        Ok(parsed.to_messages_response())
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl Backend for LlmBackend {
    async fn invoke(&self, prompt: Prompt) -> std::result::Result<BackendResponse, BackendError> {
        let request = self.request_for(prompt);

        let response = match self.provider {
            LlmProvider::Claude => self.send_messages_request(request).await?,
            LlmProvider::OpenAi => self.send_openai_request(request).await?,
        };

        let usage = response.usage.clone().unwrap_or_default();
        info!(
            "LLM response: stop_reason={:?}, tokens={}",
            response.stop_reason,
            usage.input_tokens + usage.output_tokens
        );

        Ok(BackendResponse {
            text: response.text(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        })
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(provider: LlmProvider, base_url: String) -> LlmConfig {
        LlmConfig {
            api_key: "test_key".to_string(),
            provider,
            base_url: Some(base_url),
            ..LlmConfig::default()
        }
    }

    fn messages_reply(text: &str) -> serde_json::Value {
        json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "model": "claude",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 11, "output_tokens": 4}
        })
    }

    #[test]
    fn test_new_requires_api_key() {
        let result = LlmBackend::new(&LlmConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_invoke_messages_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "test_key"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(json!({
                "max_tokens": 256,
                "messages": [{"role": "user", "content": [{"type": "text", "text": "summarize"}]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(messages_reply("summary")))
            .expect(1)
            .mount(&server)
            .await;

        let backend = LlmBackend::new(&config(LlmProvider::Claude, server.uri())).unwrap();
        let response = backend.invoke(Prompt::new("summarize", 256)).await.unwrap();

        assert_eq!(response.text, "summary");
        assert_eq!(response.total_tokens(), 15);
    }

    #[tokio::test]
    async fn test_invoke_openai_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test_key"))
            .and(body_partial_json(json!({
                "max_tokens": 64,
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "c1",
                "object": "chat.completion",
                "created": 1,
                "model": "glm",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "hi"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = LlmBackend::new(&config(LlmProvider::OpenAi, server.uri())).unwrap();
        let response = backend.invoke(Prompt::new("hello", 64)).await.unwrap();

        assert_eq!(response.text, "hi");
        assert_eq!(response.input_tokens, 3);
    }

    #[tokio::test]
    async fn test_error_statuses_map_to_backend_error() {
        for status in [429u16, 500, 529] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/messages"))
                .respond_with(ResponseTemplate::new(status).set_body_string(r#"{"error":"busy"}"#))
                .mount(&server)
                .await;

            let backend = LlmBackend::new(&config(LlmProvider::Claude, server.uri())).unwrap();
            let err = backend.invoke(Prompt::new("x", 16)).await.unwrap_err();

            assert!(
                matches!(&err, BackendError::Status { status: s, body } if *s == status && body.contains("busy")),
                "status {status} gave {err:?}"
            );
            assert_eq!(err.failure_kind(), crate::task::FailureKind::BackendError);
        }
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true})))
            .mount(&server)
            .await;

        let backend = LlmBackend::new(&config(LlmProvider::Claude, server.uri())).unwrap();
        let err = backend.invoke(Prompt::new("x", 16)).await.unwrap_err();

        assert!(matches!(err, BackendError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_slow_response_maps_to_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(messages_reply("late"))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let backend = LlmBackend::new(&LlmConfig {
            request_timeout_secs: 1,
            ..config(LlmProvider::Claude, server.uri())
        })
        .unwrap();
        let err = backend.invoke(Prompt::new("x", 16)).await.unwrap_err();

        assert_eq!(err, BackendError::Timeout);
        assert_eq!(err.failure_kind(), crate::task::FailureKind::Timeout);
    }
}
