//! HTTP client for chat completions and embeddings.
//!
//! Chat goes to either an OpenAI-compatible `/chat/completions` endpoint or
//! the Anthropic `/messages` endpoint, depending on the configured provider.
//! Embeddings always use the OpenAI-compatible `/embeddings` endpoint.
//! Every successful chat call reports its token usage to the session
//! accountant.

use std::sync::Arc;
use std::time::{Duration, Instant};

use feedwatch_core::{ProviderInfo, SessionCostAccountant};
use feedwatch_shared::{FeedwatchError, LlmConfig, LlmProvider, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Attempts per call, including the first.
const MAX_ATTEMPTS: u32 = 3;

/// Appended to the Anthropic system prompt, which has no JSON response mode.
const JSON_ONLY: &str =
    "IMPORTANT: You must respond with valid JSON only. No text before or after the JSON.";

/// One chat call.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub system: &'a str,
    pub user: &'a str,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the model for a bare JSON object.
    pub json_mode: bool,
}

/// Result of a chat call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub latency_ms: u64,
}

/// Provider-aware LLM client.
pub struct LlmClient {
    http: Client,
    config: LlmConfig,
    api_key: Option<String>,
    openai_key: Option<String>,
    accountant: Arc<SessionCostAccountant>,
    /// Base delay for retries; rate-limit backoff is `unit * 2^(attempt+1)`.
    retry_unit: Duration,
}

impl LlmClient {
    /// Build a client, reading API keys from the environment variables
    /// named in `config`.
    pub fn new(config: LlmConfig, accountant: Arc<SessionCostAccountant>) -> Result<Self> {
        let api_key = config.api_key();
        let openai_key = config.openai_api_key();
        Self::with_keys(config, accountant, api_key, openai_key)
    }

    /// Build a client with explicit keys.
    pub fn with_keys(
        config: LlmConfig,
        accountant: Arc<SessionCostAccountant>,
        api_key: Option<String>,
        openai_key: Option<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| FeedwatchError::Llm(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            config,
            api_key,
            openai_key,
            accountant,
            retry_unit: Duration::from_secs(1),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_retry_unit(mut self, unit: Duration) -> Self {
        self.retry_unit = unit;
        self
    }

    pub fn has_embedding_key(&self) -> bool {
        self.openai_key.is_some()
    }

    pub fn embedding_model(&self) -> &str {
        &self.config.embedding_model
    }

    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency.max(1)
    }

    /// Send a chat request, retrying transient failures.
    pub async fn chat(&self, request: &ChatRequest<'_>) -> Result<Completion> {
        let completion = self
            .with_retries("chat", move || async move {
                match self.config.provider {
                    LlmProvider::OpenAi => self.openai_chat(request).await,
                    LlmProvider::Anthropic => self.anthropic_chat(request).await,
                }
            })
            .await?;

        self.accountant
            .add_tokens(completion.input_tokens, completion.output_tokens);
        debug!(
            model = %completion.model,
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            latency_ms = completion.latency_ms,
            "chat completed"
        );
        Ok(completion)
    }

    /// Embed `texts`, returning one vector per input in input order. An
    /// input the response has no vector for gets an empty one.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let key = self
            .openai_key
            .as_deref()
            .ok_or_else(|| FeedwatchError::Llm("OpenAI API key not configured".into()))?;

        self.with_retries("embeddings", move || async move {
            let body = EmbeddingRequest {
                model: &self.config.embedding_model,
                input: texts,
            };
            let response: EmbeddingResponse = self
                .post_json(
                    self.http
                        .post(format!("{}/embeddings", self.openai_base()))
                        .bearer_auth(key),
                    &body,
                )
                .await?;

            // Slots the response skips stay empty.
            let mut vectors = vec![Vec::new(); texts.len()];
            for item in response.data {
                match vectors.get_mut(item.index) {
                    Some(slot) => *slot = item.embedding,
                    None => warn!(index = item.index, "embedding index out of range"),
                }
            }
            Ok(vectors)
        })
        .await
    }

    async fn openai_chat(&self, request: &ChatRequest<'_>) -> Result<Completion> {
        let key = self.require_key()?;
        let model = self.config.active_model();
        let body = OpenAiChatRequest {
            model,
            messages: vec![
                OpenAiMessage {
                    role: "system",
                    content: request.system,
                },
                OpenAiMessage {
                    role: "user",
                    content: request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let started = Instant::now();
        let response: OpenAiChatResponse = self
            .post_json(
                self.http
                    .post(format!("{}/chat/completions", self.openai_base()))
                    .bearer_auth(key),
                &body,
            )
            .await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| FeedwatchError::Llm("response has no choices".into()))?;
        let usage = response.usage.unwrap_or_default();

        Ok(Completion {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            model: response.model.unwrap_or_else(|| model.to_string()),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn anthropic_chat(&self, request: &ChatRequest<'_>) -> Result<Completion> {
        let key = self.require_key()?;
        let model = self.config.active_model();
        let system = if request.json_mode {
            format!("{}\n\n{JSON_ONLY}", request.system)
        } else {
            request.system.to_string()
        };
        let body = AnthropicRequest {
            model,
            max_tokens: request.max_tokens,
            system: &system,
            messages: vec![OpenAiMessage {
                role: "user",
                content: request.user,
            }],
            temperature: request.temperature,
        };

        let started = Instant::now();
        let response: AnthropicResponse = self
            .post_json(
                self.http
                    .post(format!("{}/messages", self.anthropic_base()))
                    .header("x-api-key", key)
                    .header("anthropic-version", ANTHROPIC_VERSION),
                &body,
            )
            .await?;

        let text = response
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text)
            .unwrap_or_default();
        let usage = response.usage.unwrap_or_default();

        Ok(Completion {
            text,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            model: response.model.unwrap_or_else(|| model.to_string()),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn post_json<B, R>(&self, builder: reqwest::RequestBuilder, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = builder
            .json(body)
            .send()
            .await
            .map_err(|e| FeedwatchError::Network(format!("LLM request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(300)
                .collect();
            return Err(FeedwatchError::Llm(format!("HTTP {status}: {detail}")));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| FeedwatchError::Llm(format!("invalid response body: {e}")))
    }

    /// Run `call` up to [`MAX_ATTEMPTS`] times. Rate limits back off
    /// exponentially, other failures wait one unit.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= MAX_ATTEMPTS => return Err(e),
                Err(e) => {
                    let wait = if e.is_rate_limited() {
                        self.retry_unit * 2u32.pow(attempt + 1)
                    } else {
                        self.retry_unit
                    };
                    warn!(
                        what,
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "LLM call failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    fn require_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            FeedwatchError::Llm(format!(
                "API key not configured (set {})",
                self.config.active_key_env()
            ))
        })
    }

    fn openai_base(&self) -> &str {
        match (self.config.provider, &self.config.base_url) {
            (LlmProvider::OpenAi, Some(base)) => base.trim_end_matches('/'),
            _ => OPENAI_BASE_URL,
        }
    }

    fn anthropic_base(&self) -> &str {
        match (self.config.provider, &self.config.base_url) {
            (LlmProvider::Anthropic, Some(base)) => base.trim_end_matches('/'),
            _ => ANTHROPIC_BASE_URL,
        }
    }
}

impl ProviderInfo for LlmClient {
    fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn model_name(&self) -> String {
        self.config.active_model().to_string()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn openai_config(server: &MockServer) -> LlmConfig {
        LlmConfig {
            base_url: Some(server.uri()),
            ..LlmConfig::default()
        }
    }

    pub(crate) fn client(config: LlmConfig, accountant: Arc<SessionCostAccountant>) -> LlmClient {
        LlmClient::with_keys(
            config,
            accountant,
            Some("sk-test".into()),
            Some("sk-test".into()),
        )
        .unwrap()
        .with_retry_unit(Duration::from_millis(5))
    }

    pub(crate) fn chat_reply(content: &str, input: u64, output: u64) -> serde_json::Value {
        json!({
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": input, "completion_tokens": output}
        })
    }

    const REQUEST: ChatRequest<'static> = ChatRequest {
        system: "You are terse.",
        user: "Say hi.",
        temperature: 0.3,
        max_tokens: 50,
        json_mode: true,
    };

    #[tokio::test]
    async fn openai_chat_records_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "response_format": {"type": "json_object"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("hi", 120, 8)))
            .expect(1)
            .mount(&server)
            .await;

        let accountant = Arc::new(SessionCostAccountant::new());
        let client = client(openai_config(&server), Arc::clone(&accountant));

        let completion = client.chat(&REQUEST).await.unwrap();
        assert_eq!(completion.text, "hi");
        assert_eq!(accountant.get_tokens().input_tokens, 120);
        assert_eq!(accountant.get_tokens().output_tokens, 8);
    }

    #[tokio::test]
    async fn anthropic_chat_uses_messages_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "sk-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "claude-3-5-haiku-20241022",
                "content": [{"type": "text", "text": "{\"ok\":true}"}],
                "usage": {"input_tokens": 40, "output_tokens": 6}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = LlmConfig {
            provider: LlmProvider::Anthropic,
            base_url: Some(server.uri()),
            ..LlmConfig::default()
        };
        let accountant = Arc::new(SessionCostAccountant::new());
        let client = client(config, Arc::clone(&accountant));
        assert_eq!(client.model_name(), "claude-3-5-haiku-20241022");

        let completion = client.chat(&REQUEST).await.unwrap();
        assert_eq!(completion.text, "{\"ok\":true}");
        assert_eq!(accountant.get_tokens().input_tokens, 40);
    }

    #[tokio::test]
    async fn retries_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let accountant = Arc::new(SessionCostAccountant::new());
        let client = client(openai_config(&server), Arc::clone(&accountant));

        let err = client.chat(&REQUEST).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(accountant.get_tokens().input_tokens, 0);
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("ok", 10, 2)))
            .mount(&server)
            .await;

        let client = client(
            openai_config(&server),
            Arc::new(SessionCostAccountant::new()),
        );
        assert_eq!(client.chat(&REQUEST).await.unwrap().text, "ok");
    }

    #[tokio::test]
    async fn missing_key_is_reported() {
        let client = LlmClient::with_keys(
            LlmConfig::default(),
            Arc::new(SessionCostAccountant::new()),
            None,
            None,
        )
        .unwrap();
        assert!(!client.has_api_key());
        assert!(!client.has_embedding_key());
        assert!(client.embed(&["x".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn embeddings_come_back_in_input_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(json!({"model": "text-embedding-3-small"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 1, "embedding": [0.5, 0.25]},
                    {"index": 0, "embedding": [1.0, -1.0]}
                ]
            })))
            .mount(&server)
            .await;

        let client = client(
            openai_config(&server),
            Arc::new(SessionCostAccountant::new()),
        );
        let vectors = client
            .embed(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, -1.0], vec![0.5, 0.25]]);
    }

    #[tokio::test]
    async fn skipped_embedding_index_keeps_positions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 2, "embedding": [3.0]},
                    {"index": 7, "embedding": [7.0]}
                ]
            })))
            .mount(&server)
            .await;

        let client = client(
            openai_config(&server),
            Arc::new(SessionCostAccountant::new()),
        );
        let texts: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let vectors = client.embed(&texts).await.unwrap();
        assert_eq!(vectors, vec![vec![], vec![], vec![3.0]]);
    }
}
