//! Backend contracts and their HTTP implementations.

use crate::config::{AiConfig, TtsConfig};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "user" or "assistant".
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// A user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// An assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    /// System instructions.
    pub system: Option<String>,
    /// Conversation, ending with the user turn to answer.
    pub messages: Vec<ChatMessage>,
    /// Overrides the configured temperature.
    pub temperature: Option<f32>,
}

impl Prompt {
    /// Prompt with a single user message.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(user)],
            ..Self::default()
        }
    }

    /// Set the system instructions.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Text produced by an LLM.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// Generated text.
    pub content: String,
    /// Tokens reported by the provider.
    pub tokens_used: i64,
}

/// Large language model contract.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Generate a reply to the prompt.
    async fn complete(&self, prompt: &Prompt) -> Result<Completion>;

    /// Model identifier recorded with results.
    fn model(&self) -> &str;
}

/// Input of a speech synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest<'a> {
    /// Text to speak.
    pub text: &'a str,
    /// Language code.
    pub language: &'a str,
    /// Voice ID.
    pub voice: &'a str,
    /// Playback speed, 1.0 is normal.
    pub speed: f32,
}

/// Text-to-speech contract.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Encoded audio for the request.
    async fn synthesize(&self, request: &SpeechRequest<'_>) -> Result<Vec<u8>>;
}

/// Translation contract.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    /// Translate `text` from `source` to `target` (language codes).
    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String>;

    /// Model identifier recorded with results.
    fn model(&self) -> &str;
}

/// Request and response shape of an LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// OpenAI chat completions; also compatible servers.
    OpenAi,
    /// Azure OpenAI: OpenAI shapes, `api-key` header.
    Azure,
    /// Anthropic messages API.
    Anthropic,
    /// Google generateContent API.
    Google,
}

impl Provider {
    /// Parse a configured provider name.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "openai" | "custom" => Ok(Self::OpenAi),
            "azure" => Ok(Self::Azure),
            "anthropic" => Ok(Self::Anthropic),
            "google" => Ok(Self::Google),
            other => Err(AppError::Config(format!("Unknown AI provider: {}", other))),
        }
    }

    /// JSON body for a prompt.
    pub fn build_request(&self, prompt: &Prompt, model: &str, max_tokens: u32, temperature: f32) -> Value {
        match self {
            Self::OpenAi | Self::Azure => {
                let mut messages = Vec::with_capacity(prompt.messages.len() + 1);
                if let Some(system) = &prompt.system {
                    messages.push(json!({"role": "system", "content": system}));
                }
                messages.extend(
                    prompt
                        .messages
                        .iter()
                        .map(|m| json!({"role": m.role, "content": m.content})),
                );
                json!({
                    "model": model,
                    "messages": messages,
                    "max_tokens": max_tokens,
                    "temperature": temperature,
                })
            }
            Self::Anthropic => {
                let mut body = json!({
                    "model": model,
                    "max_tokens": max_tokens,
                    "temperature": temperature,
                    "messages": prompt.messages,
                });
                if let Some(system) = &prompt.system {
                    body["system"] = json!(system);
                }
                body
            }
            Self::Google => {
                let contents: Vec<Value> = prompt
                    .messages
                    .iter()
                    .map(|m| {
                        let role = if m.role == "user" { "user" } else { "model" };
                        json!({"role": role, "parts": [{"text": m.content}]})
                    })
                    .collect();
                let mut body = json!({
                    "contents": contents,
                    "generationConfig": {
                        "maxOutputTokens": max_tokens,
                        "temperature": temperature,
                    },
                });
                if let Some(system) = &prompt.system {
                    body["systemInstruction"] = json!({"parts": [{"text": system}]});
                }
                body
            }
        }
    }

    /// Extract text and token usage from a response body.
    pub fn parse_response(&self, body: &Value) -> Result<Completion> {
        let (content, tokens) = match self {
            Self::OpenAi | Self::Azure => (
                body.pointer("/choices/0/message/content"),
                body.pointer("/usage/total_tokens"),
            ),
            Self::Anthropic => (
                body.pointer("/content/0/text"),
                body.pointer("/usage/output_tokens"),
            ),
            Self::Google => (
                body.pointer("/candidates/0/content/parts/0/text"),
                body.pointer("/usageMetadata/totalTokenCount"),
            ),
        };

        let content = content
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Backend("Response contains no text".into()))?;

        Ok(Completion {
            content: content.trim().to_string(),
            tokens_used: tokens.and_then(Value::as_i64).unwrap_or(0),
        })
    }

    /// Attach the provider's credentials to a request.
    pub fn authorize(&self, request: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
        match self {
            Self::OpenAi => request.bearer_auth(api_key),
            Self::Azure => request.header("api-key", api_key),
            Self::Anthropic => request
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01"),
            // Key travels in the query string.
            Self::Google => request,
        }
    }
}

/// Human readable reason from an error response.
fn error_detail(status: reqwest::StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("error"))
            .and_then(Value::as_str)
            .map(String::from)
    });
    let detail = message.unwrap_or_else(|| body.chars().take(200).collect());
    format!("HTTP {}: {}", status.as_u16(), detail)
}

fn http_client(timeout_seconds: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds.max(1)))
        .build()
        .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))
}

/// LLM backend speaking one of the provider HTTP APIs.
pub struct HttpLlmBackend {
    client: reqwest::Client,
    provider: Provider,
    config: AiConfig,
}

impl HttpLlmBackend {
    /// Create a backend from the `[ai]` section.
    pub fn new(config: &AiConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_seconds)?,
            provider: Provider::parse(&config.provider)?,
            config: config.clone(),
        })
    }

    fn endpoint(&self) -> String {
        let base = self.config.api_url.trim_end_matches('/');
        match self.provider {
            Provider::OpenAi | Provider::Azure => format!("{}/chat/completions", base),
            Provider::Anthropic => format!("{}/messages", base),
            Provider::Google => format!(
                "{}/models/{}:generateContent?key={}",
                base,
                self.config.model,
                urlencoding::encode(&self.config.api_key)
            ),
        }
    }
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        if self.config.api_key.is_empty() {
            return Err(AppError::Backend("AI API key is not configured".into()));
        }

        let body = self.provider.build_request(
            prompt,
            &self.config.model,
            self.config.max_tokens,
            prompt.temperature.unwrap_or(self.config.temperature),
        );

        let request = self
            .provider
            .authorize(self.client.post(self.endpoint()).json(&body), &self.config.api_key);

        let start = std::time::Instant::now();
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let detail = error_detail(status, &text);
            tracing::warn!(provider = %self.config.provider, model = %self.config.model, error = %detail, "AI request failed");
            return Err(AppError::Backend(detail));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| AppError::Backend(format!("Invalid JSON from AI backend: {}", e)))?;
        let completion = self.provider.parse_response(&json)?;

        tracing::info!(
            provider = %self.config.provider,
            model = %self.config.model,
            tokens = completion.tokens_used,
            elapsed = ?start.elapsed(),
            "AI request completed"
        );
        Ok(completion)
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

/// Speech backend posting OpenAI-style `/audio/speech` requests.
pub struct HttpSpeechBackend {
    client: reqwest::Client,
    config: TtsConfig,
}

impl HttpSpeechBackend {
    /// Create a backend from the `[tts]` section.
    pub fn new(config: &TtsConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_seconds)?,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl SpeechBackend for HttpSpeechBackend {
    async fn synthesize(&self, request: &SpeechRequest<'_>) -> Result<Vec<u8>> {
        if self.config.api_key.is_empty() {
            return Err(AppError::Backend("TTS API key is not configured".into()));
        }

        let url = format!("{}/audio/speech", self.config.api_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.model,
                "input": request.text,
                "voice": request.voice,
                "speed": request.speed,
                "response_format": self.config.format,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(error_detail(status, &text)));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(AppError::Backend("Speech backend returned no audio".into()));
        }
        Ok(bytes.to_vec())
    }
}

/// Translation backend that prompts an LLM.
pub struct LlmTranslator {
    llm: Arc<dyn LlmBackend>,
    languages: BTreeMap<String, String>,
    temperature: f32,
}

impl LlmTranslator {
    /// Wrap an LLM; `languages` maps codes to display names used in prompts.
    pub fn new(llm: Arc<dyn LlmBackend>, languages: BTreeMap<String, String>, temperature: f32) -> Self {
        Self {
            llm,
            languages,
            temperature,
        }
    }

    fn language_name<'a>(&'a self, code: &'a str) -> &'a str {
        self.languages.get(code).map(String::as_str).unwrap_or(code)
    }

    /// Prompt asking for a bare translation.
    pub fn prompt(&self, text: &str, source: &str, target: &str) -> Prompt {
        let user = format!(
            "Translate the following {} text into {}.\n\n\
             Requirements:\n\
             1. Keep the tone and style of the original.\n\
             2. The translation must be accurate, natural and fluent.\n\
             3. Keep technical terms precise.\n\
             4. For literary text, preserve its literary quality.\n\
             5. Return only the translation, without any explanation.\n\n\
             Original:\n{}\n\nTranslation:",
            self.language_name(source),
            self.language_name(target),
            text
        );
        Prompt::new(user)
            .with_system(
                "You are a professional translator. Translate text accurately while \
                 keeping its tone, style and meaning.",
            )
            .with_temperature(self.temperature)
    }
}

#[async_trait]
impl TranslationBackend for LlmTranslator {
    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String> {
        let completion = self.llm.complete(&self.prompt(text, source, target)).await?;
        Ok(completion.content)
    }

    fn model(&self) -> &str {
        self.llm.model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> Prompt {
        Prompt::new("Hi").with_system("Be brief")
    }

    #[test]
    fn provider_names() {
        assert_eq!(Provider::parse("custom").unwrap(), Provider::OpenAi);
        assert_eq!(Provider::parse("azure").unwrap(), Provider::Azure);
        assert_eq!(Provider::parse("Anthropic").unwrap(), Provider::Anthropic);
        assert!(Provider::parse("acme").is_err());
    }

    #[test]
    fn openai_shape() {
        let body = Provider::OpenAi.build_request(&prompt(), "gpt", 100, 0.5);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hi");
        assert_eq!(body["max_tokens"], 100);

        let parsed = Provider::OpenAi
            .parse_response(&json!({
                "choices": [{"message": {"content": " Hello "}}],
                "usage": {"total_tokens": 12}
            }))
            .unwrap();
        assert_eq!(parsed.content, "Hello");
        assert_eq!(parsed.tokens_used, 12);
    }

    #[test]
    fn anthropic_shape() {
        let body = Provider::Anthropic.build_request(&prompt(), "claude", 100, 0.5);
        assert_eq!(body["system"], "Be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);

        let parsed = Provider::Anthropic
            .parse_response(&json!({
                "content": [{"type": "text", "text": "Yo"}],
                "usage": {"output_tokens": 3}
            }))
            .unwrap();
        assert_eq!(parsed, Completion { content: "Yo".into(), tokens_used: 3 });
    }

    #[test]
    fn google_shape() {
        let mut p = prompt();
        p.messages.push(ChatMessage::assistant("earlier"));
        let body = Provider::Google.build_request(&p, "gemini", 100, 0.5);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 100);

        let parsed = Provider::Google
            .parse_response(&json!({
                "candidates": [{"content": {"parts": [{"text": "G"}]}}],
                "usageMetadata": {"totalTokenCount": 9}
            }))
            .unwrap();
        assert_eq!(parsed.tokens_used, 9);
    }

    #[test]
    fn credentials_follow_the_provider() {
        let headers = |provider: Provider| {
            let request = reqwest::Client::new().post("http://localhost/chat/completions");
            provider.authorize(request, "k-123").build().unwrap().headers().clone()
        };

        let azure = headers(Provider::Azure);
        assert_eq!(azure["api-key"], "k-123");
        assert!(azure.get(reqwest::header::AUTHORIZATION).is_none());

        let openai = headers(Provider::OpenAi);
        assert_eq!(openai[reqwest::header::AUTHORIZATION], "Bearer k-123");

        let anthropic = headers(Provider::Anthropic);
        assert_eq!(anthropic["x-api-key"], "k-123");
        assert!(headers(Provider::Google).get("api-key").is_none());
    }

    #[test]
    fn azure_uses_openai_shapes() {
        let body = Provider::Azure.build_request(&prompt(), "gpt", 50, 0.2);
        assert_eq!(body["messages"][0]["content"], "Be brief");
        let parsed = Provider::Azure
            .parse_response(&json!({"choices": [{"message": {"content": "ok"}}]}))
            .unwrap();
        assert_eq!(parsed.content, "ok");
    }

    #[tokio::test]
    async fn missing_key_is_backend_error() {
        let config = AiConfig {
            api_key: String::new(),
            ..AiConfig::default()
        };
        let backend = HttpLlmBackend::new(&config).unwrap();
        let err = backend.complete(&prompt()).await.unwrap_err();
        assert!(matches!(err, AppError::Backend(_)));
    }

    #[test]
    fn missing_text_is_backend_error() {
        let err = Provider::OpenAi.parse_response(&json!({"choices": []})).unwrap_err();
        assert!(matches!(err, AppError::Backend(_)));
    }

    #[test]
    fn error_details() {
        let status = reqwest::StatusCode::UNAUTHORIZED;
        assert_eq!(
            error_detail(status, r#"{"error": {"message": "bad key"}}"#),
            "HTTP 401: bad key"
        );
        assert_eq!(error_detail(status, "nope"), "HTTP 401: nope");
    }
}
