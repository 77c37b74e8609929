use std::error::Error as _;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::agent::types::AgentError;
use crate::config::AiConfig;

/// Error text fragments that mark a failure as worth retrying.
const TRANSIENT_MARKERS: [&str; 8] = [
    "eof",
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "temporary failure",
    "no such host",
    "dns error",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProvider {
    DeepSeek,
    Qwen,
    OpenAI,
    Custom,
}

impl FromStr for AiProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deepseek" => Ok(AiProvider::DeepSeek),
            "qwen" => Ok(AiProvider::Qwen),
            "openai" => Ok(AiProvider::OpenAI),
            "custom" => Ok(AiProvider::Custom),
            other => Err(format!("unknown AI provider: {other}")),
        }
    }
}

/// How the API key is attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    Bearer,
    Header { name: String },
}

/// Endpoint selection for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider: AiProvider,
    pub base_url: String,
    pub model: String,
    pub auth: AuthStrategy,
}

impl ProviderConfig {
    /// Built-in endpoint and model for a provider; `Custom` has none.
    pub fn preset(provider: AiProvider) -> Option<Self> {
        let (base_url, model) = match provider {
            AiProvider::DeepSeek => ("https://api.deepseek.com/v1", "deepseek-chat"),
            AiProvider::Qwen => ("https://dashscope.aliyuncs.com/compatible-mode/v1", "qwen-plus"),
            AiProvider::OpenAI => ("https://api.openai.com/v1", "gpt-4o-mini"),
            AiProvider::Custom => return None,
        };
        Some(Self {
            provider,
            base_url: base_url.to_string(),
            model: model.to_string(),
            auth: AuthStrategy::Bearer,
        })
    }

    /// Applies overrides on top of the preset.
    pub fn resolve(
        provider: AiProvider,
        base_url: Option<String>,
        model: Option<String>,
    ) -> Result<Self, String> {
        match Self::preset(provider) {
            Some(mut preset) => {
                if let Some(url) = base_url {
                    preset.base_url = url;
                }
                if let Some(model) = model {
                    preset.model = model;
                }
                Ok(preset)
            }
            None => Ok(Self {
                provider,
                base_url: base_url.ok_or("AI_BASE_URL is required for the custom provider")?,
                model: model.ok_or("AI_MODEL is required for the custom provider")?,
                auth: AuthStrategy::Bearer,
            }),
        }
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Chat-completion endpoint as seen by the pipeline.
#[async_trait]
pub trait AIGateway: Send + Sync {
    /// Returns the raw completion text without interpreting it.
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, AgentError>;
}

pub struct AIClient {
    client: Client,
    api_key: String,
    provider: ProviderConfig,
    max_tokens: u32,
    temperature: f32,
    max_retries: u32,
    retry_backoff: Duration,
}

impl AIClient {
    pub fn new(config: &AiConfig) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            provider: config.provider.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
        })
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.provider.model = model;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    fn request_body(&self, system_prompt: &str, user_prompt: &str) -> Value {
        json!({
            "model": self.provider.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt }
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature
        })
    }

    /// One round-trip to the completions endpoint
    async fn call_chat_api(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, AgentError> {
        let mut request = self
            .client
            .post(self.provider.completions_url())
            .json(&self.request_body(system_prompt, user_prompt));

        request = match &self.provider.auth {
            AuthStrategy::Bearer => request.bearer_auth(&self.api_key),
            AuthStrategy::Header { name } => request.header(name.as_str(), &self.api_key),
        };

        let response = request.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_reqwest_error)?;

        if !status.is_success() {
            let message = format!("{} API error {}: {}", self.provider.model, status, text);
            return Err(if is_transient_status(status) {
                AgentError::AITransient(message)
            } else {
                AgentError::AIAnalysis(message)
            });
        }

        extract_content(&text)
    }
}

#[async_trait]
impl AIGateway for AIClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, AgentError> {
        info!(
            "Calling {} ({} + {} prompt chars)",
            self.provider.model,
            system_prompt.len(),
            user_prompt.len()
        );
        retry_transient(self.max_retries, self.retry_backoff, |_| {
            self.call_chat_api(system_prompt, user_prompt)
        })
        .await
    }
}

/// Pulls `choices[0].message.content` out of a completion body.
pub fn extract_content(body: &str) -> Result<String, AgentError> {
    let json: Value = serde_json::from_str(body)?;
    json["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            AgentError::AIAnalysis("completion response has no message content".to_string())
        })
}

/// Runs `op` up to `max_attempts` times, sleeping `attempt * backoff` after
/// each transient failure. Other errors return immediately.
pub async fn retry_transient<T, F, Fut>(
    max_attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T, AgentError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let attempts = max_attempts.max(1);
    let mut last = String::new();

    for attempt in 1..=attempts {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!("AI call succeeded on attempt {}/{}", attempt, attempts);
                }
                return Ok(value);
            }
            Err(AgentError::AITransient(reason)) => {
                warn!("AI call attempt {}/{} failed: {}", attempt, attempts, reason);
                last = reason;
                if attempt < attempts {
                    let wait = backoff * attempt;
                    debug!("Retrying in {:?}", wait);
                    tokio::time::sleep(wait).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(AgentError::RetriesExhausted { attempts, last })
}

pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn classify_reqwest_error(err: reqwest::Error) -> AgentError {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }

    if err.is_timeout() || err.is_connect() || is_transient_message(&message) {
        AgentError::AITransient(message)
    } else {
        AgentError::Http(err)
    }
}
