//! Text-completion backend for the enrichment pass. Talks to any
//! OpenAI-compatible `/v1/chat/completions` endpoint (Ollama serves one
//! locally), so the same code path covers local and hosted models.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

pub const COMPLETION_URL_ENV: &str = "MIP_COMPLETION_URL";
pub const COMPLETION_MODEL_ENV: &str = "MIP_COMPLETION_MODEL";
pub const COMPLETION_API_KEY_ENV: &str = "MIP_COMPLETION_API_KEY";

const DEFAULT_COMPLETION_URL: &str = "http://localhost:11434";
const DEFAULT_COMPLETION_MODEL: &str = "llama3.2";
const COMPLETION_TIMEOUT_SECONDS: u64 = 30;
const COMPLETION_TEMPERATURE: f64 = 0.2;

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;

    /// Model identifier recorded alongside each analysis.
    fn model_name(&self) -> String;
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

pub struct HttpCompletion {
    base_url: String,
    model: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpCompletion {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(COMPLETION_TIMEOUT_SECONDS))
            .build()
            .context("build completion http client")?;

        Ok(Self {
            base_url,
            model,
            api_key,
            http,
        })
    }

    pub fn from_env() -> Result<Self> {
        let base_url = env_setting(COMPLETION_URL_ENV)
            .unwrap_or_else(|| DEFAULT_COMPLETION_URL.to_string());
        let model = env_setting(COMPLETION_MODEL_ENV)
            .unwrap_or_else(|| DEFAULT_COMPLETION_MODEL.to_string());
        let api_key = env_setting(COMPLETION_API_KEY_ENV);

        Self::new(base_url, model, api_key)
    }
}

fn env_setting(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[async_trait]
impl CompletionBackend for HttpCompletion {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let endpoint = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt }
            ],
            "temperature": COMPLETION_TEMPERATURE,
            "stream": false
        });

        let mut request = self.http.post(&endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("completion request to {endpoint}"))?;

        let status = response.status();
        if !status.is_success() {
            let detail: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            bail!("completion endpoint returned {status}: {detail}");
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("parse completion response")?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            bail!("completion returned no content");
        }
        Ok(content)
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}
