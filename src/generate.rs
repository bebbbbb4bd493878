//! Text generation adapter over a handful of local and hosted backends.

use crate::config::LlmConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const HF_INFERENCE_URL: &str = "https://api-inference.huggingface.co/models";
const DEFAULT_WEBUI_URL: &str = "http://127.0.0.1:7860";
const WEBUI_ENDPOINTS: [&str; 5] = [
    "/api/generate",
    "/api/v1/generate",
    "/generate",
    "/api/textgen",
    "/api/v1/textgen",
];
const MOCK_ECHO_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Auto,
    Mock,
    LlamaCpp,
    HfApi,
    Webui,
    Remote,
}

impl Backend {
    pub const ALL: [Backend; 6] = [
        Backend::Auto,
        Backend::Mock,
        Backend::LlamaCpp,
        Backend::HfApi,
        Backend::Webui,
        Backend::Remote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Auto => "auto",
            Backend::Mock => "mock",
            Backend::LlamaCpp => "llama_cpp",
            Backend::HfApi => "hf_api",
            Backend::Webui => "webui",
            Backend::Remote => "remote",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown backend '{0}', expected one of auto, mock, llama_cpp, hf_api, webui, remote")]
pub struct UnknownBackend(String);

impl FromStr for Backend {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Backend::ALL
            .into_iter()
            .find(|b| b.as_str() == wanted)
            .ok_or_else(|| UnknownBackend(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("{backend} backend selected but {missing} is not configured")]
    NotConfigured {
        backend: Backend,
        missing: &'static str,
    },
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        source: reqwest::Error,
    },
    #[error("webui adapter could not reach any endpoint; last error: {0}")]
    WebuiUnreachable(String),
}

pub struct Generator {
    client: Client,
    cfg: LlmConfig,
}

impl Generator {
    pub fn new(cfg: LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, cfg }
    }

    pub fn default_max_tokens(&self) -> u32 {
        self.cfg.max_tokens
    }

    /// Backend configured as the default; falls back to `auto` if the
    /// configured name does not parse.
    pub fn default_backend(&self) -> Backend {
        self.cfg.default_backend.parse().unwrap_or(Backend::Auto)
    }

    /// Maps `auto` to a concrete backend: a configured llama.cpp server wins,
    /// anything else uses the mock.
    pub fn resolve(&self, requested: Backend) -> Backend {
        match requested {
            Backend::Auto if self.cfg.llama_server_url.is_some() => Backend::LlamaCpp,
            Backend::Auto => Backend::Mock,
            other => other,
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        backend: Option<Backend>,
        force_mock: bool,
    ) -> Result<String, GenerateError> {
        let requested = backend.unwrap_or_else(|| self.default_backend());
        let chosen = if force_mock {
            Backend::Mock
        } else {
            self.resolve(requested)
        };
        debug!(backend = %chosen, max_tokens, "generating text");

        match chosen {
            Backend::Mock | Backend::Auto => Ok(mock_reply(prompt, max_tokens)),
            Backend::LlamaCpp => self.llama_cpp(prompt, max_tokens).await,
            Backend::HfApi => self.hf_api(prompt, max_tokens).await,
            Backend::Remote => self.remote(prompt, max_tokens).await,
            Backend::Webui => self.webui(prompt, max_tokens).await,
        }
    }

    async fn llama_cpp(&self, prompt: &str, max_tokens: u32) -> Result<String, GenerateError> {
        let base = self
            .cfg
            .llama_server_url
            .as_deref()
            .ok_or(GenerateError::NotConfigured {
                backend: Backend::LlamaCpp,
                missing: "LLAMA_SERVER_URL",
            })?;
        let url = format!("{}/completion", base.trim_end_matches('/'));
        let body = json!({ "prompt": prompt, "n_predict": max_tokens });
        self.post_json(&url, None, &body).await
    }

    async fn hf_api(&self, prompt: &str, max_tokens: u32) -> Result<String, GenerateError> {
        let token = self.cfg.hf_token.as_deref().ok_or(GenerateError::NotConfigured {
            backend: Backend::HfApi,
            missing: "HF_TOKEN",
        })?;
        let model = self.cfg.hf_model.as_deref().ok_or(GenerateError::NotConfigured {
            backend: Backend::HfApi,
            missing: "HF_MODEL",
        })?;
        let url = format!("{HF_INFERENCE_URL}/{model}");
        let body = json!({
            "inputs": prompt,
            "parameters": { "max_new_tokens": max_tokens },
        });
        self.post_json(&url, Some(token), &body).await
    }

    async fn remote(&self, prompt: &str, max_tokens: u32) -> Result<String, GenerateError> {
        let url = self.cfg.remote_url.as_deref().ok_or(GenerateError::NotConfigured {
            backend: Backend::Remote,
            missing: "REMOTE_API_URL",
        })?;
        let body = json!({ "prompt": prompt, "max_tokens": max_tokens });
        self.post_json(url, None, &body).await
    }

    /// Tries each known text-generation-webui style endpoint in order; the
    /// first successful response wins.
    async fn webui(&self, prompt: &str, max_tokens: u32) -> Result<String, GenerateError> {
        let base = self
            .cfg
            .webui_url
            .as_deref()
            .unwrap_or(DEFAULT_WEBUI_URL)
            .trim_end_matches('/');
        let body = json!({ "prompt": prompt, "max_new_tokens": max_tokens });

        let mut last_error = String::from("no endpoints tried");
        for endpoint in WEBUI_ENDPOINTS {
            let url = format!("{base}{endpoint}");
            match self.post_json(&url, None, &body).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    debug!(url = %url, error = %err, "webui endpoint failed");
                    last_error = err.to_string();
                }
            }
        }
        warn!(base = %base, "webui adapter exhausted all endpoints");
        Err(GenerateError::WebuiUnreachable(last_error))
    }

    async fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
    ) -> Result<String, GenerateError> {
        let mut req = self.client.post(url).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let http_err = |source| GenerateError::Http {
            url: url.to_string(),
            source,
        };

        let resp = req
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?;
        let text = resp.text().await.map_err(http_err)?;
        Ok(interpret_body(&text))
    }
}

pub fn mock_reply(prompt: &str, max_tokens: u32) -> String {
    let head: String = prompt
        .trim()
        .replace('\n', " ")
        .chars()
        .take(MOCK_ECHO_CHARS)
        .collect();
    format!("[mock-lm] Generated (max_tokens={max_tokens}): Hello! (echo) {head}")
}

/// Pulls generated text out of the response shapes the supported servers
/// use. Unknown JSON is returned serialized; non-JSON bodies are returned
/// verbatim.
pub fn interpret_body(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => extract_text(&value).unwrap_or_else(|| value.to_string()),
        Err(_) => body.to_string(),
    }
}

fn extract_text(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(first) = map
                .get("results")
                .and_then(Value::as_array)
                .and_then(|r| r.first())
            {
                if let Some(text) = text_field(first) {
                    return Some(text);
                }
            }
            text_field(value)
        }
        Value::Array(items) => items.first().and_then(text_field),
        _ => None,
    }
}

fn text_field(value: &Value) -> Option<String> {
    ["generated_text", "text", "content", "result"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(str::to_string)
}
