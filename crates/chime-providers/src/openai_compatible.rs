//! Unified OpenAI-compatible chat-completions client.
//!
//! Providers are distinguished only by endpoint URL, auth style, and API key.
//! The estimator uses a single short completion per call, so there is no
//! streaming, tool calling, or retry logic here.

use chime_core::config::EstimatorConfig;
use chime_core::error::{ChimeError, Result};
use serde_json::{Value, json};

use crate::provider_registry::{self, AuthStyle, ProviderConfig};

/// Sampling parameters for one completion.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionParams {
    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// A client that works with any OpenAI-compatible API.
pub struct OpenAiCompatibleClient {
    /// Provider name (e.g., "groq", "openai", "ollama").
    name: String,
    /// API key for authentication.
    api_key: String,
    /// Base URL for the API (e.g., "https://api.groq.com/openai/v1").
    base_url: String,
    /// Path for chat completions (e.g., "/chat/completions").
    chat_path: String,
    /// Authentication style.
    auth_style: AuthStyle,
    /// HTTP client, carrying the request timeout.
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    /// Create from the estimator configuration.
    ///
    /// `provider` is a registry name or `custom:<url>`.
    pub fn from_config(config: &EstimatorConfig) -> Result<Self> {
        let provider = config.provider.as_str();
        if provider.starts_with("custom:") {
            return Self::custom(provider, config);
        }
        let registry = provider_registry::get_provider_config(provider).ok_or_else(|| {
            ChimeError::Config(format!(
                "unknown estimator provider '{provider}' (known: {}, or custom:<url>)",
                provider_registry::all_provider_names().join(", ")
            ))
        })?;
        Self::from_registry(registry, config)
    }

    /// Create from a known provider config.
    ///
    /// Resolution order:
    /// - API key: `config.api_key` > env vars > empty
    /// - Base URL: `config.base_url` > env override > registry default
    pub fn from_registry(registry: &ProviderConfig, config: &EstimatorConfig) -> Result<Self> {
        let api_key = if !config.api_key.is_empty() {
            config.api_key.clone()
        } else {
            registry
                .env_keys
                .iter()
                .find_map(|key| std::env::var(key).ok())
                .unwrap_or_default()
        };

        if registry.auth_style != AuthStyle::None && api_key.is_empty() {
            return Err(ChimeError::Config(format!(
                "{} API key missing (set estimator.api_key or {})",
                registry.name,
                registry.env_keys.join(" / ")
            )));
        }

        let base_url = if !config.base_url.is_empty() {
            config.base_url.trim_end_matches('/').to_string()
        } else {
            registry
                .base_url_env
                .and_then(|env_key| {
                    let val = std::env::var(env_key).ok()?;
                    // OLLAMA_HOST / LLAMACPP_HOST usually omit the /v1 suffix
                    if val.ends_with("/v1") {
                        Some(val)
                    } else {
                        Some(format!("{}/v1", val.trim_end_matches('/')))
                    }
                })
                .unwrap_or_else(|| registry.base_url.to_string())
        };

        Ok(Self {
            name: registry.name.to_string(),
            api_key,
            base_url,
            chat_path: registry.chat_path.to_string(),
            auth_style: registry.auth_style,
            client: build_http_client(config)?,
        })
    }

    /// Create for a custom endpoint (e.g., "custom:https://my-server.com/v1").
    pub fn custom(endpoint: &str, config: &EstimatorConfig) -> Result<Self> {
        let base_url = endpoint
            .strip_prefix("custom:")
            .unwrap_or(endpoint)
            .trim_end_matches('/')
            .to_string();

        let api_key = if !config.api_key.is_empty() {
            config.api_key.clone()
        } else {
            std::env::var("CUSTOM_API_KEY").unwrap_or_default()
        };

        let auth_style = if api_key.is_empty() {
            AuthStyle::None
        } else {
            AuthStyle::Bearer
        };

        Ok(Self {
            name: "custom".to_string(),
            api_key,
            base_url,
            chat_path: "/chat/completions".to_string(),
            auth_style,
            client: build_http_client(config)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the auth header for the request.
    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_style {
            AuthStyle::Bearer if !self.api_key.is_empty() => {
                req.header("Authorization", format!("Bearer {}", self.api_key))
            }
            _ => req,
        }
    }

    /// Run one system+user completion and return the trimmed reply text.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        params: &CompletionParams,
    ) -> Result<String> {
        let body = json!({
            "model": params.model,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        let url = format!("{}{}", self.base_url, self.chat_path);
        let req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        let req = self.apply_auth(req);

        let resp = req.send().await.map_err(|e| {
            ChimeError::EstimatorUnavailable(format!("{} request failed ({url}): {e}", self.name))
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ChimeError::EstimatorUnavailable(format!(
                "{} API error {}: {}",
                self.name, status, text
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| ChimeError::EstimatorUnavailable(format!("{} bad body: {e}", self.name)))?;

        json["choices"]
            .get(0)
            .and_then(|choice| choice["message"]["content"].as_str())
            .map(|content| content.trim().to_string())
            .ok_or_else(|| {
                ChimeError::EstimatorUnavailable(format!("{}: no content in response", self.name))
            })
    }
}

fn build_http_client(config: &EstimatorConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .build()
        .map_err(|e| ChimeError::Http(format!("failed to build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> EstimatorConfig {
        EstimatorConfig {
            model: "test-model".into(),
            timeout_ms: 1000,
            ..EstimatorConfig::default()
        }
    }

    fn reply(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        })
    }

    #[tokio::test]
    async fn test_complete_returns_trimmed_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({ "model": "test-model", "max_tokens": 10 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("  45\n")))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config();
        let client = OpenAiCompatibleClient::custom(&server.uri(), &config).unwrap();
        let text = client
            .complete("sys", "user", &CompletionParams::from_config(&config))
            .await
            .unwrap();
        assert_eq!(text, "45");
    }

    #[tokio::test]
    async fn test_bearer_auth_sent_when_key_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Authorization", "Bearer secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("10")))
            .expect(1)
            .mount(&server)
            .await;

        let config = EstimatorConfig {
            api_key: "secret-key".into(),
            ..test_config()
        };
        let url = format!("custom:{}", server.uri());
        let client = OpenAiCompatibleClient::custom(&url, &config).unwrap();
        assert_eq!(client.name(), "custom");
        let text = client
            .complete("sys", "user", &CompletionParams::from_config(&config))
            .await
            .unwrap();
        assert_eq!(text, "10");
    }

    #[tokio::test]
    async fn test_http_error_is_estimator_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Rate limit exceeded"))
            .mount(&server)
            .await;

        let config = test_config();
        let client = OpenAiCompatibleClient::custom(&server.uri(), &config).unwrap();
        let err = client
            .complete("sys", "user", &CompletionParams::from_config(&config))
            .await
            .unwrap_err();
        assert!(matches!(err, ChimeError::EstimatorUnavailable(_)));
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn test_missing_choices_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
            )
            .mount(&server)
            .await;

        let config = test_config();
        let client = OpenAiCompatibleClient::custom(&server.uri(), &config).unwrap();
        assert!(client
            .complete("sys", "user", &CompletionParams::from_config(&config))
            .await
            .is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = EstimatorConfig {
            provider: "nope".into(),
            ..test_config()
        };
        let Err(ChimeError::Config(msg)) = OpenAiCompatibleClient::from_config(&config) else {
            panic!("expected a config error");
        };
        assert!(msg.contains("'nope'"));
        assert!(msg.contains("groq"));
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let config = EstimatorConfig {
            provider: "llamacpp".into(),
            base_url: "http://127.0.0.1:9/v1/".into(),
            ..test_config()
        };
        let client = OpenAiCompatibleClient::from_config(&config).unwrap();
        assert_eq!(client.name(), "llamacpp");
        assert_eq!(client.base_url, "http://127.0.0.1:9/v1");
    }
}
