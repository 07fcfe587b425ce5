use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Token usage as reported by a provider, or estimated when absent
/// (spec.md §4.12, §6).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// A provider's response to `generate` (spec.md §6 External Interfaces). Non-string
/// payloads are normalized to empty content by the adapter before this is built.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

/// The single "uniform completion capability" spec.md §1 describes as a consumed,
/// out-of-scope interface. Concrete adapters below are the ambient stack's working
/// default — their wire-protocol fidelity is explicitly not part of this crate's
/// tested surface.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    async fn generate(&self, prompt: &str, params: &GenerateParams) -> anyhow::Result<GenerateResult>;

    async fn list_models(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Resolves `"providerType:modelName"` bindings, selecting the explicit id, then the
/// configured default, then the first registered provider
/// (`tandem-providers::ProviderRegistry::select_provider`).
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(config: AppConfig) -> Self {
        let providers = build_providers(&config);
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(config.default_provider)),
        }
    }

    pub async fn list(&self) -> Vec<String> {
        self.providers.read().await.iter().map(|p| p.id().to_string()).collect()
    }

    /// Registers a provider, lazily constructed from stored credentials
    /// (spec.md §4.10 "Provider binding"). A no-op for ids already present.
    pub async fn register(&self, provider: std::sync::Arc<dyn Provider>) {
        let mut providers = self.providers.write().await;
        if !providers.iter().any(|p| p.id() == provider.id()) {
            providers.push(provider);
        }
    }

    async fn select_provider(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        if let Some(id) = provider_id {
            return providers
                .iter()
                .find(|p| p.id() == id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("provider not registered: {id}"));
        }
        if let Some(default_id) = self.default_provider.read().await.as_deref() {
            if let Some(found) = providers.iter().find(|p| p.id() == default_id) {
                return Ok(found.clone());
            }
        }
        providers.first().cloned().ok_or_else(|| anyhow::anyhow!("no provider registered"))
    }

    /// Splits a `"providerType:modelName"` binding and calls `generate` on the
    /// resolved provider.
    pub async fn generate(
        &self,
        model_binding: &str,
        prompt: &str,
        params: &GenerateParams,
    ) -> anyhow::Result<GenerateResult> {
        let (provider_id, _model) = split_binding(model_binding);
        let provider = self.select_provider(provider_id.as_deref()).await?;
        provider.generate(prompt, params).await
    }
}

fn split_binding(binding: &str) -> (Option<String>, Option<String>) {
    match binding.split_once(':') {
        Some((provider, model)) => (Some(provider.to_string()), Some(model.to_string())),
        None => (None, Some(binding.to_string())),
    }
}

fn build_providers(config: &AppConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    for (id, provider_config) in &config.providers {
        if is_placeholder_api_key(provider_config.api_key.as_deref()) {
            continue;
        }
        providers.push(Arc::new(OpenAiCompatibleProvider::new(id.clone(), provider_config.clone())));
    }
    if providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider::default()));
    }
    providers
}

fn is_placeholder_api_key(key: Option<&str>) -> bool {
    matches!(key, None) || key == Some("") || key == Some("sk-placeholder")
}

/// An OpenAI-compatible REST adapter, the shape reused across many provider ids in
/// the teacher workspace (`tandem-providers::OpenAICompatibleProvider`). Only the
/// non-streaming `complete`-equivalent path is kept: spec.md's `generate` contract
/// has no streaming requirement.
pub struct OpenAiCompatibleProvider {
    id: String,
    client: reqwest::Client,
    config: ProviderConfig,
}

impl OpenAiCompatibleProvider {
    pub fn new(id: String, config: ProviderConfig) -> Self {
        Self { id, client: reqwest::Client::new(), config }
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, prompt: &str, params: &GenerateParams) -> anyhow::Result<GenerateResult> {
        let url = self
            .config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());
        let model = self.config.default_model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": params.temperature.unwrap_or(0.3),
            "max_tokens": params.max_tokens,
        });
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        let payload: serde_json::Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("provider {} returned {}: {}", self.id, status, truncate_for_error(&payload.to_string()));
        }
        let content = payload["choices"][0]["message"]["content"].as_str().unwrap_or("").to_string();
        let usage = payload.get("usage").map(|u| TokenUsage {
            input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: u["total_tokens"].as_u64().unwrap_or(0),
        });
        Ok(GenerateResult { content, usage, model })
    }
}

fn truncate_for_error(text: &str) -> String {
    if text.len() > 400 {
        format!("{}...", &text[..400])
    } else {
        text.to_string()
    }
}

/// Deterministic no-network fallback so the workspace always has a working provider,
/// mirroring `tandem-providers::LocalEchoProvider`.
#[derive(Default)]
pub struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn id(&self) -> &str {
        "local-echo"
    }

    async fn generate(&self, prompt: &str, _params: &GenerateParams) -> anyhow::Result<GenerateResult> {
        Ok(GenerateResult {
            content: format!("// echoed {} chars of prompt", prompt.len()),
            usage: Some(TokenUsage {
                input_tokens: (prompt.len() as u64).div_ceil(4),
                output_tokens: 8,
                total_tokens: (prompt.len() as u64).div_ceil(4) + 8,
            }),
            model: "local-echo".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn falls_back_to_local_echo_when_unconfigured() {
        let registry = ProviderRegistry::new(AppConfig::default());
        let result = registry.generate("anything:model", "hello", &GenerateParams::default()).await.unwrap();
        assert!(result.content.contains("echoed"));
    }

    #[tokio::test]
    async fn explicit_provider_id_wins_over_default() {
        let mut config = AppConfig {
            default_provider: Some("a".to_string()),
            providers: HashMap::new(),
        };
        config.providers.insert("a".to_string(), ProviderConfig { api_key: Some("sk-a".into()), ..Default::default() });
        config.providers.insert("b".to_string(), ProviderConfig { api_key: Some("sk-b".into()), ..Default::default() });
        let registry = ProviderRegistry::new(config);
        let selected = registry.select_provider(Some("b")).await.unwrap();
        assert_eq!(selected.id(), "b");
    }

    #[tokio::test]
    async fn unknown_explicit_provider_errors() {
        let registry = ProviderRegistry::new(AppConfig::default());
        let err = registry.select_provider(Some("nope")).await.unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }
}
