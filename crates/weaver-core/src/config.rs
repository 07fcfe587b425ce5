use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyModeSetting {
    Ask,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogVerbosity {
    Off,
    Preview,
    Full,
}

/// The settings spec.md §6 recognizes, plus the voting defaults the ambient stack
/// needs to hand a `VotingEngine` when a Subtask doesn't override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaverSettings {
    #[serde(default = "default_safety_mode")]
    pub safety_mode: SafetyModeSetting,
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub denylist: Vec<String>,
    #[serde(default)]
    pub provider_api_keys: std::collections::HashMap<String, String>,
    #[serde(default = "default_log_verbosity")]
    pub log_verbosity: LogVerbosity,
    #[serde(default)]
    pub log_preview_chars: Option<usize>,
    #[serde(default = "default_k")]
    pub k: u32,
    #[serde(default = "default_initial_samples")]
    pub initial_samples: u32,
    #[serde(default = "default_max_samples")]
    pub max_samples: u32,
}

fn default_safety_mode() -> SafetyModeSetting {
    SafetyModeSetting::Ask
}
fn default_log_verbosity() -> LogVerbosity {
    LogVerbosity::Preview
}
fn default_k() -> u32 {
    2
}
fn default_initial_samples() -> u32 {
    2
}
fn default_max_samples() -> u32 {
    6
}

impl Default for WeaverSettings {
    fn default() -> Self {
        Self {
            safety_mode: default_safety_mode(),
            allowlist: Vec::new(),
            denylist: Vec::new(),
            provider_api_keys: Default::default(),
            log_verbosity: default_log_verbosity(),
            log_preview_chars: None,
            k: default_k(),
            initial_samples: default_initial_samples(),
            max_samples: default_max_samples(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration merging global < project < env < cli, via the same
/// recursive `deep_merge` `tandem-core::config::ConfigStore` uses (spec.md §12).
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(project_path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let global_path = resolve_global_config_path().await?;

        let global = read_json_file(&global_path).await.unwrap_or_else(|_| empty_object());
        let project = read_json_file(&project_path).await.unwrap_or_else(|_| empty_object());
        let env = env_layer();
        let cli = cli_overrides.unwrap_or_else(empty_object);

        let store = Self {
            project_path: project_path.clone(),
            global_path,
            layers: Arc::new(RwLock::new(ConfigLayers { global, project, env, cli })),
        };
        store.save_project().await?;
        Ok(store)
    }

    pub async fn get(&self) -> WeaverSettings {
        let layers = self.layers.read().await;
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        serde_json::from_value(merged).unwrap_or_default()
    }

    /// Deep-merges `patch` into the project layer and persists it (secrets scrubbed
    /// first — spec.md §12).
    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<()> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let layers = self.layers.read().await;
        let scrubbed = scrub_persisted_secrets(&layers.project);
        write_json_file(&self.project_path, &scrubbed).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw).unwrap_or_else(|_| empty_object()))
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    let serialized = serde_json::to_string_pretty(value)?;
    fs::write(path, serialized).await?;
    Ok(())
}

/// Provider API keys already supplied by the environment are not re-written to disk
/// (mirrors `tandem-core::config::strip_persisted_secrets`).
fn scrub_persisted_secrets(project: &Value) -> Value {
    let mut scrubbed = project.clone();
    if let Some(obj) = scrubbed.as_object_mut() {
        if let Some(keys) = obj.get_mut("provider_api_keys").and_then(|v| v.as_object_mut()) {
            let present: Vec<String> = keys
                .iter()
                .filter(|(provider, _)| std::env::var(env_var_for_provider(provider)).is_ok())
                .map(|(k, _)| k.clone())
                .collect();
            for provider in present {
                keys.remove(&provider);
            }
        }
    }
    scrubbed
}

fn env_var_for_provider(provider: &str) -> String {
    format!("{}_API_KEY", provider.to_uppercase())
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("WEAVER_GLOBAL_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join("weaver").join("config.json"));
    }
    Ok(PathBuf::from(".weaver").join("global_config.json"))
}

/// Builds the `env` layer from recognized environment variables, the way
/// `tandem-core::config::env_layer` overlays `OPENAI_API_KEY`/etc.
fn env_layer() -> Value {
    let mut layer = Map::new();
    if let Ok(mode) = std::env::var("WEAVER_SAFETY_MODE") {
        layer.insert("safety_mode".into(), json!(mode));
    }
    let mut keys = Map::new();
    for provider in ["openai", "anthropic", "openrouter", "groq", "mistral"] {
        if let Ok(key) = std::env::var(env_var_for_provider(provider)) {
            keys.insert(provider.to_string(), json!(key));
        }
    }
    if !keys.is_empty() {
        layer.insert("provider_api_keys".into(), Value::Object(keys));
    }
    Value::Object(layer)
}

/// Recursive `serde_json::Value` merge; `null` overlay values are skipped so they
/// never clobber a lower layer (verbatim idiom from `tandem-core::config::deep_merge`).
fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                if overlay_value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            if !overlay_value.is_null() {
                *base_slot = overlay_value.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_file() -> PathBuf {
        std::env::temp_dir().join(format!("weaver-config-test-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn defaults_apply_when_nothing_configured() {
        let store = ConfigStore::new(unique_temp_file(), None).await.unwrap();
        let settings = store.get().await;
        assert_eq!(settings.k, 2);
        assert_eq!(settings.max_samples, 6);
    }

    #[tokio::test]
    async fn project_patch_overrides_defaults() {
        let store = ConfigStore::new(unique_temp_file(), None).await.unwrap();
        store.patch_project(json!({"k": 3, "safety_mode": "auto"})).await.unwrap();
        let settings = store.get().await;
        assert_eq!(settings.k, 3);
        assert_eq!(settings.safety_mode, SafetyModeSetting::Auto);
    }

    #[tokio::test]
    async fn cli_overrides_win_over_project() {
        let store = ConfigStore::new(unique_temp_file(), Some(json!({"k": 9}))).await.unwrap();
        store.patch_project(json!({"k": 3})).await.unwrap();
        let settings = store.get().await;
        assert_eq!(settings.k, 9);
    }

    #[test]
    fn deep_merge_skips_null_overlay_values() {
        let mut base = json!({"a": 1, "b": 2});
        let overlay = json!({"a": null, "b": 5});
        deep_merge(&mut base, &overlay);
        assert_eq!(base, json!({"a": 1, "b": 5}));
    }

    #[tokio::test]
    async fn env_supplied_provider_key_is_not_persisted_to_disk() {
        std::env::set_var("OPENAI_API_KEY", "sk-test-123");
        let path = unique_temp_file();
        let store = ConfigStore::new(&path, None).await.unwrap();
        store
            .patch_project(json!({"provider_api_keys": {"openai": "sk-test-123"}}))
            .await
            .unwrap();
        let raw = fs::read_to_string(&path).await.unwrap();
        assert!(!raw.contains("sk-test-123"));
        std::env::remove_var("OPENAI_API_KEY");
    }
}
