use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;
use weaver_providers::{GenerateParams, ProviderRegistry};

const CACHE_CAPACITY: usize = 256;
const PREFIX_LEN: usize = 80;

/// Rewrites a prompt to decorrelate repeated samples (spec.md §4.5). The first
/// sample of the first round always passes through verbatim; later calls ask a
/// cheap model to reformulate, and any failure falls back to the original rather
/// than failing the voting loop.
pub struct Paraphraser {
    model_binding: String,
    cache: Arc<Mutex<VecDeque<(String, String)>>>,
}

impl Paraphraser {
    pub fn new(model_binding: impl Into<String>) -> Self {
        Self { model_binding: model_binding.into(), cache: Arc::new(Mutex::new(VecDeque::new())) }
    }

    pub async fn paraphrase(
        &self,
        providers: &ProviderRegistry,
        prompt: &str,
        round: u32,
        sample_index: usize,
    ) -> String {
        if round == 0 && sample_index == 0 {
            return prompt.to_string();
        }

        let cache_key = cache_key(round, sample_index, &self.model_binding, prompt);
        {
            let cache = self.cache.lock().await;
            if let Some((_, cached)) = cache.iter().find(|(key, _)| key == &cache_key) {
                return cached.clone();
            }
        }

        let rewrite_prompt = format!(
            "Rewrite the following instructions, preserving their exact intent and constraints, using different wording:\n\n{prompt}"
        );
        let params = GenerateParams { temperature: Some(0.7), max_tokens: None };
        match providers.generate(&self.model_binding, &rewrite_prompt, &params).await {
            Ok(result) if !result.content.trim().is_empty() => {
                self.insert_cache(cache_key, result.content.clone()).await;
                result.content
            }
            Ok(_) => prompt.to_string(),
            Err(err) => {
                debug!(error = %err, "paraphrase failed, falling back to original prompt");
                prompt.to_string()
            }
        }
    }

    async fn insert_cache(&self, key: String, value: String) {
        let mut cache = self.cache.lock().await;
        if cache.len() >= CACHE_CAPACITY {
            cache.pop_front();
        }
        cache.push_back((key, value));
    }
}

fn cache_key(round: u32, sample_index: usize, model: &str, prompt: &str) -> String {
    let prefix: String = prompt.chars().take(PREFIX_LEN).collect();
    format!("{round}:{sample_index}:{model}:{prefix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sample_of_first_round_is_verbatim() {
        let paraphraser = Paraphraser::new("local-echo:any");
        let providers = ProviderRegistry::new(weaver_providers::AppConfig::default());
        let out = paraphraser.paraphrase(&providers, "original prompt", 0, 0).await;
        assert_eq!(out, "original prompt");
    }

    #[tokio::test]
    async fn later_samples_are_rewritten_by_the_model() {
        let paraphraser = Paraphraser::new("local-echo:any");
        let providers = ProviderRegistry::new(weaver_providers::AppConfig::default());
        let out = paraphraser.paraphrase(&providers, "original prompt", 0, 1).await;
        assert_ne!(out, "original prompt");
    }

    #[tokio::test]
    async fn repeated_calls_hit_the_cache() {
        let paraphraser = Paraphraser::new("local-echo:any");
        let providers = ProviderRegistry::new(weaver_providers::AppConfig::default());
        let first = paraphraser.paraphrase(&providers, "same prompt", 1, 2).await;
        let second = paraphraser.paraphrase(&providers, "same prompt", 1, 2).await;
        assert_eq!(first, second);
    }
}
