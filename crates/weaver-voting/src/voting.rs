use std::collections::HashMap;

use tracing::{debug, info};
use weaver_providers::{GenerateParams, ProviderRegistry};
use weaver_types::Candidate;

use crate::paraphraser::Paraphraser;
use crate::red_flag::{evaluate, RedFlagRule};

const DEFAULT_TEMPERATURE_SCHEDULE: &[f64] = &[0.0, 0.3, 0.5, 0.6, 0.6];

/// Parameters governing one voting invocation (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct VotingConfig {
    pub k: u32,
    pub initial_samples: u32,
    pub max_samples: u32,
    pub fixed_temperature: Option<f64>,
    pub red_flag_rules: Vec<RedFlagRule>,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self { k: 2, initial_samples: 2, max_samples: 6, fixed_temperature: None, red_flag_rules: Vec::new() }
    }
}

/// Outcome of one adaptive voting run.
#[derive(Debug, Clone)]
pub struct VotingResult {
    pub winner: Option<String>,
    pub achieved_margin: bool,
    pub candidates: Vec<Candidate>,
    pub calls_made: u32,
}

fn temperature_for(config: &VotingConfig, index: usize) -> f64 {
    if let Some(fixed) = config.fixed_temperature {
        return fixed;
    }
    let last = DEFAULT_TEMPERATURE_SCHEDULE.len() - 1;
    DEFAULT_TEMPERATURE_SCHEDULE[index.min(last)]
}

/// Adaptive first-to-lead-by-k consensus over a provider's outputs (spec.md §4.6),
/// looping Paraphraser + Provider + RedFlagger exactly as the Orchestrator's voting
/// step is specified to.
pub struct VotingEngine {
    providers: ProviderRegistry,
    paraphraser: Option<Paraphraser>,
}

impl VotingEngine {
    pub fn new(providers: ProviderRegistry, paraphraser: Option<Paraphraser>) -> Self {
        Self { providers, paraphraser }
    }

    pub async fn vote(&self, model_binding: &str, prompt: &str, config: &VotingConfig) -> VotingResult {
        let mut tally: HashMap<String, u32> = HashMap::new();
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut calls_made = 0u32;

        for i in 0..config.max_samples as usize {
            let round_prompt = match (&self.paraphraser, i) {
                (Some(paraphraser), _) if i > 0 => {
                    paraphraser.paraphrase(&self.providers, prompt, 0, i).await
                }
                _ => prompt.to_string(),
            };
            let temperature = temperature_for(config, i);
            let params = GenerateParams { temperature: Some(temperature), max_tokens: None };

            calls_made += 1;
            let output = match self.providers.generate(model_binding, &round_prompt, &params).await {
                Ok(result) => result.content,
                Err(err) => {
                    info!(error = %err, sample_index = i, "provider call failed, treating as red-flagged");
                    candidates.push(Candidate {
                        model: model_binding.to_string(),
                        output: String::new(),
                        red_flags: vec!["provider-error".to_string()],
                        sample_index: i,
                        temperature,
                    });
                    continue;
                }
            };

            let red_flags = evaluate(&output, &config.red_flag_rules);
            if !red_flags.is_empty() {
                candidates.push(Candidate { model: model_binding.to_string(), output, red_flags, sample_index: i, temperature });
                continue;
            }

            *tally.entry(output.clone()).or_insert(0) += 1;
            candidates.push(Candidate {
                model: model_binding.to_string(),
                output: output.clone(),
                red_flags: Vec::new(),
                sample_index: i,
                temperature,
            });

            let (leader, lead_by) = leader_and_margin(&tally);
            debug!(sample_index = i, temperature, lead_by, "vote sample tallied");
            if i + 1 >= config.initial_samples as usize && lead_by >= config.k {
                return VotingResult { winner: leader, achieved_margin: true, candidates, calls_made };
            }
        }

        let winner = leader_and_margin(&tally).0;
        VotingResult { winner, achieved_margin: false, candidates, calls_made }
    }
}

/// Returns the current plurality leader and its lead over the runner-up. Ties in
/// vote count keep the first-reached leader per insertion order isn't guaranteed by
/// a HashMap, so ties resolve by the lexicographically smaller output — irrelevant
/// to the early-exit path since that requires a strict tally max each iteration.
fn leader_and_margin(tally: &HashMap<String, u32>) -> (Option<String>, u32) {
    let mut sorted: Vec<(&String, &u32)> = tally.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    match sorted.as_slice() {
        [] => (None, 0),
        [(leader, votes)] => (Some((*leader).clone()), **votes),
        [(leader, votes), (_, runner_up), ..] => (Some((*leader).clone()), **votes - **runner_up),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weaver_providers::{AppConfig, GenerateResult, Provider};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A deterministic stand-in provider that replays a fixed sequence of outputs,
    /// matching the scenario scripts in spec.md §8.
    struct ScriptedProvider {
        id: String,
        outputs: Vec<&'static str>,
        call_count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Provider for ScriptedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        async fn generate(&self, _prompt: &str, _params: &GenerateParams) -> anyhow::Result<GenerateResult> {
            let index = self.call_count.fetch_add(1, Ordering::SeqCst);
            let content = self.outputs.get(index).copied().unwrap_or("").to_string();
            Ok(GenerateResult { content, usage: None, model: self.id.clone() })
        }
    }

    async fn scripted_registry(outputs: Vec<&'static str>) -> ProviderRegistry {
        let registry = ProviderRegistry::new(AppConfig::default());
        registry
            .register(Arc::new(ScriptedProvider {
                id: "scripted".to_string(),
                outputs,
                call_count: AtomicUsize::new(0),
            }))
            .await;
        registry
    }

    #[tokio::test]
    async fn voting_consensus_scenario_from_spec() {
        let registry = scripted_registry(vec!["A", "B", "A", "A"]).await;
        let engine = VotingEngine::new(registry, None);
        let config = VotingConfig { k: 2, initial_samples: 2, max_samples: 6, ..Default::default() };
        let result = engine.vote("scripted:any", "goal", &config).await;
        assert_eq!(result.winner, Some("A".to_string()));
        assert!(result.achieved_margin);
        assert_eq!(result.calls_made, 4);
    }

    #[tokio::test]
    async fn red_flag_fallback_scenario_from_spec() {
        let registry = scripted_registry(vec!["xxxxxxxxxxx", "ok", "ok"]).await;
        let engine = VotingEngine::new(registry, None);
        let config = VotingConfig {
            k: 1,
            initial_samples: 1,
            max_samples: 3,
            fixed_temperature: Some(0.0),
            red_flag_rules: vec![RedFlagRule { max_chars: Some(10), ..Default::default() }],
        };
        let result = engine.vote("scripted:any", "goal", &config).await;
        assert_eq!(result.winner, Some("ok".to_string()));
        assert!(result.achieved_margin);
    }

    #[tokio::test]
    async fn exhaustion_without_margin_returns_plurality_leader() {
        let registry = scripted_registry(vec!["A", "B", "A", "B", "A", "B"]).await;
        let engine = VotingEngine::new(registry, None);
        let config = VotingConfig { k: 5, initial_samples: 2, max_samples: 6, ..Default::default() };
        let result = engine.vote("scripted:any", "goal", &config).await;
        assert!(!result.achieved_margin);
        assert_eq!(result.calls_made, 6);
    }

    #[tokio::test]
    async fn bounded_sampling_never_exceeds_max_samples() {
        let registry = scripted_registry(vec!["A"; 20].into_iter().collect()).await;
        let engine = VotingEngine::new(registry, None);
        let config = VotingConfig { k: 100, initial_samples: 1, max_samples: 4, ..Default::default() };
        let result = engine.vote("scripted:any", "goal", &config).await;
        assert!(result.calls_made <= 4);
    }
}
