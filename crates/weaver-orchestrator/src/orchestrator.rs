use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use weaver_core::command_runner::CommandRunner;
use weaver_core::guard::Guard;
use weaver_core::store::SharedStore;
use weaver_core::{EventBus, LogVerbosity};
use weaver_providers::ProviderRegistry;
use weaver_types::{ApplyType, Event, Feature, Project, Subtask, SubtaskStatus, WeaverError, WeaverResult};
use weaver_voting::{ActionExecutor, Paraphraser, VotingConfig, VotingEngine};

const CORE_CONVENTIONS: &str =
    "Match the existing project style. Do not invent libraries that are not already used. \
     Output file content, never shell instructions, unless the subtask explicitly asks for a command.";

/// Outcome of running one Subtask end-to-end (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct SubtaskOutcome {
    pub winner: Option<String>,
    pub lead_by: u32,
    pub applied: bool,
    pub error: Option<String>,
}

/// Runs one Subtask: builds the prompt, invokes `VotingEngine`, applies the winner
/// via `ActionExecutor`, and emits the ordered `step-*` event sequence (spec.md
/// §4.8, §5 "Event emission for a given subtask is strictly ordered").
pub struct Orchestrator {
    store: SharedStore,
    event_bus: EventBus,
    providers: ProviderRegistry,
    log_verbosity: LogVerbosity,
}

impl Orchestrator {
    pub fn new(store: SharedStore, event_bus: EventBus, providers: ProviderRegistry) -> Self {
        Self { store, event_bus, providers, log_verbosity: LogVerbosity::Preview }
    }

    /// Sets the `--log-verbosity` level gating how much of a prompt/output is logged
    /// at debug level (spec.md §6, SPEC_FULL.md §10).
    pub fn with_log_verbosity(mut self, log_verbosity: LogVerbosity) -> Self {
        self.log_verbosity = log_verbosity;
        self
    }

    #[instrument(skip(self, guard, command_runner, cancel), fields(subtask_id = %subtask.id))]
    pub async fn run_subtask(
        &self,
        project: &Project,
        feature: &Feature,
        subtask: &Subtask,
        model_binding: &str,
        voting_config: VotingConfig,
        guard: &Guard,
        command_runner: &CommandRunner,
        cancel: CancellationToken,
    ) -> WeaverResult<SubtaskOutcome> {
        self.emit(project, feature, subtask, "step-start", serde_json::json!({})).await;

        let prompt = build_prompt(feature, subtask);
        debug!(logged = %self.log_line(&prompt), "subtask prompt built");

        let paraphraser = Paraphraser::new(model_binding);
        let voting_engine = VotingEngine::new(self.providers.clone(), Some(paraphraser));
        let result = voting_engine.vote(model_binding, &prompt, &voting_config).await;

        self.store
            .record_model_usage(&project.id, Some("voter"), model_binding, estimate_tokens(&prompt) * result.calls_made as u64, estimate_output_tokens(&result))
            .await?;

        for candidate in &result.candidates {
            if let Err(err) = self.store.create_candidate(&project.id, &feature.id, &subtask.id, candidate.clone()).await {
                info!(error = %err, "failed to persist candidate");
            }
        }

        self.emit(project, feature, subtask, "vote-summary", vote_summary_payload(&result, &voting_config)).await;

        let Some(winner) = result.winner.clone() else {
            self.emit(project, feature, subtask, "step-error", serde_json::json!({"error": "no-winner"})).await;
            return Ok(SubtaskOutcome { winner: None, lead_by: 0, applied: false, error: Some("no-winner".to_string()) });
        };

        let executor = ActionExecutor::new(guard, command_runner);
        let apply_outcome = executor.apply(subtask.apply_type, subtask.apply_path.as_deref(), &winner, cancel).await;

        match apply_outcome {
            Ok(_results) => {
                self.emit(project, feature, subtask, "step-completed", serde_json::json!({"winner_preview": preview(&winner)})).await;
                Ok(SubtaskOutcome { winner: Some(winner), lead_by: lead_by(&result), applied: true, error: None })
            }
            Err(err) => {
                self.emit(project, feature, subtask, "step-error", serde_json::json!({"error": err.to_string()})).await;
                Ok(SubtaskOutcome { winner: Some(winner), lead_by: lead_by(&result), applied: false, error: Some(err.to_string()) })
            }
        }
    }

    /// Formats `text` per the configured log verbosity: nothing at `Off`, a 200-char
    /// preview at `Preview`, the whole string at `Full` (spec.md §6 "log verbosity for
    /// LLM interactions: off | preview | full").
    fn log_line(&self, text: &str) -> String {
        match self.log_verbosity {
            LogVerbosity::Off => format!("<{} bytes, logging off>", text.len()),
            LogVerbosity::Preview => preview(text),
            LogVerbosity::Full => text.to_string(),
        }
    }

    async fn emit(&self, project: &Project, feature: &Feature, subtask: &Subtask, event_type: &str, payload: serde_json::Value) {
        let mut event = Event::new(event_type, payload);
        event.project_id = Some(project.id.clone());
        event.feature_id = Some(feature.id.clone());
        event.subtask_id = Some(subtask.id.clone());
        if let Ok(recorded) = self.store.record_event(event).await {
            self.event_bus.publish(recorded);
        } else {
            info!(event_type, "failed to persist event");
        }
    }
}

fn lead_by(result: &weaver_voting::VotingResult) -> u32 {
    let mut tally: HashMap<&str, u32> = HashMap::new();
    for candidate in &result.candidates {
        if candidate.red_flags.is_empty() {
            *tally.entry(candidate.output.as_str()).or_insert(0) += 1;
        }
    }
    let mut counts: Vec<u32> = tally.into_values().collect();
    counts.sort_unstable_by(|a, b| b.cmp(a));
    match counts.as_slice() {
        [] => 0,
        [only] => *only,
        [leader, runner_up, ..] => leader - runner_up,
    }
}

fn vote_summary_payload(result: &weaver_voting::VotingResult, config: &VotingConfig) -> serde_json::Value {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    let mut temperature_histogram: HashMap<String, u32> = HashMap::new();
    for candidate in &result.candidates {
        if candidate.red_flags.is_empty() {
            *counts.entry(candidate.output.as_str()).or_insert(0) += 1;
        }
        *temperature_histogram.entry(format!("{:.1}", candidate.temperature)).or_insert(0) += 1;
    }
    let mut top: Vec<(&str, u32)> = counts.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1));
    top.truncate(3);

    serde_json::json!({
        "sampleCount": result.candidates.len(),
        "uniqueOutputs": top.len(),
        "k": config.k,
        "leadBy": lead_by(result),
        "winnerVoteCount": top.first().map(|(_, count)| *count).unwrap_or(0),
        "marginMet": result.achieved_margin,
        "temperatureHistogram": temperature_histogram,
        "topOutputs": top.iter().map(|(output, count)| serde_json::json!({"preview": preview(output), "count": count})).collect::<Vec<_>>(),
        "winnerPreview": result.winner.as_deref().map(preview),
    })
}

fn preview(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() > 200 {
        format!("{}…", trimmed.chars().take(200).collect::<String>())
    } else {
        trimmed.to_string()
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

fn estimate_output_tokens(result: &weaver_voting::VotingResult) -> u64 {
    result.candidates.iter().map(|c| estimate_tokens(&c.output)).sum()
}

/// Builds the apply-type-specific prompt per spec.md §4.8 step 2.
fn build_prompt(feature: &Feature, subtask: &Subtask) -> String {
    let apply_instruction = match subtask.apply_type {
        ApplyType::WriteFile | ApplyType::WriteFileFromState => {
            "Output the complete content of the target file. Do not include any commentary outside the file content."
        }
        ApplyType::AppendFile => "Output only the content to append to the target file.",
        ApplyType::EditFile => {
            "Output a JSON object {\"old_string\": ..., \"new_string\": ...} where old_string includes at least 3 lines of surrounding context."
        }
        ApplyType::StatePatch => "Output a unified diff against the target file.",
        ApplyType::Actions => {
            "Output a JSON object {\"actions\": [...] } using the supported action kinds (write_file, append_file, apply_patch, replace_range, run_cmd, request_info)."
        }
    };

    format!(
        "{CORE_CONVENTIONS}\n\nFeature: {}\nGoal: {}\n\nSubtask: {}\n\n{apply_instruction}",
        feature.name, feature.description, subtask.intent,
    )
}

pub fn validation_error_for_missing_bindings(project: &Project) -> WeaverResult<()> {
    if project.models.is_fully_bound() {
        Ok(())
    } else {
        Err(WeaverError::validation_with_reason(
            format!("project {} has unbound model roles", project.id),
            "unbound-models",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weaver_core::store::Store;
    use weaver_providers::AppConfig;
    use weaver_types::Priority;

    fn temp_store_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("weaver-orchestrator-test-{}.json", uuid::Uuid::new_v4()))
    }

    fn temp_root() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("weaver-orchestrator-root-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn write_file_subtask_runs_end_to_end_with_local_echo_provider() {
        let store = std::sync::Arc::new(Store::new(temp_store_path()).await.unwrap());
        let root = temp_root();
        let project = store.create_project(Project::new("p", root.to_string_lossy())).await.unwrap();
        let feature = store.create_feature(Feature::new(&project.id, "Greeter", Priority::A, 0)).await.unwrap();
        let mut subtask = store
            .create_subtask(&feature.id, "write a greeting function".to_string(), ApplyType::WriteFile)
            .await
            .unwrap();
        subtask.apply_path = Some("greet.rs".to_string());

        let guard = Guard::new(&root);
        let event_bus = EventBus::new();
        let command_runner = CommandRunner::new(Default::default(), weaver_core::command_runner::SafetyMode::Ask, event_bus.clone());
        let providers = ProviderRegistry::new(AppConfig::default());
        let orchestrator = Orchestrator::new(store.clone(), event_bus, providers);

        let config = VotingConfig { k: 1, initial_samples: 1, max_samples: 1, ..Default::default() };
        let outcome = orchestrator
            .run_subtask(&project, &feature, &subtask, "local-echo:any", config, &guard, &command_runner, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.applied);
        assert!(root.join("greet.rs").exists());
        assert!(!store.list_candidates_by_subtask(&subtask.id).await.is_empty());
    }

    #[test]
    fn missing_model_bindings_is_a_validation_error() {
        let project = Project::new("p", "/tmp/p");
        let err = validation_error_for_missing_bindings(&project).unwrap_err();
        assert_eq!(err.reason(), Some("unbound-models"));
    }
}
