use serde::Deserialize;
use tracing::warn;
use weaver_core::guard::Guard;
use weaver_core::EventBus;
use weaver_providers::{GenerateParams, ProviderRegistry};
use weaver_types::{ApplyType, Event, Feature};

const MAX_INSPECT_ROUNDS: usize = 5;
const MAX_FILES_TOTAL: usize = 20;
const TREE_ENTRY_CAP: usize = 200;
const SNIPPET_TRUNCATE_CHARS: usize = 8000;

/// One planned subtask before it is persisted (spec.md §4.9 stage 2).
#[derive(Debug, Clone)]
pub struct PlannedSubtask {
    pub intent: String,
    pub apply_type: ApplyType,
    pub apply_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(default)]
    inspect: Vec<String>,
    #[serde(default)]
    search: Vec<String>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    subtasks: Vec<PlanSubtaskEntry>,
}

#[derive(Debug, Deserialize)]
struct PlanSubtaskEntry {
    intent: String,
    #[serde(default)]
    apply: Option<ApplyEntry>,
}

#[derive(Debug, Deserialize)]
struct ApplyEntry {
    #[serde(default)]
    #[serde(rename = "type")]
    apply_type: Option<ApplyType>,
    #[serde(default)]
    path: Option<String>,
}

/// Two-stage, model-driven decomposition of a Feature into Subtasks (spec.md §4.9).
pub struct FeaturePlanner {
    providers: ProviderRegistry,
    event_bus: EventBus,
}

impl FeaturePlanner {
    pub fn new(providers: ProviderRegistry, event_bus: EventBus) -> Self {
        Self { providers, event_bus }
    }

    /// `onProgress(message)` (spec.md §4.9) — published as a `planner-progress` event
    /// rather than persisted to the Store, matching how `CommandRunner` publishes
    /// transient `command-output` events.
    fn emit_progress(&self, feature: &Feature, message: impl Into<String>) {
        let mut event = Event::new("planner-progress", serde_json::json!({"message": message.into()}));
        event.project_id = Some(feature.project_id.clone());
        event.feature_id = Some(feature.id.clone());
        self.event_bus.publish(event);
    }

    /// Runs stage 1 (inspect) then stage 2 (plan); falls back to a single minimal
    /// subtask on total failure (spec.md §4.9 "Model selection").
    pub async fn plan(
        &self,
        planner_model: &str,
        fallback_models: &[String],
        guard: &Guard,
        feature: &Feature,
        completed_feature_summaries: &[String],
    ) -> Vec<PlannedSubtask> {
        let tree = list_tree(guard).await;
        let snippets = self.inspect(planner_model, guard, feature, &tree).await;

        let mut candidates = Vec::with_capacity(1 + fallback_models.len());
        candidates.push(planner_model.to_string());
        candidates.extend(fallback_models.iter().cloned());

        for model in &candidates {
            let prompt = build_plan_prompt(feature, completed_feature_summaries, &tree, &snippets);
            let params = GenerateParams { temperature: Some(0.2), max_tokens: None };
            let response = match self.providers.generate(model, &prompt, &params).await {
                Ok(result) => result.content,
                Err(err) => {
                    warn!(model, error = %err, "planner model call failed");
                    continue;
                }
            };
            if let Some(subtasks) = parse_plan_response(&response) {
                if subtasks.len() >= 2 || candidates.len() == 1 {
                    if !subtasks.is_empty() {
                        return subtasks;
                    }
                }
            }
        }

        vec![minimal_fallback(feature)]
    }

    /// Stage 1: up to `MAX_INSPECT_ROUNDS` rounds, reading at most `MAX_FILES_TOTAL`
    /// files through Guard (spec.md §4.9 stage 1).
    async fn inspect(&self, model: &str, guard: &Guard, feature: &Feature, tree: &[String]) -> Vec<String> {
        let mut snippets = Vec::new();
        let mut already_inspected: Vec<String> = Vec::new();

        for round in 0..MAX_INSPECT_ROUNDS {
            if already_inspected.len() >= MAX_FILES_TOTAL {
                break;
            }
            self.emit_progress(feature, format!("inspect round {} of {MAX_INSPECT_ROUNDS} ({} files read so far)", round + 1, already_inspected.len()));
            let prompt = build_inspect_prompt(feature, tree, &already_inspected);
            let params = GenerateParams { temperature: Some(0.0), max_tokens: None };
            let response = match self.providers.generate(model, &prompt, &params).await {
                Ok(result) => result.content,
                Err(_) => break,
            };
            let Some(parsed) = parse_inspect_response(&response) else { break };

            let mut targets: Vec<String> = parsed
                .inspect
                .into_iter()
                .filter(|path| tree.contains(path) && !already_inspected.contains(path))
                .collect();
            for keyword in &parsed.search {
                for path in tree {
                    if targets.len() + already_inspected.len() >= MAX_FILES_TOTAL {
                        break;
                    }
                    if path.to_lowercase().contains(&keyword.to_lowercase()) && !already_inspected.contains(path) && !targets.contains(path) {
                        targets.push(path.clone());
                    }
                }
            }

            if targets.is_empty() {
                break;
            }

            for path in &targets {
                if already_inspected.len() >= MAX_FILES_TOTAL {
                    break;
                }
                if let Ok(content) = guard.read_file(path).await {
                    let truncated: String = content.chars().take(SNIPPET_TRUNCATE_CHARS).collect();
                    snippets.push(format!("--- {path} ---\n{truncated}"));
                }
                already_inspected.push(path.clone());
            }

            if parsed.done {
                break;
            }
        }

        snippets
    }
}

async fn list_tree(guard: &Guard) -> Vec<String> {
    let mut entries = guard.list(".").await.unwrap_or_default();
    entries.truncate(TREE_ENTRY_CAP);
    entries
}

fn build_inspect_prompt(feature: &Feature, tree: &[String], already_inspected: &[String]) -> String {
    format!(
        "Feature to implement: {}\n{}\n\nFile tree (truncated):\n{}\n\nAlready inspected: {}\n\n\
         Return JSON {{\"inspect\": [paths], \"search\": [keywords], \"done\": bool}} naming up to a handful of \
         files worth reading before planning subtasks.",
        feature.name,
        feature.description,
        tree.join("\n"),
        already_inspected.join(", "),
    )
}

fn parse_inspect_response(response: &str) -> Option<InspectResponse> {
    serde_json::from_str(response.trim()).ok()
}

fn build_plan_prompt(feature: &Feature, completed_feature_summaries: &[String], tree: &[String], snippets: &[String]) -> String {
    format!(
        "Completed features so far:\n{}\n\nFile tree:\n{}\n\nRelevant file snippets:\n{}\n\n\
         Feature: {}\nDefinition of done: {}\n\n\
         Return JSON {{\"subtasks\": [{{\"intent\": ..., \"apply\": {{\"type\": ..., \"path\": ...}}}}, ...]}}.",
        completed_feature_summaries.join("\n"),
        tree.join("\n"),
        snippets.join("\n\n"),
        feature.name,
        feature.definition_of_done,
    )
}

fn parse_plan_response(response: &str) -> Option<Vec<PlannedSubtask>> {
    let parsed: PlanResponse = serde_json::from_str(response.trim()).ok()?;
    Some(
        parsed
            .subtasks
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let apply_type = entry.apply.as_ref().and_then(|a| a.apply_type).unwrap_or(ApplyType::WriteFile);
                let apply_path = entry
                    .apply
                    .and_then(|a| a.path)
                    .or_else(|| Some(format!("generated/subtask-{index}.txt")));
                PlannedSubtask { intent: entry.intent, apply_type, apply_path }
            })
            .collect(),
    )
}

fn minimal_fallback(feature: &Feature) -> PlannedSubtask {
    PlannedSubtask {
        intent: format!("Implement {}", feature.name),
        apply_type: ApplyType::WriteFile,
        apply_path: Some("NOTES.md".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_response_defaults_apply_type_to_write_file() {
        let raw = r#"{"subtasks":[{"intent":"do thing"}]}"#;
        let subtasks = parse_plan_response(raw).unwrap();
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].apply_type, ApplyType::WriteFile);
        assert!(subtasks[0].apply_path.is_some());
    }

    #[test]
    fn plan_response_honors_declared_apply_type_and_path() {
        let raw = r#"{"subtasks":[{"intent":"add route","apply":{"type":"appendFile","path":"src/routes.rs"}}]}"#;
        let subtasks = parse_plan_response(raw).unwrap();
        assert_eq!(subtasks[0].apply_type, ApplyType::AppendFile);
        assert_eq!(subtasks[0].apply_path.as_deref(), Some("src/routes.rs"));
    }

    #[test]
    fn malformed_plan_response_fails_to_parse() {
        assert!(parse_plan_response("not json").is_none());
    }

    #[test]
    fn minimal_fallback_is_always_constructible() {
        let feature = Feature::new("p1", "Login", weaver_types::Priority::A, 0);
        let fallback = minimal_fallback(&feature);
        assert!(fallback.intent.contains("Login"));
    }

    #[tokio::test]
    async fn inspect_emits_planner_progress_events() {
        let root = std::env::temp_dir().join(format!("weaver-planner-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        let guard = Guard::new(&root);
        let event_bus = EventBus::new();
        let mut receiver = event_bus.subscribe();
        let providers = ProviderRegistry::new(weaver_providers::AppConfig::default());
        let planner = FeaturePlanner::new(providers, event_bus);
        let feature = Feature::new("p1", "Login", weaver_types::Priority::A, 0);

        let _ = planner.plan("local-echo:any", &[], &guard, &feature, &[]).await;

        let event = receiver.try_recv().expect("at least one planner-progress event");
        assert_eq!(event.event_type, "planner-progress");
    }
}
