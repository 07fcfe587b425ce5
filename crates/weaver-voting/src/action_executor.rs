use weaver_core::command_runner::{CommandOutcome, CommandPolicy, CommandRunner, SafetyMode};
use weaver_core::guard::Guard;
use weaver_types::{ActionBatch, ActionKind, ActionResult, ApplyType, WeaverError, WeaverResult};
use tokio_util::sync::CancellationToken;

/// Strips a single leading/trailing code fence (```lang ... ```) if present, the
/// way the teacher's apply-patch tooling normalizes model output before treating it
/// as file content.
fn unwrap_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let without_lang = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
        without_lang.strip_suffix("```").unwrap_or(without_lang).trim_end()
    } else {
        trimmed
    }
}

/// Translates a voting winner into structured effects against Guard + CommandRunner
/// (spec.md §4.7).
pub struct ActionExecutor<'a> {
    guard: &'a Guard,
    command_runner: &'a CommandRunner,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(guard: &'a Guard, command_runner: &'a CommandRunner) -> Self {
        Self { guard, command_runner }
    }

    /// Applies `winner` per the subtask's declared `apply_type`, or — when the
    /// subtask has no declared type — parses it as an `ActionBatch` and runs each
    /// action in order, aborting the remainder on the first failure (spec.md §4.7
    /// "no partial apply once one action has run").
    pub async fn apply(
        &self,
        apply_type: ApplyType,
        apply_path: Option<&str>,
        winner: &str,
        cancel: CancellationToken,
    ) -> WeaverResult<Vec<ActionResult>> {
        match apply_type {
            ApplyType::Actions => self.apply_action_batch(winner, cancel).await,
            _ => {
                let path = apply_path.ok_or_else(|| {
                    WeaverError::validation_with_reason("apply_path required for this apply type", "missing-apply-path")
                })?;
                let result = self.apply_typed(apply_type, path, winner).await?;
                Ok(vec![result])
            }
        }
    }

    async fn apply_typed(&self, apply_type: ApplyType, path: &str, winner: &str) -> WeaverResult<ActionResult> {
        let content = unwrap_code_fence(winner);
        match apply_type {
            ApplyType::WriteFile | ApplyType::WriteFileFromState => {
                let outcome = self.guard.write_file(path, content, false).await?;
                Ok(ActionResult {
                    kind: "write_file".to_string(),
                    path: Some(outcome.path),
                    before: outcome.before,
                    after: Some(outcome.after),
                    error: None,
                })
            }
            ApplyType::AppendFile => {
                let outcome = self.guard.append_file(path, content, false).await?;
                Ok(ActionResult {
                    kind: "append_file".to_string(),
                    path: Some(outcome.path),
                    before: outcome.before,
                    after: Some(outcome.after),
                    error: None,
                })
            }
            ApplyType::StatePatch => {
                let outcome = self.guard.apply_patch(path, content).await?;
                Ok(ActionResult {
                    kind: "state_patch".to_string(),
                    path: Some(outcome.path),
                    before: outcome.before,
                    after: Some(outcome.after),
                    error: None,
                })
            }
            ApplyType::EditFile => {
                let edit: EditFilePayload = serde_json::from_str(content)
                    .map_err(|e| WeaverError::validation_with_reason(format!("editFile payload invalid: {e}"), "bad-edit-payload"))?;
                let before_full = self.guard.read_file(path).await.unwrap_or_default();
                let Some(start) = before_full.find(&edit.old_string) else {
                    return Err(WeaverError::apply("old_string not found in file", "edit-not-found"));
                };
                let mut after_full = before_full.clone();
                after_full.replace_range(start..start + edit.old_string.len(), &edit.new_string);
                let outcome = self.guard.write_file(path, &after_full, false).await?;
                Ok(ActionResult {
                    kind: "edit_file".to_string(),
                    path: Some(outcome.path),
                    before: outcome.before,
                    after: Some(outcome.after),
                    error: None,
                })
            }
            ApplyType::Actions => unreachable!("handled by apply_action_batch"),
        }
    }

    async fn apply_action_batch(&self, winner: &str, cancel: CancellationToken) -> WeaverResult<Vec<ActionResult>> {
        let batch: ActionBatch = serde_json::from_str(winner.trim()).map_err(|e| {
            WeaverError::validation_with_reason(format!("winner is not a valid action batch: {e}"), "bad-action-batch")
        })?;

        let mut results = Vec::with_capacity(batch.actions.len());
        for action in batch.actions {
            match self.apply_one(action, cancel.clone()).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    results.push(ActionResult { kind: "error".to_string(), path: None, before: None, after: None, error: Some(err.to_string()) });
                    return Err(err);
                }
            }
        }
        Ok(results)
    }

    async fn apply_one(&self, action: ActionKind, cancel: CancellationToken) -> WeaverResult<ActionResult> {
        match action {
            ActionKind::WriteFile { path, content, dry_run } => {
                let outcome = self.guard.write_file(&path, &content, dry_run).await?;
                Ok(ActionResult { kind: "write_file".to_string(), path: Some(outcome.path), before: outcome.before, after: Some(outcome.after), error: None })
            }
            ActionKind::AppendFile { path, content, dry_run } => {
                let outcome = self.guard.append_file(&path, &content, dry_run).await?;
                Ok(ActionResult { kind: "append_file".to_string(), path: Some(outcome.path), before: outcome.before, after: Some(outcome.after), error: None })
            }
            ActionKind::ApplyPatch { path, patch } => {
                let outcome = self.guard.apply_patch(&path, &patch).await?;
                Ok(ActionResult { kind: "apply_patch".to_string(), path: Some(outcome.path), before: outcome.before, after: Some(outcome.after), error: None })
            }
            ActionKind::ReplaceRange { path, start_line, end_line, new_text } => {
                let outcome = self.guard.replace_range(&path, start_line, end_line, &new_text).await?;
                Ok(ActionResult { kind: "replace_range".to_string(), path: Some(outcome.path), before: outcome.before, after: Some(outcome.after), error: None })
            }
            ActionKind::RunCmd { cmd, cwd, allow_if_risky } => {
                let working_dir = cwd.map(std::path::PathBuf::from).unwrap_or_else(|| self.guard.root().to_path_buf());
                let outcome = self.command_runner.run(&cmd, &working_dir, allow_if_risky, cancel).await?;
                match outcome {
                    CommandOutcome::Completed(output) => Ok(ActionResult {
                        kind: "run_cmd".to_string(),
                        path: None,
                        before: None,
                        after: Some(output.stdout),
                        error: output.error,
                    }),
                    CommandOutcome::Blocked => Err(WeaverError::command("command blocked by policy", "blocked")),
                    CommandOutcome::NeedsApproval { request_id } => {
                        Err(WeaverError::command(format!("command needs approval: {request_id}"), "needs-approval"))
                    }
                }
            }
            ActionKind::RequestInfo { question } => {
                Ok(ActionResult { kind: "request_info".to_string(), path: None, before: None, after: Some(question), error: None })
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct EditFilePayload {
    old_string: String,
    new_string: String,
}

/// Minimal default policy/runner construction helper shared by callers that just
/// need an ask-mode runner over a project's default allow/deny lists.
pub fn default_policy() -> CommandPolicy {
    CommandPolicy::default()
}

pub fn default_safety_mode() -> SafetyMode {
    SafetyMode::Ask
}

#[cfg(test)]
mod tests {
    use super::*;
    use weaver_core::event_bus::EventBus;
    use std::path::PathBuf;

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("weaver-action-exec-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn write_file_apply_type_unwraps_code_fence() {
        let root = temp_root();
        let guard = Guard::new(&root);
        let runner = CommandRunner::new(default_policy(), default_safety_mode(), EventBus::new());
        let executor = ActionExecutor::new(&guard, &runner);
        let winner = "```rust\nfn main() {}\n```";
        let results = executor.apply(ApplyType::WriteFile, Some("src/main.rs"), winner, CancellationToken::new()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].after.as_deref(), Some("fn main() {}"));
    }

    #[tokio::test]
    async fn action_batch_applies_each_action_in_order() {
        let root = temp_root();
        let guard = Guard::new(&root);
        let runner = CommandRunner::new(default_policy(), default_safety_mode(), EventBus::new());
        let executor = ActionExecutor::new(&guard, &runner);
        let winner = r#"{"actions":[
            {"kind":"write_file","path":"a.txt","content":"hello"},
            {"kind":"request_info","question":"which license?"}
        ]}"#;
        let results = executor.apply(ApplyType::Actions, None, winner, CancellationToken::new()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].kind, "write_file");
        assert_eq!(results[1].kind, "request_info");
    }

    #[tokio::test]
    async fn unknown_action_kind_fails_the_batch() {
        let root = temp_root();
        let guard = Guard::new(&root);
        let runner = CommandRunner::new(default_policy(), default_safety_mode(), EventBus::new());
        let executor = ActionExecutor::new(&guard, &runner);
        let winner = r#"{"actions":[{"kind":"teleport","path":"x"}]}"#;
        let err = executor.apply(ApplyType::Actions, None, winner, CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.reason(), Some("bad-action-batch"));
    }

    #[tokio::test]
    async fn failed_action_aborts_remaining_actions() {
        let root = temp_root();
        let guard = Guard::new(&root);
        let runner = CommandRunner::new(default_policy(), default_safety_mode(), EventBus::new());
        let executor = ActionExecutor::new(&guard, &runner);
        let winner = r#"{"actions":[
            {"kind":"apply_patch","path":"missing.txt","patch":"--- other.txt\n+++ other.txt\n"},
            {"kind":"write_file","path":"never.txt","content":"unreached"}
        ]}"#;
        let err = executor.apply(ApplyType::Actions, None, winner, CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.reason(), Some("foreign-path"));
        assert!(!root.join("never.txt").exists());
    }

    #[tokio::test]
    async fn edit_file_requires_old_string_match() {
        let root = temp_root();
        let guard = Guard::new(&root);
        guard.write_file("f.rs", "fn a() {}\n", false).await.unwrap();
        let runner = CommandRunner::new(default_policy(), default_safety_mode(), EventBus::new());
        let executor = ActionExecutor::new(&guard, &runner);
        let winner = r#"{"old_string":"fn a() {}","new_string":"fn a() { println!(\"hi\"); }"}"#;
        let results = executor.apply(ApplyType::EditFile, Some("f.rs"), winner, CancellationToken::new()).await.unwrap();
        assert!(results[0].after.as_deref().unwrap().contains("println"));
    }
}
