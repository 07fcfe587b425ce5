use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use weaver_types::{WeaverError, WeaverResult};

use crate::event_bus::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Med,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyMode {
    Ask,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Blocked,
    Allow(Severity),
}

/// An explicit per-command override (spec.md §6 "policies: { cmd -> { severity,
/// blocked?, allowNetwork? } }"). `allow_network` is carried for parity with the
/// config shape but does not gate execution here — network access is not sandboxed
/// at this layer.
#[derive(Debug, Clone)]
pub struct PolicyEntry {
    pub severity: Severity,
    pub blocked: bool,
    pub allow_network: bool,
}

/// A caller-supplied allow/deny/policy configuration (spec.md §6 "Command
/// classification inputs").
#[derive(Debug, Clone, Default)]
pub struct CommandPolicy {
    pub safety_mode_ask: bool,
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
    /// Exact-match command overrides, consulted before the deny-pattern tier
    /// (spec.md §4.3's classification cascade, first tier).
    pub policies: HashMap<String, PolicyEntry>,
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Classifies a command per spec.md §4.3's ordered cascade: explicit per-command
/// policy > deny-pattern > allow-pattern > content heuristics.
pub fn classify(cmd: &str, policy: &CommandPolicy) -> Classification {
    if let Some(entry) = policy.policies.get(cmd.trim()) {
        return if entry.blocked { Classification::Blocked } else { Classification::Allow(entry.severity) };
    }
    if policy.denylist.iter().any(|pat| contains_ci(cmd, pat)) {
        return Classification::Blocked;
    }
    if policy.allowlist.iter().any(|pat| contains_ci(cmd, pat)) {
        return Classification::Allow(Severity::Low);
    }
    if contains_ci(cmd, "rm ") || contains_ci(cmd, "sudo") || contains_ci(cmd, "drop database") {
        return Classification::Allow(Severity::High);
    }
    let trimmed = cmd.trim_start();
    if trimmed.starts_with("curl") || trimmed.starts_with("wget") || contains_ci(cmd, "http") {
        return Classification::Allow(Severity::Med);
    }
    Classification::Allow(Severity::Low)
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Completed(CommandOutput),
    Blocked,
    NeedsApproval { request_id: String },
}

/// Severity-classified external command execution with an ask/auto approval queue
/// (spec.md §4.3), grounded on `tandem-core::permissions::PermissionManager`'s
/// request/reply/wait-for-reply shape.
pub struct CommandRunner {
    policy: CommandPolicy,
    mode: SafetyMode,
    pending: Arc<RwLock<HashMap<String, watch::Sender<Option<bool>>>>>,
    event_bus: EventBus,
}

impl CommandRunner {
    pub fn new(policy: CommandPolicy, mode: SafetyMode, event_bus: EventBus) -> Self {
        Self { policy, mode, pending: Arc::new(RwLock::new(HashMap::new())), event_bus }
    }

    /// Runs `cmd` in `cwd`, honoring classification and the configured safety mode.
    /// `force` bypasses the ask-gate — used to re-run a command once a pending
    /// approval has been resolved (spec.md §4.3: "resolved by re-running with
    /// `force=true`").
    pub async fn run(
        &self,
        cmd: &str,
        cwd: &std::path::Path,
        force: bool,
        cancel: CancellationToken,
    ) -> WeaverResult<CommandOutcome> {
        match classify(cmd, &self.policy) {
            Classification::Blocked => Ok(CommandOutcome::Blocked),
            Classification::Allow(Severity::Low) => self.execute(cmd, cwd, cancel).await.map(CommandOutcome::Completed),
            Classification::Allow(severity) => {
                if self.mode == SafetyMode::Auto || force {
                    self.execute(cmd, cwd, cancel).await.map(CommandOutcome::Completed)
                } else {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let (tx, _rx) = watch::channel(None);
                    self.pending.write().await.insert(request_id.clone(), tx);
                    self.event_bus.publish(weaver_types::Event::new(
                        "command-output",
                        serde_json::json!({
                            "requestId": request_id,
                            "cmd": cmd,
                            "severity": format!("{severity:?}"),
                            "status": "needs-approval",
                        }),
                    ));
                    Ok(CommandOutcome::NeedsApproval { request_id })
                }
            }
        }
    }

    pub async fn approve(&self, request_id: &str, approved: bool) -> WeaverResult<()> {
        let pending = self.pending.read().await;
        let Some(tx) = pending.get(request_id) else {
            return Err(WeaverError::command("unknown approval request", "unknown-request"));
        };
        let _ = tx.send(Some(approved));
        Ok(())
    }

    async fn execute(&self, cmd: &str, cwd: &std::path::Path, cancel: CancellationToken) -> WeaverResult<CommandOutput> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WeaverError::command(format!("spawn failed: {e}"), "spawn-failed"))?;

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(WeaverError::cancelled("command cancelled"))
            }
            output = child.wait_with_output() => {
                let output = output.map_err(|e| WeaverError::command(format!("wait failed: {e}"), "wait-failed"))?;
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let error = if output.status.success() {
                    None
                } else {
                    Some(format!("exit {}", output.status.code().unwrap_or(-1)))
                };
                Ok(CommandOutput { stdout, stderr, error })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_pattern_blocks_regardless_of_content() {
        let policy = CommandPolicy { denylist: vec!["rm -rf /".into()], ..Default::default() };
        assert_eq!(classify("rm -rf /", &policy), Classification::Blocked);
    }

    #[test]
    fn explicit_policy_overrides_the_deny_pattern_tier() {
        let mut policies = HashMap::new();
        policies.insert("sudo reboot".to_string(), PolicyEntry { severity: Severity::Low, blocked: false, allow_network: false });
        let policy = CommandPolicy { policies, ..Default::default() };
        assert_eq!(classify("sudo reboot", &policy), Classification::Allow(Severity::Low));
    }

    #[test]
    fn explicit_policy_can_block_a_command() {
        let mut policies = HashMap::new();
        policies.insert("ls -la".to_string(), PolicyEntry { severity: Severity::Low, blocked: true, allow_network: false });
        let policy = CommandPolicy { policies, ..Default::default() };
        assert_eq!(classify("ls -la", &policy), Classification::Blocked);
    }

    #[test]
    fn dangerous_content_classifies_high() {
        let policy = CommandPolicy::default();
        assert_eq!(classify("sudo reboot", &policy), Classification::Allow(Severity::High));
    }

    #[test]
    fn network_commands_classify_med() {
        let policy = CommandPolicy::default();
        assert_eq!(classify("curl https://example.com", &policy), Classification::Allow(Severity::Med));
    }

    #[test]
    fn plain_commands_classify_low() {
        let policy = CommandPolicy::default();
        assert_eq!(classify("ls -la", &policy), Classification::Allow(Severity::Low));
    }

    #[tokio::test]
    async fn low_severity_runs_directly_in_ask_mode() {
        let runner = CommandRunner::new(CommandPolicy::default(), SafetyMode::Ask, EventBus::new());
        let dir = std::env::temp_dir();
        let outcome = runner.run("echo hi", &dir, false, CancellationToken::new()).await.unwrap();
        match outcome {
            CommandOutcome::Completed(output) => assert!(output.stdout.contains("hi")),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn high_severity_needs_approval_in_ask_mode() {
        let runner = CommandRunner::new(CommandPolicy::default(), SafetyMode::Ask, EventBus::new());
        let dir = std::env::temp_dir();
        let outcome = runner.run("sudo echo hi", &dir, false, CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::NeedsApproval { .. }));
    }

    #[tokio::test]
    async fn forcing_bypasses_the_ask_gate() {
        let runner = CommandRunner::new(CommandPolicy::default(), SafetyMode::Ask, EventBus::new());
        let dir = std::env::temp_dir();
        let outcome = runner.run("sudo echo hi", &dir, true, CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Completed(_)));
    }
}

impl std::fmt::Debug for CommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed(out) => f.debug_tuple("Completed").field(out).finish(),
            Self::Blocked => write!(f, "Blocked"),
            Self::NeedsApproval { request_id } => f.debug_struct("NeedsApproval").field("request_id", request_id).finish(),
        }
    }
}
