use serde::{Deserialize, Serialize};

/// The untyped "actions" schema a winner output may parse into when a subtask has no
/// declared `apply.type` (spec.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBatch {
    pub actions: Vec<ActionKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    WriteFile {
        path: String,
        content: String,
        #[serde(default)]
        dry_run: bool,
    },
    AppendFile {
        path: String,
        content: String,
        #[serde(default)]
        dry_run: bool,
    },
    ApplyPatch {
        path: String,
        patch: String,
    },
    ReplaceRange {
        path: String,
        start_line: usize,
        end_line: usize,
        new_text: String,
    },
    RunCmd {
        cmd: String,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        allow_if_risky: bool,
    },
    /// Recorded only; never mutates anything (spec.md §4.7).
    RequestInfo {
        question: String,
    },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WriteFile { .. } => "write_file",
            Self::AppendFile { .. } => "append_file",
            Self::ApplyPatch { .. } => "apply_patch",
            Self::ReplaceRange { .. } => "replace_range",
            Self::RunCmd { .. } => "run_cmd",
            Self::RequestInfo { .. } => "request_info",
        }
    }
}

/// The result of applying one `ActionKind`, kept for the audit log
/// (spec.md §8 "Exactly-once winner application").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub kind: String,
    pub path: Option<String>,
    pub before: Option<String>,
    pub after: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_batch_parses_discriminated_union() {
        let raw = r#"{"actions":[
            {"kind":"write_file","path":"a.rs","content":"fn main(){}"},
            {"kind":"run_cmd","cmd":"cargo build"},
            {"kind":"request_info","question":"which crate?"}
        ]}"#;
        let batch: ActionBatch = serde_json::from_str(raw).expect("parses");
        assert_eq!(batch.actions.len(), 3);
        assert_eq!(batch.actions[0].name(), "write_file");
        assert_eq!(batch.actions[2].name(), "request_info");
    }

    #[test]
    fn unknown_action_kind_is_rejected() {
        let raw = r#"{"actions":[{"kind":"teleport","path":"x"}]}"#;
        let parsed: Result<ActionBatch, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }
}
