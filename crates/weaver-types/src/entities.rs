use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Created,
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBindings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voter: Option<String>,
}

impl ModelBindings {
    /// A project can execute only when every role it needs a model for is bound.
    pub fn is_fully_bound(&self) -> bool {
        [&self.planner, &self.executor, &self.voter]
            .into_iter()
            .all(|binding| matches!(binding, Some(value) if !value.is_empty()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub folder_path: String,
    #[serde(default)]
    pub models: ModelBindings,
    #[serde(default)]
    pub project_type: String,
    pub status: ProjectStatus,
    #[serde(default)]
    pub bootstrapped: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Project {
    pub fn new(name: impl Into<String>, folder_path: impl Into<String>) -> Self {
        let created = now_ms();
        Self {
            id: new_id(),
            name: name.into(),
            description: String::new(),
            folder_path: folder_path.into(),
            models: ModelBindings::default(),
            project_type: String::new(),
            status: ProjectStatus::Created,
            bootstrapped: false,
            created_at: created,
            updated_at: created,
        }
    }
}

impl Default for ModelBindings {
    fn default() -> Self {
        Self { planner: None, executor: None, voter: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    A,
    B,
    C,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    Running,
    Paused,
    Blocked,
    Failed,
    Completed,
    Verified,
    HumanTesting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub priority: Priority,
    pub status: FeatureStatus,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    #[serde(default)]
    pub definition_of_done: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_summary: Option<String>,
    pub order_index: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Feature {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>, priority: Priority, order_index: i64) -> Self {
        let created = now_ms();
        Self {
            id: new_id(),
            project_id: project_id.into(),
            name: name.into(),
            description: String::new(),
            priority,
            status: FeatureStatus::Pending,
            depends_on: HashSet::new(),
            definition_of_done: String::new(),
            technical_summary: None,
            order_index,
            created_at: created,
            updated_at: created,
        }
    }

    /// A dependency is satisfied once the upstream feature is completed or verified
    /// (spec.md §4.10 readiness rule).
    pub fn is_satisfied_status(status: &FeatureStatus) -> bool {
        matches!(status, FeatureStatus::Completed | FeatureStatus::Verified)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyType {
    WriteFile,
    AppendFile,
    EditFile,
    WriteFileFromState,
    StatePatch,
    Actions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub feature_id: String,
    pub intent: String,
    pub apply_type: ApplyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_path: Option<String>,
    pub status: SubtaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Monotonic creation sequence, used to execute subtasks in creation order
    /// (spec.md §3 Subtask invariant).
    pub sequence: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Subtask {
    pub fn new(feature_id: impl Into<String>, intent: impl Into<String>, apply_type: ApplyType, sequence: u64) -> Self {
        let created = now_ms();
        Self {
            id: new_id(),
            feature_id: feature_id.into(),
            intent: intent.into(),
            apply_type,
            apply_path: None,
            status: SubtaskStatus::Pending,
            result: None,
            error: None,
            sequence,
            created_at: created,
            updated_at: created,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<String>,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: i64,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: 0,
            project_id: None,
            feature_id: None,
            subtask_id: None,
            event_type: event_type.into(),
            payload,
            timestamp: now_ms(),
        }
    }
}

/// A sampled output from one voting round (spec.md §3). Persisted in full via
/// `CandidateRecord` — including red-flagged and non-winning samples — rather than
/// discarded once a winner is chosen (spec.md §4.8 step 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub model: String,
    pub output: String,
    #[serde(default)]
    pub red_flags: Vec<String>,
    pub sample_index: usize,
    pub temperature: f64,
}

impl Candidate {
    pub fn is_flagged(&self) -> bool {
        !self.red_flags.is_empty()
    }
}

/// A `Candidate` as it lives in the Persistent Store, scoped to the project/feature/
/// subtask it was sampled for (spec.md §3 Persistent Store entities).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: u64,
    pub project_id: String,
    pub feature_id: String,
    pub subtask_id: String,
    #[serde(flatten)]
    pub candidate: Candidate,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageAggregate {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub calls: u64,
    /// Derived from a static price table per model; unknown models price at zero
    /// (spec.md §4.12 "Cost derivation").
    pub cost: f64,
}

impl UsageAggregate {
    pub fn new(project_id: impl Into<String>, role: Option<String>, model: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            role,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            calls: 0,
            cost: 0.0,
        }
    }

    /// Aggregates are monotonically non-decreasing (spec.md §8 "Monotone usage").
    pub fn accumulate(&mut self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.total_tokens += input_tokens + output_tokens;
        self.calls += 1;
        let (input_price, output_price) = price_per_1k_tokens(&self.model);
        self.cost += (input_tokens as f64 / 1000.0) * input_price + (output_tokens as f64 / 1000.0) * output_price;
    }
}

/// Static USD-per-1000-tokens price table, matched by substring against the bare
/// model name (the part of a `"providerType:modelName"` binding after the colon, or
/// the whole string if there is no colon). Unknown models price at zero (spec.md
/// §4.12 "Cost is derived from a static price table per model; unknown models price
/// at zero").
fn price_per_1k_tokens(model: &str) -> (f64, f64) {
    match model {
        m if m.contains("gpt-4o-mini") => (0.00015, 0.0006),
        m if m.contains("gpt-4o") => (0.0025, 0.01),
        m if m.contains("gpt-4") => (0.03, 0.06),
        m if m.contains("gpt-3.5") => (0.0005, 0.0015),
        m if m.contains("claude-3-5-sonnet") || m.contains("claude-3.5-sonnet") => (0.003, 0.015),
        m if m.contains("claude-3-opus") => (0.015, 0.075),
        m if m.contains("claude-3-haiku") => (0.00025, 0.00125),
        _ => (0.0, 0.0),
    }
}

#[cfg(test)]
mod price_tests {
    use super::*;

    #[test]
    fn known_model_accrues_cost() {
        let mut usage = UsageAggregate::new("p1", None, "openai:gpt-4o-mini");
        usage.accumulate(1000, 1000);
        assert!(usage.cost > 0.0);
    }

    #[test]
    fn unknown_model_prices_at_zero() {
        let mut usage = UsageAggregate::new("p1", None, "unknown-model-xyz");
        usage.accumulate(1000, 1000);
        assert_eq!(usage.cost, 0.0);
    }
}
