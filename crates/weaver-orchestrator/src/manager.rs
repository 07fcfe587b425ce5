use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use weaver_core::command_runner::CommandRunner;
use weaver_core::guard::Guard;
use weaver_core::store::SharedStore;
use weaver_core::EventBus;
use weaver_types::{Event, Feature, FeatureStatus, Priority, Project, Subtask, SubtaskStatus, WeaverError, WeaverResult};
use weaver_voting::VotingConfig;

use crate::orchestrator::Orchestrator;
use crate::planner::FeaturePlanner;

/// Owns the Feature lifecycle and is the only scheduler of execution (spec.md
/// §4.10). `running` and `pause_requested` are the in-memory registries the spec
/// requires a single component to guard with a mutex.
pub struct FeatureManager {
    store: SharedStore,
    event_bus: EventBus,
    orchestrator: Orchestrator,
    planner: FeaturePlanner,
    running: Mutex<HashSet<String>>,
    pause_requested: Mutex<HashSet<String>>,
    aborted: Mutex<HashSet<String>>,
}

impl FeatureManager {
    pub fn new(store: SharedStore, event_bus: EventBus, orchestrator: Orchestrator, planner: FeaturePlanner) -> Self {
        Self {
            store,
            event_bus,
            orchestrator,
            planner,
            running: Mutex::new(HashSet::new()),
            pause_requested: Mutex::new(HashSet::new()),
            aborted: Mutex::new(HashSet::new()),
        }
    }

    /// `getNextRunnable` preferring paused features (to resume) before a fresh
    /// pending one (spec.md §4.10 "Selection").
    pub async fn next_runnable(&self, project_id: &str) -> Option<Feature> {
        let features = self.store.list_features_by_project(project_id).await;
        if let Some(paused) = features.iter().find(|f| f.status == FeatureStatus::Paused) {
            return Some(paused.clone());
        }
        self.store.get_next_runnable(project_id).await
    }

    pub async fn request_pause(&self, feature_id: &str) {
        self.pause_requested.lock().await.insert(feature_id.to_string());
    }

    pub async fn abort(&self, feature_id: &str) {
        self.aborted.lock().await.insert(feature_id.to_string());
        self.pause_requested.lock().await.insert(feature_id.to_string());
    }

    /// Resets a failed/paused feature to pending, preserving completed subtasks
    /// (spec.md §4.10 "retry" — "resume-from-failure semantics").
    pub async fn retry(&self, feature_id: &str) -> WeaverResult<()> {
        let mut feature = self
            .store
            .get_feature(feature_id)
            .await
            .ok_or_else(|| WeaverError::validation(format!("unknown feature {feature_id}")))?;
        if self.running.lock().await.contains(feature_id) {
            return Err(WeaverError::state_conflict("feature is currently running", "retry-while-running"));
        }
        feature.status = FeatureStatus::Pending;
        feature.technical_summary = None;
        self.store.update_feature(feature).await?;

        for mut subtask in self.store.list_subtasks_by_feature(feature_id).await {
            if subtask.status != SubtaskStatus::Completed {
                subtask.status = SubtaskStatus::Pending;
                subtask.error = None;
                self.store.update_subtask(subtask).await?;
            }
        }
        Ok(())
    }

    /// Resets a single subtask to pending; rejected while the parent feature runs
    /// (spec.md §4.10 "retrySubtask").
    pub async fn retry_subtask(&self, subtask_id: &str) -> WeaverResult<()> {
        let mut subtask = self
            .store
            .get_subtask(subtask_id)
            .await
            .ok_or_else(|| WeaverError::validation(format!("unknown subtask {subtask_id}")))?;
        if self.running.lock().await.contains(&subtask.feature_id) {
            return Err(WeaverError::state_conflict("parent feature is running", "retry-while-running"));
        }
        subtask.status = SubtaskStatus::Pending;
        subtask.error = None;
        self.store.update_subtask(subtask).await
    }

    /// Re-enters `execute_feature` for a feature paused mid-run (spec.md §4.10
    /// "resume" — "requires status = paused; re-enters executeFeature").
    #[allow(clippy::too_many_arguments)]
    pub async fn resume(
        &self,
        project: &Project,
        feature_id: &str,
        model_binding: &str,
        voting_config: VotingConfig,
        guard: &Guard,
        command_runner: &CommandRunner,
        fallback_planner_models: &[String],
    ) -> WeaverResult<()> {
        let feature = self
            .store
            .get_feature(feature_id)
            .await
            .ok_or_else(|| WeaverError::validation(format!("unknown feature {feature_id}")))?;
        if feature.status != FeatureStatus::Paused {
            return Err(WeaverError::state_conflict("feature is not paused", "resume-requires-paused"));
        }
        self.execute_feature(project, feature, model_binding, voting_config, guard, command_runner, fallback_planner_models)
            .await
    }

    /// Executes `feature` to completion, pause, or failure (spec.md §4.10 "Execution
    /// protocol"). The at-most-one invariant is enforced by `running`; readiness
    /// (all dependencies satisfied) is enforced here too, independent of whether the
    /// caller went through `next_runnable`.
    pub async fn execute_feature(
        &self,
        project: &Project,
        mut feature: Feature,
        model_binding: &str,
        voting_config: VotingConfig,
        guard: &Guard,
        command_runner: &CommandRunner,
        fallback_planner_models: &[String],
    ) -> WeaverResult<()> {
        if !self.store.are_dependencies_met(&feature.id).await? {
            return Err(WeaverError::not_runnable(format!(
                "feature {} has unmet dependencies",
                feature.id
            )));
        }
        {
            let mut running = self.running.lock().await;
            if !running.insert(feature.id.clone()) {
                return Err(WeaverError::state_conflict(
                    format!("feature {} is already running", feature.id),
                    "already-running",
                ));
            }
        }
        let result = self
            .execute_feature_inner(project, &mut feature, model_binding, voting_config, guard, command_runner, fallback_planner_models)
            .await;
        self.running.lock().await.remove(&feature.id);
        if let Err(err) = &result {
            warn!(feature_id = %feature.id, error = %err, "feature execution ended in error");
            feature.status = FeatureStatus::Failed;
            let _ = self.store.update_feature(feature.clone()).await;
            self.emit(project, &feature, "feature-error", serde_json::json!({"error": err.to_string()})).await;
        }
        result
    }

    async fn execute_feature_inner(
        &self,
        project: &Project,
        feature: &mut Feature,
        model_binding: &str,
        voting_config: VotingConfig,
        guard: &Guard,
        command_runner: &CommandRunner,
        fallback_planner_models: &[String],
    ) -> WeaverResult<()> {
        feature.status = FeatureStatus::Running;
        self.store.update_feature(feature.clone()).await?;
        self.emit(project, feature, "feature-started", serde_json::json!({})).await;

        let mut subtasks = self.store.list_subtasks_by_feature(&feature.id).await;
        if subtasks.is_empty() {
            self.emit(project, feature, "feature-planning", serde_json::json!({})).await;
            let completed_summaries = self.completed_feature_summaries(&project.id).await;
            let planned = self
                .planner
                .plan(model_binding, fallback_planner_models, guard, feature, &completed_summaries)
                .await;
            for plan in planned {
                self.store.create_subtask(&feature.id, plan.intent, plan.apply_type).await?;
            }
            subtasks = self.store.list_subtasks_by_feature(&feature.id).await;
            self.emit(project, feature, "feature-planned", serde_json::json!({"subtaskCount": subtasks.len()})).await;
        }

        let mut touched_files: HashSet<String> = HashSet::new();
        let mut completed_count = 0usize;

        for subtask in subtasks {
            if subtask.status == SubtaskStatus::Completed {
                completed_count += 1;
                continue;
            }
            if self.pause_requested.lock().await.remove(&feature.id) {
                feature.status = FeatureStatus::Paused;
                self.store.update_feature(feature.clone()).await?;
                let event_type = if self.aborted.lock().await.contains(&feature.id) { "feature-paused" } else { "feature-pause-requested" };
                self.emit(project, feature, event_type, serde_json::json!({})).await;
                return Ok(());
            }

            let mut running_subtask = subtask.clone();
            running_subtask.status = SubtaskStatus::Running;
            self.store.update_subtask(running_subtask.clone()).await?;
            self.emit(project, feature, "subtask-started", serde_json::json!({"subtaskId": subtask.id})).await;

            let outcome = self
                .orchestrator
                .run_subtask(project, feature, &running_subtask, model_binding, voting_config.clone(), guard, command_runner, CancellationToken::new())
                .await?;

            if outcome.applied {
                if let Some(path) = &running_subtask.apply_path {
                    touched_files.insert(path.clone());
                }
                running_subtask.status = SubtaskStatus::Completed;
                running_subtask.error = None;
                self.store.update_subtask(running_subtask).await?;
                completed_count += 1;
                self.emit(project, feature, "subtask-completed", serde_json::json!({"subtaskId": subtask.id})).await;
            } else {
                running_subtask.status = SubtaskStatus::Failed;
                running_subtask.error = outcome.error.clone();
                self.store.update_subtask(running_subtask).await?;
                self.emit(project, feature, "subtask-failed", serde_json::json!({"subtaskId": subtask.id, "error": outcome.error})).await;
                feature.status = FeatureStatus::Failed;
                self.store.update_feature(feature.clone()).await?;
                self.emit(project, feature, "feature-failed", serde_json::json!({"subtaskId": subtask.id})).await;
                return Ok(());
            }
        }

        let total = self.store.list_subtasks_by_feature(&feature.id).await.len();
        feature.technical_summary = Some(format!(
            "{}: {}/{} subtasks completed, {} files touched",
            feature.name,
            completed_count,
            total,
            touched_files.len()
        ));

        match feature.priority {
            Priority::A => {
                feature.status = FeatureStatus::Completed;
                self.store.update_feature(feature.clone()).await?;
                self.emit(project, feature, "feature-completed", serde_json::json!({})).await;
            }
            Priority::B | Priority::C => {
                feature.status = FeatureStatus::HumanTesting;
                self.store.update_feature(feature.clone()).await?;
                self.emit(project, feature, "feature-awaiting-test", serde_json::json!({})).await;
            }
        }

        Ok(())
    }

    /// Promotes a `human_testing` feature to `completed` (spec.md §3 "requires
    /// explicit promotion").
    pub async fn mark_as_completed(&self, feature_id: &str) -> WeaverResult<()> {
        let mut feature = self
            .store
            .get_feature(feature_id)
            .await
            .ok_or_else(|| WeaverError::validation(format!("unknown feature {feature_id}")))?;
        if feature.status != FeatureStatus::HumanTesting {
            return Err(WeaverError::state_conflict(
                "feature is not awaiting human testing",
                "mark-completed-from-wrong-status",
            ));
        }
        feature.status = FeatureStatus::Completed;
        self.store.update_feature(feature).await
    }

    async fn completed_feature_summaries(&self, project_id: &str) -> Vec<String> {
        self.store
            .list_features_by_project(project_id)
            .await
            .into_iter()
            .filter(|f| Feature::is_satisfied_status(&f.status))
            .filter_map(|f| f.technical_summary)
            .collect()
    }

    async fn emit(&self, project: &Project, feature: &Feature, event_type: &str, payload: serde_json::Value) {
        let mut event = Event::new(event_type, payload);
        event.project_id = Some(project.id.clone());
        event.feature_id = Some(feature.id.clone());
        if let Ok(recorded) = self.store.record_event(event).await {
            self.event_bus.publish(recorded);
        } else {
            info!(event_type, "failed to persist event");
        }
    }
}
