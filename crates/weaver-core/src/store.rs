use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{error, warn};
use weaver_types::{
    Candidate, CandidateRecord, Event, Feature, FeatureStatus, Project, Subtask, SubtaskStatus,
    UsageAggregate, WeaverError, WeaverResult,
};

/// On-disk snapshot persisted after every mutation, mirroring
/// `tandem-core::storage::Storage`'s in-memory-index-plus-flush-to-JSON shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    projects: HashMap<String, Project>,
    #[serde(default)]
    features: HashMap<String, Feature>,
    #[serde(default)]
    subtasks: HashMap<String, Subtask>,
    #[serde(default)]
    events: Vec<Event>,
    #[serde(default)]
    usage: HashMap<String, UsageAggregate>,
    #[serde(default)]
    candidates: Vec<CandidateRecord>,
}

/// Durable, crash-safe persistence for the entity model (spec.md §4.1).
///
/// An in-memory index mirrors every mutation to a JSON file on disk before the call
/// returns, the same defensive shape `tandem-core::storage::Storage` uses: any
/// storage error is surfaced rather than swallowed, and malformed JSON on load is
/// treated as empty rather than fatal.
pub struct Store {
    path: PathBuf,
    snapshot: RwLock<Snapshot>,
    next_event_id: AtomicU64,
    next_subtask_sequence: AtomicU64,
    next_candidate_id: AtomicU64,
}

impl Store {
    pub async fn new(path: impl Into<PathBuf>) -> WeaverResult<Self> {
        let path: PathBuf = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| WeaverError::store(format!("failed to create store dir: {e}")))?;
        }
        let snapshot = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(err) => {
                warn!("store file unreadable, starting empty: {err}");
                Snapshot::default()
            }
        };
        let next_event_id = snapshot.events.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        let next_subtask_sequence = snapshot.subtasks.values().map(|s| s.sequence).max().unwrap_or(0) + 1;
        let next_candidate_id = snapshot.candidates.iter().map(|c| c.id).max().unwrap_or(0) + 1;
        Ok(Self {
            path,
            snapshot: RwLock::new(snapshot),
            next_event_id: AtomicU64::new(next_event_id),
            next_subtask_sequence: AtomicU64::new(next_subtask_sequence),
            next_candidate_id: AtomicU64::new(next_candidate_id),
        })
    }

    async fn flush(&self, snapshot: &Snapshot) -> WeaverResult<()> {
        let serialized = serde_json::to_string_pretty(snapshot)
            .map_err(|e| WeaverError::store(format!("serialize failed: {e}")))?;
        fs::write(&self.path, serialized)
            .await
            .map_err(|e| WeaverError::store(format!("write failed: {e}")))?;
        Ok(())
    }

    // ---- Projects ----

    pub async fn create_project(&self, project: Project) -> WeaverResult<Project> {
        let mut snapshot = self.snapshot.write().await;
        snapshot.projects.insert(project.id.clone(), project.clone());
        self.flush(&snapshot).await?;
        Ok(project)
    }

    pub async fn get_project(&self, id: &str) -> Option<Project> {
        self.snapshot.read().await.projects.get(id).cloned()
    }

    pub async fn update_project(&self, project: Project) -> WeaverResult<()> {
        let mut snapshot = self.snapshot.write().await;
        snapshot.projects.insert(project.id.clone(), project);
        self.flush(&snapshot).await
    }

    /// Cascades removal of the project's features, subtasks, events, usage and
    /// candidate rows, removes its folder from disk, and records a `project-deleted`
    /// audit event (spec.md §3 Lifecycle).
    pub async fn delete_project(&self, id: &str) -> WeaverResult<()> {
        let mut snapshot = self.snapshot.write().await;
        let folder_path = snapshot.projects.get(id).map(|p| p.folder_path.clone());
        snapshot.projects.remove(id);
        let feature_ids: Vec<String> = snapshot
            .features
            .values()
            .filter(|f| f.project_id == id)
            .map(|f| f.id.clone())
            .collect();
        snapshot.features.retain(|_, f| f.project_id != id);
        snapshot.subtasks.retain(|_, s| !feature_ids.contains(&s.feature_id));
        snapshot.events.retain(|e| e.project_id.as_deref() != Some(id));
        snapshot.usage.retain(|_, u| u.project_id != id);
        snapshot.candidates.retain(|c| c.project_id != id);

        let mut deleted_event = Event::new("project-deleted", serde_json::json!({"projectId": id}));
        deleted_event.id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        deleted_event.project_id = Some(id.to_string());
        snapshot.events.push(deleted_event);

        self.flush(&snapshot).await?;
        drop(snapshot);

        if let Some(folder_path) = folder_path {
            if let Err(err) = fs::remove_dir_all(&folder_path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(folder_path, %err, "failed to remove project folder");
                }
            }
        }
        Ok(())
    }

    // ---- Features ----

    pub async fn create_feature(&self, feature: Feature) -> WeaverResult<Feature> {
        let mut snapshot = self.snapshot.write().await;
        snapshot.features.insert(feature.id.clone(), feature.clone());
        self.flush(&snapshot).await?;
        Ok(feature)
    }

    pub async fn get_feature(&self, id: &str) -> Option<Feature> {
        self.snapshot.read().await.features.get(id).cloned()
    }

    pub async fn update_feature(&self, feature: Feature) -> WeaverResult<()> {
        let mut snapshot = self.snapshot.write().await;
        snapshot.features.insert(feature.id.clone(), feature);
        self.flush(&snapshot).await
    }

    pub async fn delete_feature(&self, id: &str) -> WeaverResult<()> {
        let mut snapshot = self.snapshot.write().await;
        snapshot.features.remove(id);
        snapshot.subtasks.retain(|_, s| s.feature_id != id);
        self.flush(&snapshot).await
    }

    /// Returns a project's features ordered by (priority A<B<C, then order_index
    /// ascending) — spec.md §4.1 ordering guarantee.
    pub async fn list_features_by_project(&self, project_id: &str) -> Vec<Feature> {
        let snapshot = self.snapshot.read().await;
        let mut features: Vec<Feature> = snapshot
            .features
            .values()
            .filter(|f| f.project_id == project_id)
            .cloned()
            .collect();
        features.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.order_index.cmp(&b.order_index)));
        features
    }

    /// `getNextRunnable(projectId)` — scans in (priority, order_index) order and
    /// returns the first feature whose dependencies are all satisfied (spec.md §4.10).
    pub async fn get_next_runnable(&self, project_id: &str) -> Option<Feature> {
        let features = self.list_features_by_project(project_id).await;
        for feature in &features {
            if !matches!(feature.status, FeatureStatus::Pending | FeatureStatus::Paused) {
                continue;
            }
            if self.are_dependencies_met_within(&features, feature).await {
                return Some(feature.clone());
            }
        }
        None
    }

    async fn are_dependencies_met_within(&self, features: &[Feature], feature: &Feature) -> bool {
        feature.depends_on.iter().all(|dep_id| {
            resolve_dependency(features, dep_id)
                .map(|dep| Feature::is_satisfied_status(&dep.status))
                .unwrap_or(false)
        })
    }

    pub async fn are_dependencies_met(&self, feature_id: &str) -> WeaverResult<bool> {
        let feature = self
            .get_feature(feature_id)
            .await
            .ok_or_else(|| WeaverError::validation(format!("unknown feature {feature_id}")))?;
        let features = self.list_features_by_project(&feature.project_id).await;
        Ok(self.are_dependencies_met_within(&features, &feature).await)
    }

    /// Cycle detection via DFS over the existing graph union the proposed edges
    /// (spec.md §4.1). Rejects `new_deps` containing `feature_id` itself, and any
    /// dependency set whose transitive closure reaches `feature_id` — spec.md §9's
    /// correction that the closure must include the feature's own descendants.
    pub async fn validate_dependencies(
        &self,
        feature_id: &str,
        new_deps: &std::collections::HashSet<String>,
    ) -> WeaverResult<()> {
        if new_deps.contains(feature_id) {
            return Err(WeaverError::validation_with_reason(
                "Circular dependency detected",
                "self-dependency",
            ));
        }
        let feature = self
            .get_feature(feature_id)
            .await
            .ok_or_else(|| WeaverError::validation(format!("unknown feature {feature_id}")))?;
        let all_features = self.list_features_by_project(&feature.project_id).await;
        let mut by_id: HashMap<String, std::collections::HashSet<String>> = all_features
            .iter()
            .map(|f| (f.id.clone(), f.depends_on.clone()))
            .collect();
        by_id.insert(feature_id.to_string(), new_deps.clone());

        let mut visited = std::collections::HashSet::new();
        let mut stack: Vec<String> = new_deps.iter().cloned().collect();
        while let Some(current) = stack.pop() {
            if current == feature_id {
                return Err(WeaverError::validation_with_reason(
                    "Circular dependency detected",
                    "cycle",
                ));
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(deps) = by_id.get(&current) {
                stack.extend(deps.iter().cloned());
            }
        }
        Ok(())
    }

    // ---- Subtasks ----

    pub async fn create_subtask(&self, feature_id: &str, intent: String, apply_type: weaver_types::ApplyType) -> WeaverResult<Subtask> {
        let sequence = self.next_subtask_sequence.fetch_add(1, Ordering::SeqCst);
        let subtask = Subtask::new(feature_id, intent, apply_type, sequence);
        let mut snapshot = self.snapshot.write().await;
        snapshot.subtasks.insert(subtask.id.clone(), subtask.clone());
        self.flush(&snapshot).await?;
        Ok(subtask)
    }

    pub async fn get_subtask(&self, id: &str) -> Option<Subtask> {
        self.snapshot.read().await.subtasks.get(id).cloned()
    }

    pub async fn update_subtask(&self, subtask: Subtask) -> WeaverResult<()> {
        let mut snapshot = self.snapshot.write().await;
        snapshot.subtasks.insert(subtask.id.clone(), subtask);
        self.flush(&snapshot).await
    }

    /// Earliest created pending subtask for a feature, in creation order
    /// (spec.md §4.1).
    pub async fn get_next_pending_subtask(&self, feature_id: &str) -> Option<Subtask> {
        let snapshot = self.snapshot.read().await;
        snapshot
            .subtasks
            .values()
            .filter(|s| s.feature_id == feature_id && s.status == SubtaskStatus::Pending)
            .min_by_key(|s| s.sequence)
            .cloned()
    }

    pub async fn list_subtasks_by_feature(&self, feature_id: &str) -> Vec<Subtask> {
        let snapshot = self.snapshot.read().await;
        let mut subtasks: Vec<Subtask> = snapshot
            .subtasks
            .values()
            .filter(|s| s.feature_id == feature_id)
            .cloned()
            .collect();
        subtasks.sort_by_key(|s| s.sequence);
        subtasks
    }

    // ---- Crash recovery ----

    /// On startup, no Feature may remain in `running` (spec.md §8 "Crash recovery").
    /// Any feature found running is reset to `to_status` (typically `Pending`, a
    /// retry-friendly status).
    pub async fn reset_running_features(&self, to_status: FeatureStatus) -> WeaverResult<usize> {
        let mut snapshot = self.snapshot.write().await;
        let mut reset_count = 0usize;
        let running_ids: Vec<String> = snapshot
            .features
            .values()
            .filter(|f| f.status == FeatureStatus::Running)
            .map(|f| f.id.clone())
            .collect();
        for id in running_ids {
            if let Some(feature) = snapshot.features.get_mut(&id) {
                feature.status = to_status.clone();
                reset_count += 1;
            }
        }
        if reset_count > 0 {
            self.flush(&snapshot).await?;
        }
        Ok(reset_count)
    }

    // ---- Usage ----

    fn usage_key(project_id: &str, role: Option<&str>, model: &str) -> String {
        format!("{project_id}::{}::{model}", role.unwrap_or("-"))
    }

    /// Upserts both the (project, model) and (project, role, model) aggregates
    /// (spec.md §4.12).
    pub async fn record_model_usage(
        &self,
        project_id: &str,
        role: Option<&str>,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> WeaverResult<()> {
        let mut snapshot = self.snapshot.write().await;

        let total_key = Self::usage_key(project_id, None, model);
        let total = snapshot
            .usage
            .entry(total_key)
            .or_insert_with(|| UsageAggregate::new(project_id, None, model));
        total.accumulate(input_tokens, output_tokens);

        if let Some(role) = role {
            let role_key = Self::usage_key(project_id, Some(role), model);
            let by_role = snapshot
                .usage
                .entry(role_key)
                .or_insert_with(|| UsageAggregate::new(project_id, Some(role.to_string()), model));
            by_role.accumulate(input_tokens, output_tokens);
        }

        self.flush(&snapshot).await
    }

    pub async fn get_usage(&self, project_id: &str, role: Option<&str>, model: &str) -> Option<UsageAggregate> {
        self.snapshot.read().await.usage.get(&Self::usage_key(project_id, role, model)).cloned()
    }

    // ---- Events ----

    /// Append-only audit log (spec.md §3).
    pub async fn record_event(&self, mut event: Event) -> WeaverResult<Event> {
        event.id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let mut snapshot = self.snapshot.write().await;
        snapshot.events.push(event.clone());
        self.flush(&snapshot).await?;
        Ok(event)
    }

    pub async fn list_events_by_project(&self, project_id: &str) -> Vec<Event> {
        let snapshot = self.snapshot.read().await;
        snapshot
            .events
            .iter()
            .filter(|e| e.project_id.as_deref() == Some(project_id))
            .cloned()
            .collect()
    }

    // ---- Candidates ----

    /// Persists one sampled `Candidate` — including red-flagged, non-winning
    /// samples — with its sample/temperature metadata (spec.md §4.8 step 5).
    pub async fn create_candidate(
        &self,
        project_id: &str,
        feature_id: &str,
        subtask_id: &str,
        candidate: Candidate,
    ) -> WeaverResult<CandidateRecord> {
        let record = CandidateRecord {
            id: self.next_candidate_id.fetch_add(1, Ordering::SeqCst),
            project_id: project_id.to_string(),
            feature_id: feature_id.to_string(),
            subtask_id: subtask_id.to_string(),
            candidate,
            created_at: now_ms(),
        };
        let mut snapshot = self.snapshot.write().await;
        snapshot.candidates.push(record.clone());
        self.flush(&snapshot).await?;
        Ok(record)
    }

    pub async fn list_candidates_by_subtask(&self, subtask_id: &str) -> Vec<CandidateRecord> {
        let snapshot = self.snapshot.read().await;
        snapshot
            .candidates
            .iter()
            .filter(|c| c.subtask_id == subtask_id)
            .cloned()
            .collect()
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn resolve_dependency<'a>(features: &'a [Feature], dep_id: &str) -> Option<&'a Feature> {
    // Exact id, then project-prefixed, then suffix-match within the project —
    // spec.md §4.10's tolerant dependency resolution.
    if let Some(found) = features.iter().find(|f| f.id == dep_id) {
        return Some(found);
    }
    if let Some(found) = features.iter().find(|f| format!("{}:{}", f.project_id, f.id) == dep_id) {
        return Some(found);
    }
    features.iter().find(|f| f.id.ends_with(dep_id))
}

/// Convenience wrapper so callers can share one `Store` across components.
pub type SharedStore = Arc<Store>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use weaver_types::Priority;

    fn temp_store_path() -> PathBuf {
        std::env::temp_dir().join(format!("weaver-store-test-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn create_and_get_project_round_trips() {
        let store = Store::new(temp_store_path()).await.unwrap();
        let project = Project::new("demo", "/tmp/demo");
        store.create_project(project.clone()).await.unwrap();
        let fetched = store.get_project(&project.id).await.unwrap();
        assert_eq!(fetched.name, "demo");
    }

    #[tokio::test]
    async fn priority_selection_scenario() {
        // spec.md §8 scenario 1.
        let store = Store::new(temp_store_path()).await.unwrap();
        let project = store.create_project(Project::new("p", "/tmp/p")).await.unwrap();
        let f1 = store
            .create_feature(Feature::new(&project.id, "F1", Priority::A, 0))
            .await
            .unwrap();
        let mut f2 = Feature::new(&project.id, "F2", Priority::B, 1);
        f2.id = "f2".into();
        store.create_feature(f2).await.unwrap();
        let mut f3 = Feature::new(&project.id, "F3", Priority::A, 2);
        f3.depends_on.insert(f1.id.clone());
        store.create_feature(f3.clone()).await.unwrap();

        let next = store.get_next_runnable(&project.id).await.unwrap();
        assert_eq!(next.id, f1.id);

        let mut completed_f1 = f1.clone();
        completed_f1.status = FeatureStatus::Completed;
        store.update_feature(completed_f1).await.unwrap();

        let next = store.get_next_runnable(&project.id).await.unwrap();
        assert_eq!(next.id, f3.id);
    }

    #[tokio::test]
    async fn cycle_rejection_scenario() {
        // spec.md §8 scenario 2.
        let store = Store::new(temp_store_path()).await.unwrap();
        let project = store.create_project(Project::new("p", "/tmp/p")).await.unwrap();
        let f1 = store
            .create_feature(Feature::new(&project.id, "F1", Priority::A, 0))
            .await
            .unwrap();
        let mut f2 = Feature::new(&project.id, "F2", Priority::A, 1);
        f2.depends_on.insert(f1.id.clone());
        store.create_feature(f2.clone()).await.unwrap();

        let mut proposed = HashSet::new();
        proposed.insert(f2.id.clone());
        let result = store.validate_dependencies(&f1.id, &proposed).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().reason(), Some("cycle"));
    }

    #[tokio::test]
    async fn crash_recovery_resets_running_features() {
        let store = Store::new(temp_store_path()).await.unwrap();
        let project = store.create_project(Project::new("p", "/tmp/p")).await.unwrap();
        let mut feature = Feature::new(&project.id, "F1", Priority::A, 0);
        feature.status = FeatureStatus::Running;
        store.create_feature(feature.clone()).await.unwrap();

        let reset = store.reset_running_features(FeatureStatus::Pending).await.unwrap();
        assert_eq!(reset, 1);
        let refetched = store.get_feature(&feature.id).await.unwrap();
        assert_eq!(refetched.status, FeatureStatus::Pending);
    }

    #[tokio::test]
    async fn usage_aggregates_are_monotonic() {
        let store = Store::new(temp_store_path()).await.unwrap();
        store.record_model_usage("p1", Some("voter"), "openai:gpt-4o-mini", 100, 50).await.unwrap();
        store.record_model_usage("p1", Some("voter"), "openai:gpt-4o-mini", 10, 5).await.unwrap();
        let total = store.get_usage("p1", None, "openai:gpt-4o-mini").await.unwrap();
        assert_eq!(total.calls, 2);
        assert_eq!(total.total_tokens, 165);
    }

    #[tokio::test]
    async fn candidates_persist_including_flagged_samples() {
        let store = Store::new(temp_store_path()).await.unwrap();
        let candidate = weaver_types::Candidate {
            model: "local-echo:any".to_string(),
            output: "risky output".to_string(),
            red_flags: vec!["contains-secret".to_string()],
            sample_index: 0,
            temperature: 0.3,
        };
        store.create_candidate("p1", "f1", "s1", candidate).await.unwrap();
        let stored = store.list_candidates_by_subtask("s1").await;
        assert_eq!(stored.len(), 1);
        assert!(stored[0].candidate.is_flagged());
    }

    #[tokio::test]
    async fn delete_project_removes_folder_and_emits_event() {
        let store = Store::new(temp_store_path()).await.unwrap();
        let root = std::env::temp_dir().join(format!("weaver-store-delete-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&root).await.unwrap();
        let project = store.create_project(Project::new("p", root.to_string_lossy())).await.unwrap();
        let feature = store.create_feature(Feature::new(&project.id, "F", Priority::A, 0)).await.unwrap();
        store.create_candidate(&project.id, &feature.id, "s1", weaver_types::Candidate {
            model: "local-echo:any".to_string(),
            output: "out".to_string(),
            red_flags: vec![],
            sample_index: 0,
            temperature: 0.0,
        }).await.unwrap();

        store.delete_project(&project.id).await.unwrap();

        assert!(store.get_project(&project.id).await.is_none());
        assert!(!root.exists());
        assert!(store.list_candidates_by_subtask("s1").await.is_empty());
        let events = store.list_events_by_project(&project.id).await;
        assert!(events.iter().any(|e| e.event_type == "project-deleted"));
    }
}
