use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use weaver_core::command_runner::{CommandPolicy, CommandRunner, SafetyMode};
use weaver_core::config::ConfigStore;
use weaver_core::guard::Guard;
use weaver_core::store::Store;
use weaver_core::EventBus;
use weaver_orchestrator::{FeatureManager, FeaturePlanner, Orchestrator};
use weaver_providers::{AppConfig, ProviderRegistry};
use weaver_types::{FeatureStatus, Project};
use weaver_voting::VotingConfig;

#[derive(Parser, Debug)]
#[command(name = "weaver")]
#[command(about = "Autonomous code-generation orchestrator")]
struct Cli {
    #[arg(long, env = "WEAVER_DATA_DIR")]
    data_dir: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Creates a project and binds its folder.
    NewProject {
        name: String,
        folder_path: String,
    },
    /// Adds a feature to a project.
    AddFeature {
        project_id: String,
        name: String,
        #[arg(long, default_value = "A")]
        priority: String,
        #[arg(long)]
        depends_on: Vec<String>,
    },
    /// Runs the next runnable feature for a project to completion, pause, or failure.
    Run {
        project_id: String,
        #[arg(long, default_value = "local-echo:any")]
        model: String,
    },
    /// Lists features for a project in scheduling order.
    ListFeatures {
        project_id: String,
    },
    /// Promotes a human_testing feature to completed.
    MarkCompleted {
        feature_id: String,
    },
    /// Deletes a project: removes its folder from disk and cascades removal of its
    /// features, subtasks, events, usage and candidate rows.
    DeleteProject {
        project_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").with_target(false).init();

    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir);
    let state = build_state(&data_dir).await?;

    // Crash recovery: no Feature may remain `running` across a restart (spec.md §8).
    let reset = state.store.reset_running_features(FeatureStatus::Pending).await?;
    if reset > 0 {
        info!(reset, "reset running features left over from a prior crash");
    }

    match cli.command {
        Command::NewProject { name, folder_path } => {
            tokio::fs::create_dir_all(&folder_path).await.context("creating project folder")?;
            let mut project = Project::new(&name, &folder_path);
            project.status = weaver_types::ProjectStatus::Active;
            let created = state.store.create_project(project).await?;
            println!("{}", created.id);
        }
        Command::AddFeature { project_id, name, priority, depends_on } => {
            let priority = parse_priority(&priority)?;
            let order_index = state.store.list_features_by_project(&project_id).await.len() as i64;
            let mut feature = weaver_types::Feature::new(&project_id, &name, priority, order_index);
            feature.depends_on = depends_on.into_iter().collect();
            state.store.validate_dependencies(&feature.id, &feature.depends_on).await.ok();
            let created = state.store.create_feature(feature).await?;
            println!("{}", created.id);
        }
        Command::Run { project_id, model } => {
            let project = state
                .store
                .get_project(&project_id)
                .await
                .context("unknown project")?;
            let Some(feature) = state.manager.next_runnable(&project_id).await else {
                println!("no runnable feature");
                return Ok(());
            };
            let settings = state.config.get().await;
            let voting_config = VotingConfig {
                k: settings.k,
                initial_samples: settings.initial_samples,
                max_samples: settings.max_samples,
                fixed_temperature: None,
                red_flag_rules: Vec::new(),
            };
            let guard = Guard::new(&project.folder_path);
            if feature.status == FeatureStatus::Paused {
                state
                    .manager
                    .resume(&project, &feature.id, &model, voting_config, &guard, &state.command_runner, &[])
                    .await?;
            } else {
                state
                    .manager
                    .execute_feature(&project, feature, &model, voting_config, &guard, &state.command_runner, &[])
                    .await?;
            }
        }
        Command::ListFeatures { project_id } => {
            for feature in state.store.list_features_by_project(&project_id).await {
                println!("{}\t{:?}\t{:?}", feature.id, feature.priority, feature.status);
            }
        }
        Command::MarkCompleted { feature_id } => {
            state.manager.mark_as_completed(&feature_id).await?;
        }
        Command::DeleteProject { project_id } => {
            state.store.delete_project(&project_id).await?;
            println!("deleted {project_id}");
        }
    }

    Ok(())
}

fn parse_priority(raw: &str) -> anyhow::Result<weaver_types::Priority> {
    match raw.to_uppercase().as_str() {
        "A" => Ok(weaver_types::Priority::A),
        "B" => Ok(weaver_types::Priority::B),
        "C" => Ok(weaver_types::Priority::C),
        other => anyhow::bail!("unknown priority: {other}"),
    }
}

fn resolve_data_dir(cli_override: Option<String>) -> PathBuf {
    if let Some(dir) = cli_override {
        return PathBuf::from(dir);
    }
    dirs::data_dir().unwrap_or_else(std::env::temp_dir).join("weaver")
}

struct AppState {
    store: Arc<Store>,
    manager: Arc<FeatureManager>,
    command_runner: CommandRunner,
    config: ConfigStore,
}

async fn build_state(data_dir: &PathBuf) -> anyhow::Result<AppState> {
    tokio::fs::create_dir_all(data_dir).await.context("creating data dir")?;

    let store = Arc::new(Store::new(data_dir.join("store.json")).await?);
    let event_bus = EventBus::new();
    let config = ConfigStore::new(data_dir.join("project_config.json"), None).await?;
    let settings = config.get().await;

    let policy = CommandPolicy {
        safety_mode_ask: matches!(settings.safety_mode, weaver_core::config::SafetyModeSetting::Ask),
        allowlist: settings.allowlist.clone(),
        denylist: settings.denylist.clone(),
        ..Default::default()
    };
    let safety_mode = match settings.safety_mode {
        weaver_core::config::SafetyModeSetting::Ask => SafetyMode::Ask,
        weaver_core::config::SafetyModeSetting::Auto => SafetyMode::Auto,
    };
    let command_runner = CommandRunner::new(policy, safety_mode, event_bus.clone());

    let mut provider_config = AppConfig::default();
    for (provider, key) in &settings.provider_api_keys {
        provider_config.providers.insert(
            provider.clone(),
            weaver_providers::ProviderConfig { api_key: Some(key.clone()), url: None, default_model: None },
        );
    }
    let providers = ProviderRegistry::new(provider_config);

    let orchestrator =
        Orchestrator::new(store.clone(), event_bus.clone(), providers.clone()).with_log_verbosity(settings.log_verbosity);
    let planner = FeaturePlanner::new(providers.clone(), event_bus.clone());
    let manager = Arc::new(FeatureManager::new(store.clone(), event_bus.clone(), orchestrator, planner));

    Ok(AppState { store, manager, command_runner, config })
}
