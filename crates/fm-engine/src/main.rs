//! foreman -- drive a project description through planning, a pool of
//! implementation agents, verification, and serialized integration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use fm_agents::runtime::AgentRuntime;
use fm_core::config::Config;
use fm_core::events::EventBus;
use fm_core::logging;
use fm_core::types::Project;
use fm_core::workspace::WorkspaceManager;
use fm_engine::registry::ProjectRegistry;
use fm_engine::scheduler::Scheduler;
use fm_harness::provider::provider_from_config;
use fm_harness::retry::{ModelClient, RetryPolicy};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// foreman -- plan a project into tasks and run agents to completion.
#[derive(Parser)]
#[command(name = "foreman", version, about)]
struct Cli {
    /// Path to a config file (defaults to ~/.foreman/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute a project end to end.
    Run {
        /// What to build, in plain language.
        description: String,
        /// Directory the project is built in.
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
        /// Project name (derived from the description when omitted).
        #[arg(long)]
        name: Option<String>,
    },

    /// Produce the task plan as JSON without executing it.
    Plan {
        /// What to build, in plain language.
        description: String,
        /// Directory the planner may read files from.
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    logging::init_logging("foreman", &config.general.log_level, config.general.json_logs);

    match cli.command {
        Commands::Run {
            description,
            workspace,
            name,
        } => run_project(config, &description, &workspace, name).await,
        Commands::Plan {
            description,
            workspace,
        } => plan_only(config, &description, &workspace).await,
    }
}

async fn run_project(
    config: Config,
    description: &str,
    workspace: &PathBuf,
    name: Option<String>,
) -> Result<()> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create {}", workspace.display()))?;
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", workspace.display()))?;

    let provider = provider_from_config(&config.model).context("model provider unavailable")?;
    let client = ModelClient::new(provider, RetryPolicy::from_config(&config.model));
    info!(
        workspace = %workspace.display(),
        provider = client.provider_name(),
        "foreman starting"
    );
    let bus = EventBus::new();
    let runtime = AgentRuntime::new(client, bus.clone(), config.agents.clone());
    let manager = WorkspaceManager::new(
        &workspace,
        &config.workspace.integration_branch,
        &config.workspace.workdir_name,
        config.agents.command_timeout(),
    );

    let registry = Arc::new(ProjectRegistry::new());
    let log_pump = registry.attach(&bus);

    let project = Project::new(
        name.unwrap_or_else(|| derive_name(description)),
        description,
        &workspace,
    );
    let project_id = project.id;
    println!("project {} ({project_id})", project.name);
    registry.insert(project);

    let scheduler = Scheduler::new(config, runtime, manager, Arc::clone(&registry), bus.clone());
    let report = scheduler.run(project_id, description).await?;
    log_pump.abort();

    println!(
        "{}: plan v{}, {} merged, {} failed, {} blocked, {} replans",
        report.status,
        report.prd_version,
        report.merged.len(),
        report.failed.len(),
        report.blocked.len(),
        report.replans,
    );
    print_ids("merged", &report.merged);
    print_ids("failed", &report.failed);
    print_ids("blocked", &report.blocked);
    Ok(())
}

async fn plan_only(config: Config, description: &str, workspace: &PathBuf) -> Result<()> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create {}", workspace.display()))?;
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", workspace.display()))?;

    let provider = provider_from_config(&config.model).context("model provider unavailable")?;
    let client = ModelClient::new(provider, RetryPolicy::from_config(&config.model));
    let bus = EventBus::new();
    let runtime = AgentRuntime::new(client, bus, config.agents.clone());

    let prd = runtime
        .run_planning(Uuid::new_v4(), description, &workspace)
        .await
        .context("planning failed")?;
    println!("{}", serde_json::to_string_pretty(&prd)?);
    Ok(())
}

fn print_ids(label: &str, ids: &[fm_core::types::TaskId]) {
    if ids.is_empty() {
        return;
    }
    println!("  {label}:");
    for id in ids {
        println!("    {id}");
    }
}

/// A short project name taken from the leading words of the description.
fn derive_name(description: &str) -> String {
    let mut name = String::new();
    for word in description.split_whitespace() {
        if !name.is_empty() {
            if name.len() + word.len() + 1 > 40 {
                break;
            }
            name.push(' ');
        }
        name.push_str(word);
    }
    if name.is_empty() {
        name.push_str("project");
    }
    name
}
