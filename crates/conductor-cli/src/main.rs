use clap::{Parser, Subcommand};
use conductor_orchestrator::{
    build_plan, echo_pool, evaluate, AgentTask, CapabilityRegistry, ConductorConfig,
    ConversationState, ExecutionPlan, FileResultStore, HealthMonitor, Orchestrator,
    ProfileRegistry, Request,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: agent orchestration and scheduling")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rank agents for a request
    Select {
        /// Request text
        text: String,
        #[command(flatten)]
        context: ContextArgs,
        /// Maximum number of agents (overrides config)
        #[arg(long)]
        max_agents: Option<usize>,
    },
    /// Build an execution plan from a task file
    Plan {
        /// TOML file with `[[tasks]]` entries
        tasks: PathBuf,
    },
    /// Run a request or a task file with echo agents
    Run {
        /// Request text; ignored when --tasks is given
        text: Option<String>,
        /// TOML file with `[[tasks]]` entries
        #[arg(long)]
        tasks: Option<PathBuf>,
        #[command(flatten)]
        context: ContextArgs,
        /// Simulated agent latency in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        /// Directory to persist the execution result in
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Evaluate conversation health
    Health {
        /// Tokens used so far
        used: u64,
        /// Token limit of the conversation
        limit: u64,
        /// Turns so far
        #[arg(long, default_value_t = 0)]
        depth: u32,
    },
    /// List configured agent profiles
    Profiles,
}

#[derive(clap::Args)]
struct ContextArgs {
    /// Development phase (e.g. design, implementation)
    #[arg(long)]
    phase: Option<String>,
    /// Conversation history depth in turns
    #[arg(long, default_value_t = 0)]
    depth: u32,
    /// Estimated complexity in [0, 1]
    #[arg(long, default_value_t = 0.0)]
    complexity: f64,
}

impl ContextArgs {
    fn request(&self, text: &str) -> Request {
        let mut request = Request::new(text)
            .with_history_depth(self.depth)
            .with_complexity(self.complexity);
        if let Some(phase) = &self.phase {
            request = request.with_phase(phase.clone());
        }
        request
    }
}

#[derive(Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<AgentTask>,
}

/// Load `path`, or the built-in defaults when it does not exist.
async fn load_config(path: &Path) -> anyhow::Result<ConductorConfig> {
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(ConductorConfig::default());
    }
    let config_str = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
    })?;
    Ok(ConductorConfig::from_toml_str(&config_str)?)
}

async fn load_plan(path: &Path) -> anyhow::Result<ExecutionPlan> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read task file '{}': {}", path.display(), e))?;
    let file: TaskFile = toml::from_str(&data)?;
    Ok(build_plan(file.tasks)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Select {
            text,
            context,
            max_agents,
        } => {
            if let Some(max) = max_agents {
                config.orchestrator.max_agents = max;
            }
            let registry = registry_for(&config);
            let orchestrator = Orchestrator::new(config, Arc::new(echo_pool(&registry, Duration::ZERO)))?;
            let selection = orchestrator.select(&context.request(&text));
            print_json(&selection)?;
        }
        Commands::Plan { tasks } => {
            let plan = load_plan(&tasks).await?;
            info!(plan_id = %plan.id, phases = plan.phase_count(), "Plan built");
            print_json(&plan)?;
        }
        Commands::Run {
            text,
            tasks,
            context,
            delay_ms,
            data_dir,
        } => {
            let registry = registry_for(&config);
            let backend = Arc::new(echo_pool(&registry, Duration::from_millis(delay_ms)));
            let mut orchestrator = Orchestrator::new(config, backend)?;
            if let Some(dir) = data_dir {
                let store = FileResultStore::new(dir).await?;
                orchestrator = orchestrator.with_store(Arc::new(store));
            }

            let result = match (tasks, text) {
                (Some(path), _) => {
                    let plan = load_plan(&path).await?;
                    orchestrator.execute(&plan).await?
                }
                (None, Some(text)) => {
                    let outcome = orchestrator
                        .run(&context.request(&text), &serde_json::Value::Null)
                        .await?;
                    outcome.result
                }
                (None, None) => anyhow::bail!("either a request text or --tasks is required"),
            };
            info!(summary = %result.summary(), "Run finished");
            print_json(&result)?;
        }
        Commands::Health { used, limit, depth } => {
            let mut state = ConversationState::new(limit);
            state.tokens_used = used;
            state.turn_depth = depth;
            let report = HealthMonitor::from_config(&config.orchestrator).assess(&state);
            info!(token_only = %evaluate(used, limit), status = %report.status, "Health evaluated");
            print_json(&report)?;
        }
        Commands::Profiles => {
            let registry = registry_for(&config);
            let profiles: Vec<_> = registry.profiles().into_iter().cloned().collect();
            print_json(&profiles)?;
        }
    }

    Ok(())
}

fn registry_for(config: &ConductorConfig) -> ProfileRegistry {
    if config.profiles.is_empty() {
        ProfileRegistry::with_defaults()
    } else {
        ProfileRegistry::new(config.profiles.clone())
    }
}
