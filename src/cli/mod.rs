pub mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::clients::{
    ConsoleMessenger, DataGateway, HttpDataGateway, HttpMessenger, Messenger, NullDataGateway,
};
use crate::engine::BotEngine;
use crate::engine::context::EngineDeps;
use crate::engine::scheduler::{DelayScheduler, TokioDelayQueue};
use crate::engine::types::{EventKind, ExecutionStatus, InboundEvent};
use crate::graph::WorkflowVersion;
use crate::graph::repo::WorkflowRepo;
use crate::graph::validate::validate_version;
use crate::nodes::builtin;
use crate::storage::json_store::JsonExecutionStore;
use crate::vars::memory::MemoryVariableStore;

use config::BotflowConfig;

#[derive(Parser)]
#[command(name = "botflow", version, about = "Chat-bot workflow engine")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Simulate one inbound event against a workflow file
    Run {
        /// Path to the workflow version file (.json or .yaml)
        workflow: PathBuf,

        /// Inbound event as JSON string (default: a /start command)
        #[arg(short, long)]
        event: Option<String>,

        /// Enable verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Execution store directory
        #[arg(long, default_value = "data/executions")]
        store_dir: PathBuf,
    },

    /// Validate a workflow file without executing
    Validate {
        /// Path to the workflow version file
        workflow: PathBuf,
    },

    /// List persisted executions
    List {
        /// Filter by status (running, waiting, completed, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Execution store directory
        #[arg(long, default_value = "data/executions")]
        store_dir: PathBuf,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Inspect a specific execution with its step log
    Inspect {
        /// Execution ID
        execution_id: String,

        /// Execution store directory
        #[arg(long, default_value = "data/executions")]
        store_dir: PathBuf,
    },

    /// List registered node types
    Nodes,

    /// Start the REST API server
    Serve {
        /// Path to botflow.yaml (default: auto-detect in cwd)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0", env = "HOST")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "3000", env = "PORT")]
        port: u16,

        /// Execution store directory
        #[arg(long, default_value = "data/executions", env = "STORE_DIR")]
        store_dir: PathBuf,

        /// Base URL of the messaging platform API
        #[arg(long, env = "MESSENGER_URL")]
        messenger_url: Option<String>,

        /// Base URL of the data-layer service
        #[arg(long, env = "GATEWAY_URL")]
        gateway_url: Option<String>,

        /// Maximum request body size in bytes (default: 1048576 = 1 MB)
        #[arg(long, default_value = "1048576", env = "MAX_BODY")]
        max_body: usize,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    match cli.command {
        Commands::Run {
            workflow,
            event,
            verbose,
            store_dir,
        } => cmd_run(workflow, event, verbose, store_dir).await,
        Commands::Validate { workflow } => cmd_validate(workflow).await,
        Commands::List {
            status,
            store_dir,
            format,
        } => cmd_list(status, store_dir, format).await,
        Commands::Inspect {
            execution_id,
            store_dir,
        } => cmd_inspect(execution_id, store_dir).await,
        Commands::Nodes => cmd_nodes(),
        Commands::Serve {
            config,
            host,
            port,
            store_dir,
            messenger_url,
            gateway_url,
            max_body,
        } => {
            cmd_serve(
                config,
                host,
                port,
                store_dir,
                messenger_url,
                gateway_url,
                max_body,
            )
            .await
        }
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {
                // No .env file found — that's fine, silently skip
            }
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

/// Parse a workflow version from a JSON or YAML file.
fn load_workflow(path: &Path) -> Result<WorkflowVersion> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    if is_yaml {
        serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse workflow YAML: {}", path.display()))
    } else {
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse workflow JSON: {}", path.display()))
    }
}

fn build_engine(
    store_dir: PathBuf,
    messenger: Arc<dyn Messenger>,
    gateway: Arc<dyn DataGateway>,
) -> (Arc<BotEngine>, tokio::sync::mpsc::UnboundedReceiver<crate::engine::scheduler::TimerFired>)
{
    let (queue, fired) = TokioDelayQueue::new();
    let deps = EngineDeps {
        store: Arc::new(JsonExecutionStore::new(store_dir)),
        vars: Arc::new(MemoryVariableStore::new()),
        messenger,
        gateway,
        scheduler: Arc::new(DelayScheduler::new(Arc::new(queue))),
    };
    let engine = Arc::new(BotEngine::new(Arc::new(WorkflowRepo::new()), deps));
    (engine, fired)
}

async fn cmd_run(
    workflow_path: PathBuf,
    event_json: Option<String>,
    verbose: bool,
    store_dir: PathBuf,
) -> Result<()> {
    let version = load_workflow(&workflow_path)?;
    println!(
        "Workflow: {} v{} ({} nodes)",
        version.workflow_id,
        version.version,
        version.nodes.len()
    );

    let mut event: InboundEvent = match event_json {
        Some(json) => {
            serde_json::from_str(&json).with_context(|| "Failed to parse --event JSON")?
        }
        None => InboundEvent {
            project_id: "local".to_string(),
            chat_id: "local".to_string(),
            user_id: None,
            kind: EventKind::Command,
            text: Some("/start".to_string()),
            callback_data: None,
            contact: None,
            payload: serde_json::Value::Null,
        },
    };
    if event.project_id.is_empty() {
        event.project_id = "local".to_string();
    }

    let (engine, _fired) = build_engine(
        store_dir,
        Arc::new(ConsoleMessenger),
        Arc::new(NullDataGateway),
    );
    engine.publish(&event.project_id, version).await?;

    let Some(execution) = engine.handle_event(event).await? else {
        println!("Event matched no trigger");
        return Ok(());
    };

    println!("\nExecution: {}", execution.id);
    println!("Status: {}", execution.status);
    println!("Steps: {}", execution.step_count);
    if let Some(wait) = &execution.wait {
        println!("Waiting on: {} ({})", wait.node_id, wait.kind);
    }
    if let Some(err) = &execution.error {
        println!("Error: {}", err);
    }

    if verbose {
        let logs = engine.deps().store.logs(&execution.id).await?;
        println!("\nStep log:");
        for entry in logs {
            println!(
                "  {:>3}. {} [{}] {}",
                entry.step, entry.node_id, entry.node_type, entry.message
            );
        }
    }

    Ok(())
}

async fn cmd_validate(workflow_path: PathBuf) -> Result<()> {
    let version = load_workflow(&workflow_path)?;
    let registry = builtin::build_registry(Arc::new(WorkflowRepo::new()));

    println!("Workflow: {} v{}", version.workflow_id, version.version);
    println!("Nodes: {}", version.nodes.len());
    println!("Connections: {}", version.connections.len());

    let errors = validate_version(&version, &registry);
    if errors.is_empty() {
        println!("Validation: OK");
    } else {
        println!("Validation: FAILED");
        for err in &errors {
            println!("  - {}", err);
        }
        anyhow::bail!("{} validation error(s) found", errors.len());
    }

    Ok(())
}

async fn cmd_list(
    status: Option<String>,
    store_dir: PathBuf,
    format: String,
) -> Result<()> {
    let store = JsonExecutionStore::new(store_dir);
    let filter = status.as_deref().map(parse_status).transpose()?;

    use crate::storage::ExecutionStore;
    let executions = store.list(filter).await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    println!(
        "{:<38} {:<12} {:<10} {:<6} {}",
        "ID", "WORKFLOW", "STATUS", "STEPS", "STARTED"
    );
    for exec in &executions {
        println!(
            "{:<38} {:<12} {:<10} {:<6} {}",
            exec.id,
            exec.workflow_id,
            exec.status.to_string(),
            exec.step_count,
            exec.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn cmd_inspect(execution_id: String, store_dir: PathBuf) -> Result<()> {
    let store = JsonExecutionStore::new(store_dir);

    use crate::storage::ExecutionStore;
    let execution = store
        .get(&execution_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Execution not found: {}", execution_id))?;

    println!("{}", serde_json::to_string_pretty(&execution)?);

    let logs = store.logs(&execution_id).await?;
    if !logs.is_empty() {
        println!("\nStep log:");
        for entry in logs {
            println!(
                "  {:>3}. [{}] {} ({}) {}",
                entry.step, entry.level, entry.node_id, entry.node_type, entry.message
            );
        }
    }

    Ok(())
}

fn cmd_nodes() -> Result<()> {
    let registry = builtin::build_registry(Arc::new(WorkflowRepo::new()));

    println!("Registered node types:\n");
    for (node_type, handler) in registry.list() {
        println!("  {:<30} {}", node_type, handler);
    }

    Ok(())
}

async fn cmd_serve(
    config_path: Option<PathBuf>,
    host: String,
    port: u16,
    store_dir: PathBuf,
    messenger_url: Option<String>,
    gateway_url: Option<String>,
    max_body: usize,
) -> Result<()> {
    let config = BotflowConfig::load(config_path.as_deref())?;

    let host = config.host.unwrap_or(host);
    let port = config.port.unwrap_or(port);
    let store_dir = config.store_dir.map(PathBuf::from).unwrap_or(store_dir);
    let max_body = config.max_body.unwrap_or(max_body);
    let messenger_url = config.messenger_url.or(messenger_url);
    let gateway_url = config.gateway_url.or(gateway_url);
    let timeout = Duration::from_millis(config.client_timeout_ms.unwrap_or(10_000));

    let messenger: Arc<dyn Messenger> = match messenger_url {
        Some(url) => Arc::new(HttpMessenger::new(url, timeout)?),
        None => {
            eprintln!("Warning: no messenger URL configured; outbound messages go to stdout");
            Arc::new(ConsoleMessenger)
        }
    };
    let gateway: Arc<dyn DataGateway> = match gateway_url {
        Some(url) => Arc::new(HttpDataGateway::new(url, timeout)?),
        None => Arc::new(NullDataGateway),
    };

    let (engine, fired) = build_engine(store_dir, messenger, gateway);
    tokio::spawn(engine.clone().run_timer_loop(fired));

    crate::api::serve(&host, port, engine, max_body).await
}

fn parse_status(s: &str) -> Result<ExecutionStatus> {
    match s {
        "running" => Ok(ExecutionStatus::Running),
        "waiting" => Ok(ExecutionStatus::Waiting),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        other => anyhow::bail!("Unknown status filter: {}", other),
    }
}
