use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowgraph_core::config::AppConfig;
use flowgraph_core::types::{EventType, Outputs, RunEvent, RunId, RunStatus};
use flowgraph_engine::{
    Graph, GraphDefinition, NodeRegistry, RunController, RunLogger, SqliteRunStore,
};

#[derive(Parser)]
#[command(name = "flowgraph", version, about = "Workflow graph execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowgraph.toml", env = "FLOWGRAPH_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a graph definition file
    Validate {
        /// Graph definition (JSON)
        file: PathBuf,
    },
    /// Run a graph definition and print its outputs
    Run {
        /// Graph definition (JSON)
        file: PathBuf,
        /// Run inputs as a JSON object
        #[arg(long, short, default_value = "{}")]
        input: String,
        /// Print node lifecycle events to stderr
        #[arg(long, short)]
        verbose: bool,
    },
    /// List runs recorded in the store
    Runs,
    /// Show the transitions and node records of a stored run
    Show {
        run_id: String,
    },
    /// Delete a stored run
    Forget {
        run_id: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("flowgraph=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowgraph", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { file } => {
            let registry = NodeRegistry::with_builtins();
            let graph = load_graph(&file, &registry)?;
            println!(
                "{} v{}: {} nodes, {} edges, entry '{}'",
                graph.id(),
                graph.version(),
                graph.len(),
                graph.edges().len(),
                graph.node(graph.entry()).id
            );
        }
        Commands::Run {
            file,
            input,
            verbose,
        } => {
            let inputs: Outputs = serde_json::from_str(&input)
                .context("--input must be a JSON object")?;
            run_graph(&config, &file, inputs, verbose).await?;
        }
        Commands::Runs => {
            let store = open_store(&config)?;
            for run_id in store.list_runs()? {
                match store.latest_run(&run_id)? {
                    Some(state) => println!(
                        "{}  {:<9}  {} v{}",
                        run_id, state.status.to_string(), state.graph_id, state.graph_version
                    ),
                    None => println!("{}", run_id),
                }
            }
        }
        Commands::Show { run_id } => {
            let store = open_store(&config)?;
            let history = store.run_history(&run_id)?;
            if history.is_empty() {
                anyhow::bail!("no run '{}' in the store", run_id);
            }
            for state in &history {
                let at = state.finished_at.or(state.started_at);
                println!(
                    "{:<9} {}",
                    state.status.to_string(),
                    at.map(|t| t.to_rfc3339()).unwrap_or_default()
                );
            }
            for record in store.node_records(&run_id)? {
                let scope = match (&record.parent, record.iteration) {
                    (Some(parent), Some(i)) => format!(" [{}#{}]", parent, i),
                    _ => String::new(),
                };
                println!(
                    "  {}{}: {:?} (attempts: {})",
                    record.node_id, scope, record.status, record.attempts
                );
                if let Some(error) = record.error {
                    println!("    error: {}", error);
                }
            }
            if let Some(last) = history.last() {
                println!("{}", serde_json::to_string_pretty(&last.outputs)?);
            }
        }
        Commands::Forget { run_id } => {
            let store = open_store(&config)?;
            let removed = store.delete_run(&run_id)?;
            println!("Removed {} rows for run {}", removed, run_id);
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        Ok(AppConfig::default())
    }
}

fn load_graph(file: &Path, registry: &NodeRegistry) -> anyhow::Result<Arc<Graph>> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let definition = GraphDefinition::from_json(&json)
        .with_context(|| format!("parsing {}", file.display()))?;
    Ok(Graph::publish(&definition, registry)?)
}

fn open_store(config: &AppConfig) -> anyhow::Result<SqliteRunStore> {
    let store = config
        .store
        .as_ref()
        .context("no [store] section in config")?;
    Ok(SqliteRunStore::open(&store.path())?)
}

async fn run_graph(
    config: &AppConfig,
    file: &Path,
    inputs: Outputs,
    verbose: bool,
) -> anyhow::Result<()> {
    let registry = Arc::new(NodeRegistry::with_builtins());
    let graph = load_graph(file, &registry)?;

    let mut controller = RunController::new(registry, config);
    if let Some(store) = &config.store {
        let path = store.path();
        controller = controller.with_store(Arc::new(SqliteRunStore::open(&path)?));
        info!(path = %path.display(), "Recording runs");
    }

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();
    if let Some(log) = config.log.as_ref().filter(|l| l.enabled) {
        let logger = RunLogger::new(log.log_dir(), log.level);
        tasks.push(tokio::spawn(logger.run(controller.subscribe(), shutdown.clone())));
    }
    if verbose {
        tasks.push(tokio::spawn(print_events(controller.subscribe(), shutdown.clone())));
    }

    let run_id = controller.start_run(graph, inputs)?;
    let snapshot = tokio::select! {
        snapshot = controller.wait_run(&run_id) => snapshot?,
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "Interrupted, cancelling run");
            cancel_if_running(&controller, &run_id);
            controller.wait_run(&run_id).await?
        }
    };

    controller.flush_store().await;
    shutdown.cancel();
    for task in tasks {
        task.await.ok();
    }

    match snapshot.state.status {
        RunStatus::Succeeded => {
            println!("{}", serde_json::to_string_pretty(&snapshot.state.outputs)?);
            Ok(())
        }
        RunStatus::Failed => {
            let message = snapshot
                .state
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".into());
            anyhow::bail!("run {} failed: {}", run_id, message)
        }
        status => anyhow::bail!("run {} ended as {}", run_id, status),
    }
}

fn cancel_if_running(controller: &RunController, run_id: &RunId) {
    if let Err(e) = controller.cancel_run(run_id) {
        warn!(run_id = %run_id, error = %e, "Cancel failed");
    }
}

async fn print_events(mut rx: broadcast::Receiver<RunEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            result = rx.recv() => match result {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = cancel.cancelled() => break,
        };
        let node = event.node_id.as_deref().unwrap_or("-");
        match event.event_type {
            EventType::NodeOutputChunk => {
                eprintln!("[{}] {}", node, event.payload["chunk"]);
            }
            EventType::NodeFailed | EventType::NodeRetrying => {
                eprintln!("[{}: {}] {}", node, event.event_type, event.payload["error"]);
            }
            EventType::NodeStarted | EventType::NodeSucceeded | EventType::NodeSkipped => {
                eprintln!("[{}: {}]", node, event.event_type);
            }
            _ => eprintln!("[run: {}]", event.event_type),
        }
    }
}
