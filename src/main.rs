mod doctor;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::{dirs_home, AppConfig, EngineConfig, ModelConfig, StorageConfig};
use weft_core::event::EventBus;
use weft_core::types::{FlowEvent, NodeId, NodeStatus};
use weft_flow::{FlowController, FlowGraph, RunReport};
use weft_store::SqliteStore;

#[derive(Parser)]
#[command(name = "weft", version, about = "Run prompt-node dependency graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    /// Key of the stored flow to work on (defaults to storage.flow_key)
    #[arg(short, long, env = "WEFT_FLOW")]
    flow: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a node and print its id
    Add {
        #[arg(long, default_value = "100")]
        x: f64,
        #[arg(long, default_value = "100")]
        y: f64,
        /// System prompt
        #[arg(long)]
        system: Option<String>,
        /// Input text (used when the node has no dependencies)
        #[arg(long)]
        input: Option<String>,
        /// Nodes the new node depends on, in concatenation order
        #[arg(long = "after")]
        after: Vec<String>,
    },
    /// Remove a node and every edge touching it
    Remove { id: String },
    /// Make TARGET depend on SOURCE
    Connect { target: String, source: String },
    /// Remove the edge SOURCE -> TARGET
    Disconnect { target: String, source: String },
    /// Edit a node's prompts
    Prompt {
        id: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        input: Option<String>,
    },
    /// Move or resize a node
    Layout {
        id: String,
        #[arg(long)]
        x: Option<f64>,
        #[arg(long)]
        y: Option<f64>,
        #[arg(long)]
        w: Option<f64>,
        #[arg(long)]
        h: Option<f64>,
    },
    /// Show the nodes of the flow
    Show,
    /// Run the whole flow
    Run {
        /// Stream generated text to stderr as it arrives
        #[arg(long)]
        stream: bool,
    },
    /// Print the flow document as JSON
    Export,
    /// Replace the flow with a JSON document
    Import { file: PathBuf },
    /// List stored flows
    Flows,
    /// Show current configuration
    Config,
    /// Run configuration and storage health checks
    Doctor,
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
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut io::stdout());
        return Ok(());
    }

    let mut config = load_config(&cli.config)?;
    if let Commands::Run { stream: true } = cli.command {
        config.engine.streaming = true;
    }
    let flow_key = cli
        .flow
        .clone()
        .unwrap_or_else(|| config.storage.flow_key.clone());

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            return Ok(());
        }
        Commands::Doctor => {
            let failures = doctor::run_doctor(&config, &flow_key).await;
            if failures > 0 {
                std::process::exit(1);
            }
            return Ok(());
        }
        _ => {}
    }

    let store = Arc::new(SqliteStore::open(&config.db_path(), flow_key.clone())?);
    let service = weft_llm::service_from_config(&config)?;
    let event_bus = Arc::new(EventBus::default());
    let controller = Arc::new(FlowController::new(
        store.clone(),
        service,
        event_bus,
        config.engine.clone(),
    ));
    controller.load().await?;

    match cli.command {
        Commands::Add {
            x,
            y,
            system,
            input,
            after,
        } => {
            let deps = after
                .iter()
                .map(|s| resolve(&controller, s))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let id = controller.add_node(x, y).await?;
            if let Some(system) = system {
                controller.set_system_prompt(&id, &system).await?;
            }
            if let Some(input) = input {
                controller.set_input(&id, &input).await?;
            }
            for dep in &deps {
                controller.connect(&id, dep).await?;
            }
            println!("{}", id);
        }
        Commands::Remove { id } => {
            let id = resolve(&controller, &id)?;
            controller.remove_node(&id).await?;
            println!("Removed {}", id);
        }
        Commands::Connect { target, source } => {
            let target = resolve(&controller, &target)?;
            let source = resolve(&controller, &source)?;
            let verdict = controller.validate(&source, &target);
            if !verdict.is_valid {
                anyhow::bail!(
                    "connection rejected: {}",
                    verdict.reason.unwrap_or_default()
                );
            }
            controller.connect(&target, &source).await?;
            println!("{} -> {}", short(&source), short(&target));
        }
        Commands::Disconnect { target, source } => {
            let target = resolve(&controller, &target)?;
            let source = resolve(&controller, &source)?;
            if !controller.disconnect(&target, &source).await? {
                eprintln!("No edge {} -> {}", short(&source), short(&target));
            }
        }
        Commands::Prompt { id, system, input } => {
            let id = resolve(&controller, &id)?;
            if let Some(system) = system {
                controller.set_system_prompt(&id, &system).await?;
            }
            if let Some(input) = input {
                controller.set_input(&id, &input).await?;
            }
        }
        Commands::Layout { id, x, y, w, h } => {
            let id = resolve(&controller, &id)?;
            let node = controller
                .graph()
                .get(&id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("node {} disappeared", id))?;
            if x.is_some() || y.is_some() {
                controller
                    .set_position(&id, x.unwrap_or(node.x), y.unwrap_or(node.y))
                    .await?;
            }
            if w.is_some() || h.is_some() {
                controller
                    .set_size(&id, w.unwrap_or(node.w), h.unwrap_or(node.h))
                    .await?;
            }
        }
        Commands::Show => {
            controller.with_graph(print_graph);
        }
        Commands::Run { stream } => {
            let report = run_flow(&controller, stream).await?;
            print_report(&controller.graph(), &report);
            if !report.succeeded() {
                std::process::exit(2);
            }
        }
        Commands::Export => {
            let doc: serde_json::Value = serde_json::from_str(&controller.graph().serialize())?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::Import { file } => {
            let text = std::fs::read_to_string(&file)?;
            let graph = FlowGraph::try_deserialize(&text)?;
            let count = graph.len();
            controller.replace_graph(graph).await?;
            println!("Imported {} nodes into '{}'", count, flow_key);
        }
        Commands::Flows => {
            for flow in store.list()? {
                let updated = flow
                    .updated_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".into());
                let marker = if flow.key == flow_key { "*" } else { " " };
                println!("{} {:<24} {:>8} bytes  {}", marker, flow.key, flow.bytes, updated);
            }
        }
        Commands::Config | Commands::Doctor | Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    let home_config = dirs_home().map(|h| h.join(".weft").join("config.toml"));
    if let Some(path) = home_config.filter(|p| p.exists()) {
        info!(path = %path.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&path)?);
    }

    match AppConfig::from_env() {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!(error = %e, "No usable config, generation calls will fail");
            eprintln!("Warning: No config file found. Set OPENAI_API_KEY or create weft.toml");
            Ok(AppConfig {
                model: ModelConfig::new("gpt-4"),
                fallback_models: vec![],
                engine: EngineConfig::default(),
                storage: StorageConfig::default(),
            })
        }
    }
}

/// Resolve a full node id or a unique prefix of one.
fn resolve(controller: &FlowController, needle: &str) -> anyhow::Result<NodeId> {
    controller.with_graph(|graph| {
        let exact = NodeId::from(needle);
        if graph.contains(&exact) {
            return Ok(exact);
        }
        let matches: Vec<&NodeId> = graph
            .nodes()
            .map(|n| &n.id)
            .filter(|id| id.as_str().starts_with(needle))
            .collect();
        match matches.as_slice() {
            [one] => Ok((*one).clone()),
            [] => anyhow::bail!("no node matches '{}'", needle),
            _ => anyhow::bail!("'{}' matches {} nodes", needle, matches.len()),
        }
    })
}

async fn run_flow(controller: &Arc<FlowController>, stream: bool) -> anyhow::Result<RunReport> {
    let mut rx = controller.subscribe();

    let print_handle = tokio::spawn(async move {
        let mut last_chunk_node: Option<NodeId> = None;
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                FlowEvent::NodeStatusChanged {
                    node_id,
                    status,
                    error,
                    ..
                } => match (status, error) {
                    (NodeStatus::Idle, _) => {}
                    (NodeStatus::Error, Some(error)) => {
                        eprintln!("[{}: error] {}", short(&node_id), error)
                    }
                    (status, _) => eprintln!("[{}: {}]", short(&node_id), status),
                },
                FlowEvent::NodeChunk { node_id, text, .. } if stream => {
                    if last_chunk_node.as_ref() != Some(&node_id) {
                        eprintln!("\n[{}]", short(&node_id));
                        last_chunk_node = Some(node_id);
                    }
                    eprint!("{}", text);
                    io::stderr().flush().ok();
                }
                FlowEvent::RunFinished { .. } => break,
                _ => {}
            }
        }
    });

    // Ctrl-C cancels the run; the partial results are still saved.
    let ctrl_c = {
        let controller = controller.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling run...");
                controller.cancel_run();
            }
        })
    };

    let report = controller.run().await;
    ctrl_c.abort();
    settle_printer(print_handle, report.is_ok()).await;
    Ok(report?)
}

/// A run that fails before starting publishes no `RunFinished`, so the
/// printer is only drained when the run went through.
async fn settle_printer(handle: JoinHandle<()>, run_started: bool) {
    if !run_started {
        handle.abort();
    }
    handle.await.ok();
}

fn print_graph(graph: &FlowGraph) {
    if graph.is_empty() {
        println!("(empty flow)");
        return;
    }
    println!(
        "{:<10} {:<9} {:<24} {}",
        "ID", "STATUS", "DEPENDS ON", "SYSTEM PROMPT"
    );
    for node in graph.nodes() {
        let deps: Vec<&str> = node.depends_on.iter().map(short).collect();
        let deps = if deps.is_empty() {
            "-".to_string()
        } else {
            deps.join(",")
        };
        println!(
            "{:<10} {:<9} {:<24} {}",
            short(&node.id),
            node.status,
            deps,
            truncate(&node.system_prompt, 60)
        );
    }
}

fn print_report(graph: &FlowGraph, report: &RunReport) {
    for result in &report.results {
        let name = graph
            .get(&result.node_id)
            .map(|n| truncate(&n.system_prompt, 40).to_string())
            .unwrap_or_default();
        println!(
            "=== {} ({}, {} ms) {}",
            short(&result.node_id),
            result.record.status,
            result.elapsed_ms,
            name
        );
        match &result.record.error_message {
            Some(error) => println!("error: {}", error),
            None => println!("{}", result.record.output),
        }
        println!();
    }
    eprintln!(
        "{} complete, {} failed in {} ms",
        report.completed(),
        report.failed(),
        report.total_elapsed_ms
    );
}

fn short(id: &NodeId) -> &str {
    truncate(id.as_str(), 8)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_failed_run_does_not_wait_for_printer() {
        // Stands in for a printer still waiting on RunFinished.
        let printer = tokio::spawn(std::future::pending::<()>());
        let settled =
            tokio::time::timeout(Duration::from_secs(1), settle_printer(printer, false)).await;
        assert!(settled.is_ok());
    }

    #[tokio::test]
    async fn test_started_run_drains_printer() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let printer = tokio::spawn(async move {
            rx.await.ok();
        });
        tx.send(()).unwrap();
        settle_printer(printer, true).await;
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("héllo wörld", 8), "héllo wö");
        assert_eq!(truncate("short", 8), "short");
    }
}
