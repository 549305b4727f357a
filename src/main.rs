//! # cognigraph
//!
//! Command-line runner for cognitive graph documents.
//!
//! - `validate`: check a graph document and print its execution plan
//! - `run`: execute a graph (with fallback), streaming events as they happen
//! - `render`: print a Mermaid flowchart of a graph
//! - `trace`: show, list or diff persisted trace records
//! - `template`: print one of the built-in graph templates as JSON
//!
//! ## Quick Start
//! ```bash
//! cargo run -- run cognitive_router --input "hello there" --offline
//! ```

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Configuration management
mod config;

/// Collaborators wired for the command line
mod agent;

/// Local capabilities for `execute_capability` nodes
mod capabilities;

// =============================================================================
// IMPORTS
// =============================================================================
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::StreamExt;
use serde_json::Value;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cognigraph::graph::PlanUnit;
use cognigraph::{
    diff_traces, templates, Engine, EventKind, FallbackCoordinator, FileTraceStore, GraphDocument, GraphPipeline,
    NodeStatus, PipelineRequest, StreamEvent, TraceRecord, TraceStore,
};

use crate::agent::Collaborators;
use crate::config::Config;

// =============================================================================
// CLI ARGUMENTS
// =============================================================================
#[derive(Parser, Debug)]
#[command(
    name = "cognigraph",
    version,
    about = "Validate, run and inspect cognitive graph documents",
    long_about = r#"
cognigraph - run declarative reasoning graphs against a local LLM.

A GRAPH argument is either a path to a JSON/YAML graph document or the name
of a built-in template: conversational, plan_act_observe, cognitive_router.

PREREQUISITES (unless --offline):
  1. Install Ollama: https://ollama.ai
  2. Pull a model: ollama pull llama3.2
  3. Start Ollama: ollama serve

EXAMPLES:
  cognigraph validate graphs/agent.yaml
  cognigraph run cognitive_router --input "What is 2 + 2?"
  cognigraph run plan_act_observe --input '{"message": "count my words"}' --offline
  cognigraph trace diff <REQUEST_A> <REQUEST_B>
"#
)]
struct Args {
    /// Verbose output (debug logging)
    #[arg(short = 'v', long = "verbose", global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a graph and print its execution plan
    Validate {
        #[arg(value_name = "GRAPH")]
        graph: String,
    },

    /// Execute a graph, streaming events to stdout
    Run {
        #[arg(value_name = "GRAPH")]
        graph: String,

        /// Request input: JSON, or plain text sent as {"message": ...}
        #[arg(short = 'i', long = "input")]
        input: String,

        /// The Ollama model to use (overrides OLLAMA_MODEL env var)
        #[arg(short = 'm', long = "model", env = "OLLAMA_MODEL")]
        model: Option<String>,

        /// Use the scripted offline model instead of Ollama
        #[arg(long = "offline", default_value = "false")]
        offline: bool,

        /// Print events as JSON lines instead of text
        #[arg(long = "json", default_value = "false")]
        json: bool,

        /// Explicit request id (default: random UUID)
        #[arg(long = "request-id")]
        request_id: Option<String>,
    },

    /// Print a Mermaid flowchart of a graph
    Render {
        #[arg(value_name = "GRAPH")]
        graph: String,
    },

    /// Inspect persisted traces
    Trace {
        #[command(subcommand)]
        command: TraceCommand,
    },

    /// Print a built-in template as a JSON graph document
    Template {
        /// conversational, plan_act_observe or cognitive_router
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum TraceCommand {
    /// List stored request ids
    List {
        /// Only traces of this graph
        #[arg(long = "graph")]
        graph: Option<String>,
    },
    /// Print one trace as JSON
    Show { request_id: String },
    /// Compare two traces, ignoring timing
    Diff { before: String, after: String },
}

// =============================================================================
// MAIN FUNCTION
// =============================================================================
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose)?;

    let config = Config::from_env()?;

    let result = match args.command {
        Command::Validate { graph } => validate(&config, &graph),
        Command::Run {
            graph,
            input,
            model,
            offline,
            json,
            request_id,
        } => {
            let mut config = config;
            if let Some(model) = model {
                info!(model = %model, "Using model from command line");
                config.model = model;
            }
            run(&config, &graph, &input, offline, json, request_id).await
        }
        Command::Render { graph } => render(&config, &graph),
        Command::Trace { command } => trace(&config, command).await,
        Command::Template { name } => template(&config, &name),
    };

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
        eprintln!("\n{} {:#}", "error:".red().bold(), e);
        if e.to_string().contains("connection refused") {
            eprintln!("\nTip: make sure Ollama is running (`ollama serve`), or pass --offline");
        }
    }
    result
}

// =============================================================================
// GRAPH LOADING
// =============================================================================
/// Load a graph document from a file, or build a template by name
fn load_graph(config: &Config, graph: &str) -> Result<GraphDocument> {
    let path = Path::new(graph);
    if path.exists() {
        return GraphDocument::from_path(path).with_context(|| format!("Failed to load {}", graph));
    }
    template_document(graph, config.max_iterations)
        .with_context(|| format!("'{}' is neither a graph file nor a template name", graph))
}

fn template_document(name: &str, max_iterations: u32) -> Option<GraphDocument> {
    match name {
        "conversational" => Some(templates::conversational()),
        "plan_act_observe" => Some(templates::plan_act_observe(max_iterations)),
        "cognitive_router" => Some(templates::cognitive_router(max_iterations)),
        _ => None,
    }
}

/// An engine wired to offline collaborators; enough to validate and render
fn offline_engine(config: &Config) -> Result<Engine> {
    let collaborators = Collaborators::from_config(config, true)?;
    Ok(Engine::new(Arc::new(collaborators.builtins().registry())))
}

fn parse_input(input: &str) -> Value {
    serde_json::from_str(input).unwrap_or_else(|_| serde_json::json!({ "message": input }))
}

fn trace_store(config: &Config) -> FileTraceStore {
    FileTraceStore::new(config.trace_dir.clone(), config.compress_traces)
}

// =============================================================================
// COMMANDS
// =============================================================================
fn validate(config: &Config, graph: &str) -> Result<()> {
    let document = load_graph(config, graph)?;
    let engine = offline_engine(config)?;

    let graph = match engine.validate(&document) {
        Ok(graph) => graph,
        Err(errors) => {
            println!("{} {} ({} problems)", "invalid".red().bold(), document.id, errors.len());
            for error in errors.iter() {
                println!("  - {}", error);
            }
            anyhow::bail!("graph '{}' failed validation", document.id);
        }
    };

    println!("{} {}", "valid".green().bold(), graph.id());
    println!("  nodes: {}, links: {}", graph.nodes().len(), graph.links().len());
    println!("  terminal: {}.{}", graph.terminal().id, graph.output_port());
    println!("  plan:");
    for (i, unit) in graph.plan().units.iter().enumerate() {
        match unit {
            PlanUnit::Node(n) => println!("    {:>2}. {}", i + 1, graph.node(*n).id),
            PlanUnit::Loop(g) => {
                let group = graph.loop_group(*g);
                let body: Vec<&str> = group.members.iter().map(|&m| graph.node(m).id.as_str()).collect();
                println!(
                    "    {:>2}. loop {} [{}] max {}",
                    i + 1,
                    group.id,
                    body.join(" -> "),
                    group.max_iterations
                );
            }
        }
    }
    Ok(())
}

async fn run(
    config: &Config,
    graph: &str,
    input: &str,
    offline: bool,
    json: bool,
    request_id: Option<String>,
) -> Result<()> {
    config.validate()?;
    let document = load_graph(config, graph)?;
    let collaborators = Collaborators::from_config(config, offline)?;

    info!(
        graph = %document.id,
        model = %collaborators.model.name(),
        trace_dir = %config.trace_dir.display(),
        "Configuration loaded"
    );

    let store: Arc<dyn TraceStore> = Arc::new(trace_store(config));
    let engine = Engine::new(Arc::new(collaborators.builtins().registry())).with_config(config.engine_config());
    let coordinator = FallbackCoordinator::new(
        Arc::new(GraphPipeline::new(engine, document)),
        Arc::new(collaborators.legacy_pipeline(config)),
    )
    .with_audit(collaborators.audit.clone())
    .with_fallback_timeout(config.fallback_timeout)
    .with_trace_store(store);

    let mut request = PipelineRequest::new(parse_input(input));
    if let Some(request_id) = request_id {
        request = request.with_request_id(request_id);
    }
    let request_id = request.request_id.clone();

    let started = Instant::now();
    let mut events = coordinator.run(request);
    let mut outcome = None;
    while let Some(event) = events.next().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
        if event.kind.is_terminal() {
            outcome = Some(event.kind);
        }
    }
    let (_, trace) = events.finish().await?;

    if !json {
        println!(
            "\n{} {} in {:.1?} (trace {})",
            "request".dimmed(),
            request_id,
            started.elapsed(),
            trace.outcome
        );
    }
    match outcome {
        Some(EventKind::GraphFailed { error }) => anyhow::bail!("request failed: {}", error),
        Some(EventKind::GraphCancelled { reason }) => anyhow::bail!("request cancelled: {}", reason),
        _ => Ok(()),
    }
}

fn print_event(event: &StreamEvent) {
    match &event.kind {
        EventKind::NodeStarted { node_id, iteration } => match iteration {
            Some(pass) => println!("{} {} (pass {})", "▶".cyan(), node_id.bold(), pass),
            None => println!("{} {}", "▶".cyan(), node_id.bold()),
        },
        EventKind::NodeToken { chunk, .. } => {
            print!("{}", chunk.dimmed());
        }
        EventKind::NodeFinished { node_id, result } => {
            let status = match result.status {
                NodeStatus::Success => "ok".green(),
                NodeStatus::Error => "error".red(),
                NodeStatus::Skipped => "skipped".yellow(),
            };
            match &result.error {
                Some(error) => println!("{} {} {} {}", "■".cyan(), node_id, status, error),
                None => println!("{} {} {} ({} ms)", "■".cyan(), node_id, status, result.duration_ms),
            }
        }
        EventKind::LoopCapReached { group_id, iterations } => {
            println!("{} loop {} stopped at {} passes", "!".yellow(), group_id, iterations);
        }
        EventKind::GraphFallback { reason } => {
            println!("{} falling back: {}", "!".yellow().bold(), reason);
        }
        EventKind::GraphCompleted { final_output, fallback } => {
            let label = if *fallback { "ANSWER (fallback)" } else { "ANSWER" };
            println!("\n{}", "=".repeat(60));
            println!("{}", label.bold());
            println!("{}\n", "=".repeat(60));
            match final_output {
                Value::String(text) => println!("{}", text),
                other => println!("{}", serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())),
            }
        }
        EventKind::GraphFailed { error } => println!("{} {}", "failed:".red().bold(), error),
        EventKind::GraphCancelled { reason } => println!("{} {}", "cancelled:".yellow().bold(), reason),
    }
}

fn render(config: &Config, graph: &str) -> Result<()> {
    let document = load_graph(config, graph)?;
    let graph = offline_engine(config)?
        .validate(&document)
        .with_context(|| format!("graph '{}' failed validation", document.id))?;
    println!("{}", graph.to_mermaid());
    Ok(())
}

async fn trace(config: &Config, command: TraceCommand) -> Result<()> {
    let store = trace_store(config);
    match command {
        TraceCommand::List { graph: Some(graph) } => {
            for trace in store.list_for_graph(&graph).await? {
                println!("{}  {}  {}", trace.started_at.to_rfc3339(), trace.request_id, trace.outcome);
            }
        }
        TraceCommand::List { graph: None } => {
            for request_id in store.list().await? {
                println!("{}", request_id);
            }
        }
        TraceCommand::Show { request_id } => {
            let trace = load_trace(&store, &request_id).await?;
            println!("{}", serde_json::to_string_pretty(&trace)?);
        }
        TraceCommand::Diff { before, after } => {
            let a = load_trace(&store, &before).await?;
            let b = load_trace(&store, &after).await?;
            print!("{}", diff_traces(&a, &b));
        }
    }
    Ok(())
}

async fn load_trace(store: &FileTraceStore, request_id: &str) -> Result<TraceRecord> {
    store
        .load(request_id)
        .await?
        .with_context(|| format!("no trace for request '{}' in {}", request_id, store.dir().display()))
}

fn template(config: &Config, name: &str) -> Result<()> {
    let document = template_document(name, config.max_iterations)
        .with_context(|| format!("unknown template '{}'", name))?;
    println!("{}", document.to_json_pretty()?);
    Ok(())
}

// =============================================================================
// LOGGING INITIALIZATION
// =============================================================================
/// Initialize the tracing subscriber. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    Ok(())
}
