use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use loomcore::{
    Edge, EdgeCondition, EngineError, ExecutionEvent, ExecutionStatus, NodeEvent, NodeSpec,
    UiInteractionSession, WorkflowGraph,
};
use loomruntime::{EngineConfig, WorkflowCatalog, WorkflowEngine};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loom")]
#[command(about = "Loom workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file, answering interactions from stdin
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Trigger context as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// User the execution runs as
        #[arg(short, long, default_value = "cli")]
        user: String,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            user,
            verbose,
        } => {
            let default = if verbose { "debug" } else { "warn" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
                )
                .init();
            run_workflow(&file, input.as_deref(), &user).await?;
        }
        Commands::Validate { file } => validate_workflow(&file)?,
        Commands::Nodes => list_nodes(),
        Commands::Init { output } => create_example_workflow(&output)?,
    }

    Ok(())
}

fn engine() -> (WorkflowEngine, Arc<WorkflowCatalog>) {
    let catalog = Arc::new(WorkflowCatalog::new());
    let engine = WorkflowEngine::builder()
        .config(EngineConfig::from_env())
        .registry(Arc::new(loomnodes::builtin_registry()))
        .workflows(catalog.clone())
        .build();
    (engine, catalog)
}

fn load_workflow(file: &Path) -> Result<WorkflowGraph> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a workflow", file.display()))
}

fn parse_object(text: &str) -> Result<HashMap<String, Value>> {
    match serde_json::from_str(text)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => bail!("expected a JSON object"),
    }
}

async fn run_workflow(file: &Path, input: Option<&str>, user: &str) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = load_workflow(file)?;
    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!();

    let trigger_context = match input {
        Some(text) => parse_object(text).context("input must be a JSON object")?,
        None => HashMap::new(),
    };

    let (engine, catalog) = engine();
    let workflow_id = catalog.register_workflow(workflow).await;

    let mut events = engine.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    let id = engine
        .start_execution(workflow_id, trigger_context, user)
        .await?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let exec = loop {
        let exec = engine
            .wait_for(id, |s| s == ExecutionStatus::WaitingForInput)
            .await?;
        if exec.is_terminal() {
            break exec;
        }
        for session in engine.list_interactions_for_execution(id).await? {
            if session.is_pending() {
                answer(&engine, &session, user, &mut stdin).await?;
            }
        }
    };

    // Let the event printer drain
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let stats = engine.get_statistics(id).await?;
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", id);
    println!("   Status: {:?}", exec.status);
    println!("   Nodes: {:?}", stats.nodes_by_status);
    println!("   Elapsed: {:?}ms", stats.elapsed_ms);
    if let Some((node_id, ms)) = &stats.slowest_node {
        println!("   Slowest node: {} ({}ms)", node_id, ms);
    }

    let mut outputs: Vec<_> = engine.get_all_outputs(id).await?.into_iter().collect();
    outputs.sort_by(|a, b| a.0.cmp(&b.0));
    if !outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (node_id, contract) in outputs {
            println!("   Node {} ({:?}):", node_id, contract.source);
            for (key, value) in &contract.data {
                println!("     {}: {}", key, value);
            }
        }
    }

    if exec.status != ExecutionStatus::Completed {
        bail!("execution finished as {:?}", exec.status);
    }
    Ok(())
}

/// Prompt for one interaction until it is answered. An empty line cancels.
async fn answer(
    engine: &WorkflowEngine,
    session: &UiInteractionSession,
    user: &str,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> Result<()> {
    println!();
    println!("✋ {} (node {})", session.title, session.node_id);
    if let Some(description) = &session.description {
        println!("   {}", description);
    }
    println!("   Context: {}", session.context);
    if !session.input_schema.is_null() {
        println!("   Schema: {}", session.input_schema);
    }

    loop {
        println!("   Enter a JSON object (empty line cancels):");
        let Some(line) = stdin.next_line().await? else {
            engine
                .cancel_interaction(session.id, user, "stdin closed")
                .await?;
            return Ok(());
        };
        if line.trim().is_empty() {
            engine
                .cancel_interaction(session.id, user, "cancelled from the CLI")
                .await?;
            return Ok(());
        }

        let data = match parse_object(&line) {
            Ok(data) => data,
            Err(e) => {
                println!("   ⚠️  {}", e);
                continue;
            }
        };
        match engine.submit_interaction(session.id, data, user).await {
            Ok(_) => return Ok(()),
            Err(e @ EngineError::InvalidSubmission { .. }) => println!("   ⚠️  {}", e),
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::ExecutionStarted { triggered_by, .. } => {
            println!("▶️  Execution started by {}", triggered_by);
        }
        ExecutionEvent::ExecutionStatusChanged { status, .. } => {
            println!("   Status: {:?}", status);
        }
        ExecutionEvent::NodeStarted {
            node_id,
            node_type,
            attempt,
            ..
        } => {
            println!("  ⚡ Starting node: {} ({}, attempt {})", node_id, node_type, attempt);
        }
        ExecutionEvent::NodeCompleted {
            node_id,
            duration_ms,
            ..
        } => {
            println!("  ✅ Node {} completed in {}ms", node_id, duration_ms);
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {} failed: {}", node_id, error);
        }
        ExecutionEvent::NodeSkipped { node_id, reason, .. } => {
            println!("  ⏭️  Node {} skipped: {}", node_id, reason);
        }
        ExecutionEvent::NodeWaitingForInput {
            node_id, assignee, ..
        } => {
            println!("  ⏸️  Node {} waiting for input from {}", node_id, assignee);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => println!("     ℹ️  [{}] {}", node_id, message),
            NodeEvent::Warning { message } => println!("     ⚠️  [{}] {}", node_id, message),
            NodeEvent::Progress { percent, message } => match message {
                Some(msg) => println!("     📊 [{}] {}% - {}", node_id, percent, msg),
                None => println!("     📊 [{}] {}%", node_id, percent),
            },
            NodeEvent::Data { .. } => {}
        },
    }
}

fn validate_workflow(file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());
    let workflow = load_workflow(file)?;

    let (engine, _) = engine();
    let graph = engine.validate_workflow(&workflow)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!("   Entry nodes: {}", graph.entry_nodes().join(", "));
    println!("   Order: {}", graph.topological_order().join(" -> "));
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = loomnodes::builtin_registry();
    for node_type in registry.list_node_types() {
        match registry.get_metadata(&node_type) {
            Some(metadata) => {
                println!("  • {} ({})", node_type, metadata.category);
                println!("    {}", metadata.description);
            }
            None => println!("  • {}", node_type),
        }
    }
    println!("  • {} (engine)", loomcore::UI_INTERACTION_NODE_TYPE);
    println!("    Suspends until a user submits data");
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = WorkflowGraph::new("Example approval workflow");
    workflow.description = Some("Fetches data, asks for approval and logs the result".to_string());

    workflow.add_node(
        NodeSpec::new("fetch", "http.request")
            .with_name("Fetch Data")
            .with_config("method", "GET"),
    );
    workflow.add_node(
        NodeSpec::interaction("approve", "Approve the response?")
            .with_config("input_schema", json!({"required": ["approved"]}))
            .with_config("on_cancel", "skip")
            .with_default_output("approved", false),
    );
    workflow.add_node(NodeSpec::new("log", "debug.log").with_name("Log Response"));

    workflow.connect("fetch", "approve");
    workflow.add_edge(
        Edge::new("approve", "log").when(EdgeCondition::Truthy {
                key: "approved".to_string(),
            }),
    );

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  loom run --file {} --input '{{\"url\": \"https://api.github.com/zen\"}}'",
        output.display()
    );
    Ok(())
}
