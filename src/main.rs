//! tasktree - command line entry point.
//!
//! Runs goals against a scripted provider and replays recorded traces.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tasktree::provider::scripted::Script;
use tasktree::provider::ScriptedProvider;
use tasktree::trace::{read_jsonl, replay, JsonlTraceSink, SqliteTraceSink, TraceSink};
use tasktree::{Engine, EngineConfig, ProviderSet, RunRequest};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Recursive task decomposition engine
#[derive(Parser, Debug)]
#[command(name = "tasktree")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a goal against a scripted provider
    Run {
        /// JSON script with classify/plan/results/verify answers keyed by goal
        #[arg(long, value_name = "PATH")]
        script: PathBuf,

        /// JSON engine configuration (defaults to TASKTREE_* environment variables)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Write the execution trace as JSON Lines
        #[arg(long, value_name = "PATH", conflicts_with = "trace_db")]
        trace: Option<PathBuf>,

        /// Write the execution trace to a SQLite database
        #[arg(long = "trace-db", value_name = "PATH")]
        trace_db: Option<PathBuf>,

        /// Background line passed to every provider call (repeatable)
        #[arg(long = "context", value_name = "LINE")]
        context: Vec<String>,

        /// The goal to accomplish
        goal: String,
    },

    /// Replay a JSON Lines trace and print the final node states
    Replay {
        #[arg(value_name = "TRACE")]
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasktree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Run {
            script,
            config,
            trace,
            trace_db,
            context,
            goal,
        } => run(script, config, trace, trace_db, context, goal).await,
        Command::Replay { path } => replay_trace(path).await,
    }
}

async fn run(
    script: PathBuf,
    config: Option<PathBuf>,
    trace: Option<PathBuf>,
    trace_db: Option<PathBuf>,
    context: Vec<String>,
    goal: String,
) -> anyhow::Result<()> {
    let config = match &config {
        Some(path) => EngineConfig::load_file(path)
            .await
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::from_env()?,
    };
    info!(
        "Loaded configuration: max_depth={} max_attempts={} concurrency={} policy={:?}",
        config.max_depth, config.max_attempts, config.concurrency_limit, config.partial_success_policy
    );

    let text = tokio::fs::read_to_string(&script)
        .await
        .with_context(|| format!("reading script {}", script.display()))?;
    let script = Script::from_json(&text).context("parsing script")?;
    let provider = Arc::new(ScriptedProvider::from_script("script", script));

    let sink: Option<Arc<dyn TraceSink>> = match (trace, trace_db) {
        (Some(path), _) => Some(Arc::new(JsonlTraceSink::create(&path).await?)),
        (None, Some(path)) => Some(Arc::new(SqliteTraceSink::open(&path).await?)),
        (None, None) => None,
    };

    let mut engine = Engine::new(config, ProviderSet::uniform(provider))?;
    if let Some(sink) = sink {
        engine = engine.with_trace_sink(sink);
    }

    let request = context
        .into_iter()
        .fold(RunRequest::new(goal), |request, line| request.with_context(line));
    let mut handle = engine.submit(request)?;

    if let Some(mut progress) = handle.progress() {
        tokio::spawn(async move {
            loop {
                match progress.recv().await {
                    Ok(event) => info!(
                        "[{}] {} (attempt {}): {}",
                        event.node_id, event.state, event.attempt, event.summary
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Progress stream lagged, {} events skipped", n)
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let cancel = handle.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling run");
            cancel.cancel();
        }
    });

    let outcome = handle.wait().await?;
    info!(
        "Run {} finished in {:?} with {} nodes",
        outcome.root_id,
        outcome.elapsed,
        outcome.tree.len()
    );
    match outcome.result {
        Ok(output) => {
            println!("{}", output.content);
            Ok(())
        }
        Err(failure) => Err(anyhow::anyhow!("run failed: {}", failure)),
    }
}

async fn replay_trace(path: PathBuf) -> anyhow::Result<()> {
    let events = read_jsonl(&path)
        .await
        .with_context(|| format!("reading trace {}", path.display()))?;
    let states = replay(&events)?;
    info!("Replayed {} events over {} nodes", events.len(), states.len());
    for (node, state) in states {
        println!("{}\t{}", node, state);
    }
    Ok(())
}
