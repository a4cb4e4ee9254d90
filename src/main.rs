use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sift_core::config::AppConfig;
use sift_core::event::EventBus;
use sift_core::mailbox::MailboxSnapshot;
use sift_core::types::{EngineEvent, RunStatus};

use sift_engine::{Orchestrator, PendingPlan, RunOutcome, RunRequest, StrategyRegistry};

#[derive(Parser)]
#[command(name = "sift", version, about = "Plan and run questions over your personal data")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sift.toml")]
    config: PathBuf,

    /// Mailbox snapshot (JSON items and threads)
    #[arg(short, long, default_value = "mailbox.json")]
    mailbox: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the validated plan for a request without running it
    Plan {
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Run a request end to end
    Run {
        /// Skip the confirmation prompt for expensive plans
        #[arg(long, short = 'y')]
        yes: bool,
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sift=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Plan { query } => {
            let (orchestrator, _) = build(&config, &cli.mailbox)?;
            let request = RunRequest::new(query_text(query));
            let decomposition = orchestrator.plan(&request).await?;
            eprintln!("[planned in {} attempt(s), {} tokens]", decomposition.attempts, decomposition.tokens_used);
            println!("{}", serde_json::to_string_pretty(&decomposition.graph)?);
        }
        Commands::Run { yes, query } => {
            let (orchestrator, events) = build(&config, &cli.mailbox)?;
            run_once(&orchestrator, &events, query_text(query), yes).await?;
        }
    }

    Ok(())
}

fn build(config: &AppConfig, mailbox: &Path) -> anyhow::Result<(Orchestrator, Arc<EventBus>)> {
    let snapshot = MailboxSnapshot::load(mailbox)
        .with_context(|| format!("loading mailbox {}", mailbox.display()))?;
    let model = sift_llm::create_from_config(config);
    let events = Arc::new(EventBus::default());
    let orchestrator = Orchestrator::new(
        config,
        model,
        Arc::new(snapshot),
        StrategyRegistry::with_builtins(),
        events.clone(),
    );
    info!(
        model = %config.model.model_id,
        operations = orchestrator.registry().tags().len(),
        "Engine ready"
    );
    Ok((orchestrator, events))
}

/// Query from the arguments, or stdin when none were given.
fn query_text(args: Vec<String>) -> String {
    let text = args.join(" ");
    if !text.is_empty() {
        return text;
    }
    io::stdin()
        .lock()
        .lines()
        .map_while(|l| l.ok())
        .collect::<Vec<_>>()
        .join("\n")
}

async fn run_once(
    orchestrator: &Orchestrator,
    events: &EventBus,
    query: String,
    yes: bool,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel_clone.cancel();
    });

    let mut request = RunRequest::new(query);
    if yes {
        request = request.confirmed();
    }
    let printer = events.watch_run(print_event);
    let mut outcome = orchestrator.run_with_cancel(request, cancel.clone()).await;
    printer.await.ok();

    if outcome.status == RunStatus::AwaitingConfirmation {
        if let Some(plan) = outcome.plan.clone() {
            if ask_confirmation(&outcome, &plan).await {
                let printer = events.watch_run(print_event);
                outcome = orchestrator
                    .run_with_cancel(RunRequest::new(plan.query.clone()).confirm(plan), cancel)
                    .await;
                printer.await.ok();
            }
        }
    }

    match outcome.status {
        RunStatus::Done => {
            println!("{}", outcome.message.unwrap_or_default());
            Ok(())
        }
        RunStatus::AwaitingConfirmation => {
            eprintln!("Not run.");
            Ok(())
        }
        RunStatus::Aborted => {
            let error = outcome
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            anyhow::bail!("run aborted: {}", error)
        }
    }
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::PlanReady { nodes, est_tokens, .. } => {
            eprintln!("[plan: {} node(s), ~{} tokens]", nodes, est_tokens);
        }
        EngineEvent::ConfirmationRequired { plan_id, .. } => {
            eprintln!("[confirmation required: {}]", plan_id);
        }
        EngineEvent::StageStarted { stage, nodes, .. } => {
            eprintln!("[stage {}: {}]", stage, nodes.join(", "));
        }
        EngineEvent::NodeFinished {
            node_id,
            status,
            elapsed_ms,
            ..
        } => {
            eprintln!("[{}: {} in {}ms]", node_id, status, elapsed_ms);
        }
        EngineEvent::RunFinished { total_tokens, .. } => {
            eprintln!("[done: {} tokens]", total_tokens);
        }
    }
}

async fn ask_confirmation(outcome: &RunOutcome, plan: &PendingPlan) -> bool {
    eprintln!(
        "\n{}\n[plan {}: {} node(s)]",
        outcome.message.as_deref().unwrap_or("This plan needs confirmation."),
        plan.id,
        plan.graph.nodes.len()
    );
    tokio::task::spawn_blocking(|| {
        dialoguer::Confirm::new()
            .with_prompt("Proceed?")
            .default(false)
            .interact()
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false)
}
