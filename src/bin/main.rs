use clap::{Parser, Subcommand};
use research_orchestrator::{
    context::{AdminCommand, AdminReply, AppContext},
    config::ResearchConfig,
    ResearchOutcome,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "research", about = "Iterative financial research over external data providers")]
struct Cli {
    /// Language model for planning and synthesis, overriding GEMINI_MODEL
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new research session
    Ask {
        /// The research question
        #[arg(required = true)]
        query: Vec<String>,
    },
    /// Continue an interrupted session
    Resume { session_id: Uuid },
    /// List recent sessions
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Inspect or purge the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    Stats,
    Clean,
    Clear,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ResearchConfig::from_env()?;
    let context = AppContext::open(config).await?;

    let result = match cli.model {
        Some(model) => match context.admin(AdminCommand::SwitchModel(model)).await {
            Ok(reply) => {
                print_reply(reply);
                dispatch(&context, cli.command).await
            }
            Err(e) => Err(e.into()),
        },
        None => dispatch(&context, cli.command).await,
    };
    context.close().await?;
    result
}

async fn dispatch(context: &AppContext, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Ask { query } => {
            let query = query.join(" ");
            let cancel = interrupt_on_ctrl_c();
            let outcome = context.reflector().start(&query, &cancel).await?;
            print_outcome(&outcome);
        }
        Command::Resume { session_id } => {
            let cancel = interrupt_on_ctrl_c();
            let outcome = context.reflector().resume(session_id, &cancel).await?;
            print_outcome(&outcome);
        }
        Command::Sessions { limit } => {
            print_reply(context.admin(AdminCommand::ListSessions { limit }).await?);
        }
        Command::Cache { action } => {
            let command = match action {
                CacheAction::Stats => AdminCommand::CacheStats,
                CacheAction::Clean => AdminCommand::CacheClean,
                CacheAction::Clear => AdminCommand::CacheClear,
            };
            print_reply(context.admin(command).await?);
        }
    }
    Ok(())
}

/// First Ctrl-C cancels the loop; it stops at the next phase boundary.
fn interrupt_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current phase");
            token.cancel();
        }
    });
    cancel
}

fn print_outcome(outcome: &ResearchOutcome) {
    info!(
        session_id = %outcome.session_id,
        status = %outcome.status,
        "research finished"
    );

    println!("\n=== RESEARCH RESULT ===");
    println!("Session: {}", outcome.session_id);
    println!("Status: {}", outcome.status);
    println!(
        "Budget: {}/{} steps, ${:.4}/${:.4}",
        outcome.budget.steps_used,
        outcome.budget.max_steps,
        outcome.budget.cost_used_usd,
        outcome.budget.max_cost_usd
    );
    println!("\n{}", outcome.answer);

    println!("\nReasoning Trace:");
    for (i, trace) in outcome.reasoning_trace.iter().enumerate() {
        println!("  {}: {}", i + 1, trace);
    }
}

fn print_reply(reply: AdminReply) {
    match reply {
        AdminReply::Sessions { sessions } => {
            if sessions.is_empty() {
                println!("No sessions yet.");
            }
            for session in sessions {
                println!(
                    "{}  {:<9}  {}  {}",
                    session.id,
                    session.status.as_str(),
                    session.updated_at.format("%Y-%m-%d %H:%M"),
                    session.query
                );
            }
        }
        AdminReply::CacheStats { stats } => {
            println!(
                "Cache entries: {} total, {} valid, {} expired, {} corrupt (~{} bytes)",
                stats.total, stats.valid, stats.expired, stats.corrupt, stats.approx_size_bytes
            );
        }
        AdminReply::CachePurged { removed } => println!("Removed {} cache entries", removed),
        AdminReply::ModelSwitched { previous, current } => {
            println!("Model switched: {} -> {}", previous, current)
        }
    }
}
