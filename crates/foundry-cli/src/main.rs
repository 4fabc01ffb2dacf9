use anyhow::{Result, anyhow};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use foundry_core::normalizer::NormalizedResponse;
use foundry_core::usage::{UsageLog, UsageReport, format_usage_report};
use foundry_core::{Priority, RouteRequest, Router, RoutingResult};

mod config;

#[derive(Parser)]
#[command(name = "foundry")]
#[command(version)]
#[command(about = "Foundry: multi-provider LLM router for the agent factory")]
struct Cli {
    /// Path to routing config (TOML, or YAML with a .yaml/.yml extension)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a one-shot prompt through the routing chain
    Ask {
        /// The prompt to send
        prompt: String,
        /// Task class selecting the chain (light, general, coding, high_precision)
        #[arg(short, long, default_value = "general")]
        task_class: String,
        /// normal, high or critical
        #[arg(short, long, default_value = "normal")]
        priority: Priority,
        /// Agent whose system prompt to use and to log the call under
        #[arg(short, long)]
        agent: Option<String>,
        /// System prompt (overrides the agent's)
        #[arg(short, long)]
        system: Option<String>,
        /// Require a structured reply and normalize it
        #[arg(long)]
        structured: bool,
        /// Print the full routing result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactive chat session with history
    Chat {
        /// Session id to use (a fresh one by default)
        #[arg(long)]
        session: Option<String>,
        #[arg(short, long)]
        agent: Option<String>,
        #[arg(short, long)]
        task_class: Option<String>,
    },

    /// Show providers, availability and budget
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Show the routing chain for a task class
    Chain {
        task_class: String,
    },

    /// Show budget limits and spend
    Budget,

    /// Summarize the usage log
    Report {
        /// Only the last N days
        #[arg(long, conflicts_with = "today")]
        days: Option<i64>,
        /// Only today (UTC)
        #[arg(long)]
        today: bool,
        #[arg(long)]
        json: bool,
    },

    /// Write the default routing config
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Ask {
            prompt,
            task_class,
            priority,
            agent,
            system,
            structured,
            json,
        } => {
            cmd_ask(
                &cli.config,
                AskArgs {
                    prompt,
                    task_class,
                    priority,
                    agent,
                    system,
                    structured,
                    json,
                },
            )
            .await
        }
        Commands::Chat {
            session,
            agent,
            task_class,
        } => cmd_chat(&cli.config, session, agent, task_class).await,
        Commands::Status { json } => cmd_status(&cli.config, json).await,
        Commands::Chain { task_class } => cmd_chain(&cli.config, &task_class),
        Commands::Budget => cmd_budget(&cli.config),
        Commands::Report { days, today, json } => cmd_report(&cli.config, days, today, json).await,
        Commands::Init { force } => cmd_init(&cli.config, force).await,
    }
}

struct AskArgs {
    prompt: String,
    task_class: String,
    priority: Priority,
    agent: Option<String>,
    system: Option<String>,
    structured: bool,
    json: bool,
}

/// Run `fut` until it finishes or Ctrl+C arrives. `None` means cancelled.
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling...");
            token.cancel();
        }
    });
    cancel
}

async fn cmd_ask(config_path: &Option<PathBuf>, args: AskArgs) -> Result<()> {
    let router = config::build_router(config_path)?;

    let system = match (&args.system, &args.agent) {
        (Some(system), _) => Some(system.clone()),
        (None, Some(agent)) => match router.agents().system_prompt(agent).await {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!("Could not load system prompt for agent {}: {}", agent, e);
                None
            }
        },
        (None, None) => None,
    };

    let mut request = RouteRequest::from_prompt(&args.task_class, &args.prompt, system.as_deref())
        .with_priority(args.priority)
        .structured(args.structured);
    if let Some(agent) = &args.agent {
        request = request.with_agent(agent);
    }

    let cancel = cancel_on_ctrl_c();
    let Some(result) = until_cancelled(&cancel, router.route(request)).await else {
        return Err(anyhow!("cancelled"));
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    match result.error {
        Some(error) => Err(anyhow!(error)),
        None => Ok(()),
    }
}

async fn cmd_chat(
    config_path: &Option<PathBuf>,
    session: Option<String>,
    agent: Option<String>,
    task_class: Option<String>,
) -> Result<()> {
    let router = config::build_router(config_path)?;
    let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let agent = agent.or_else(|| router.snapshot().config.agents.default_agent.clone());

    let agent_task_class = match &agent {
        Some(id) => match router.agents().get_agent(id).await {
            Ok(profile) => profile.task_class,
            Err(e) => {
                warn!("Agent {}: {}", id, e);
                None
            }
        },
        None => None,
    };
    let task_class = task_class
        .or(agent_task_class)
        .unwrap_or_else(|| "general".to_string());

    println!(
        "Session {} (agent: {}, task class: {})",
        session_id,
        agent.as_deref().unwrap_or("none"),
        task_class
    );
    println!("Commands: /clear, /status, /budget, /exit\n");

    let cancel = cancel_on_ctrl_c();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = until_cancelled(&cancel, lines.next_line()).await else {
            break;
        };
        let Some(line) = line? else {
            break;
        };

        match line.trim() {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                router.sessions().clear_session(&session_id).await;
                println!("Session cleared.");
            }
            "/status" => print_status(&router).await,
            "/budget" => print_budget(&router),
            message => {
                let chat = router.route_chat(&session_id, message, None, &task_class, agent.as_deref());
                let Some(result) = until_cancelled(&cancel, chat).await else {
                    break;
                };
                print_result(&result);
            }
        }
    }

    println!("\nBye.");
    Ok(())
}

async fn cmd_status(config_path: &Option<PathBuf>, json: bool) -> Result<()> {
    let router = config::build_router(config_path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&router.router_status().await)?);
    } else {
        print_status(&router).await;
    }
    Ok(())
}

fn cmd_chain(config_path: &Option<PathBuf>, task_class: &str) -> Result<()> {
    let router = config::build_router(config_path)?;
    let snapshot = router.snapshot();

    println!("Routing chain for '{}':", task_class);
    for (i, name) in router.routing_chain(task_class).iter().enumerate() {
        match snapshot.registry.resolve(name) {
            Some(p) => println!("  {}. {} ({}, {}, {})", i + 1, name, p.model, p.tier, p.format),
            None => println!("  {}. {} (unknown, skipped)", i + 1, name),
        }
    }
    Ok(())
}

fn cmd_budget(config_path: &Option<PathBuf>) -> Result<()> {
    let router = config::build_router(config_path)?;
    print_budget(&router);
    Ok(())
}

async fn cmd_report(
    config_path: &Option<PathBuf>,
    days: Option<i64>,
    today: bool,
    json: bool,
) -> Result<()> {
    let path = config::resolve_path(config_path);
    let (routing, _) = foundry_core::ConfigSource::file(&path).load()?;
    let log = UsageLog::new(routing.usage.resolved_path());

    let now = Utc::now();
    let (since, period) = if today {
        let midnight = now.date_naive().and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        (midnight, "today".to_string())
    } else if let Some(days) = days.filter(|d| *d > 0) {
        (Some(now - ChronoDuration::days(days)), format!("last {} days", days))
    } else {
        (None, "all time".to_string())
    };

    let records = log.read(since).await?;
    let report = UsageReport::from_records(&records);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_usage_report(&report, &period));
    }
    Ok(())
}

async fn cmd_init(config_path: &Option<PathBuf>, force: bool) -> Result<()> {
    let path = config::resolve_path(config_path);
    let written = config::write_default_config(&path, force)?;

    let base = config::config_dir();
    for dir in [base.join("agents"), base.join("logs")] {
        tokio::fs::create_dir_all(&dir).await?;
    }

    if written {
        println!("Foundry initialized at {}", path.display());
    }
    println!("Export provider keys (e.g. GROQ_API_KEY, GEMINI_API_KEY) to enable providers.");
    Ok(())
}

fn print_result(result: &RoutingResult) {
    if let Some(error) = &result.error {
        eprintln!("error: {}", error);
        eprintln!(
            "[failed after {} retries, {} failovers{}]",
            result.retries,
            result.failover_count,
            if result.escalated { ", escalated" } else { "" }
        );
        return;
    }

    match &result.normalized {
        Some(normalized) if normalized.valid => print_normalized(normalized),
        _ => println!("{}", result.reply),
    }
    eprintln!(
        "[{}/{} {} {}ms, {} failovers{}]",
        result.provider.as_deref().unwrap_or("?"),
        result.model.as_deref().unwrap_or("?"),
        result.tier.map(|t| t.to_string()).unwrap_or_default(),
        result.latency_ms,
        result.failover_count,
        if result.escalated { ", escalated" } else { "" }
    );
    if let Some(n) = result.normalized.as_ref().filter(|n| !n.valid) {
        eprintln!("[unstructured reply: {}]", n.violations.join("; "));
    }
}

fn print_normalized(n: &NormalizedResponse) {
    println!("# {}\n", n.title);
    println!("{}\n", n.summary);
    if !n.steps.is_empty() {
        println!("## Steps");
        for s in &n.steps {
            if s.details.is_empty() {
                println!("{}. {}", s.step, s.action);
            } else {
                println!("{}. {} - {}", s.step, s.action, s.details);
            }
        }
        println!();
    }
    if !n.artifacts.is_empty() {
        println!("## Artifacts");
        for a in &n.artifacts {
            println!("- [{}] {}", a.kind, a.path);
        }
        println!();
    }
    if !n.risks.is_empty() {
        println!("## Risks");
        for r in &n.risks {
            println!("- {} (mitigation: {})", r.risk, r.mitigation);
        }
        println!();
    }
    if !n.next.is_empty() {
        println!("## Next");
        for item in &n.next {
            println!("- {}", item);
        }
    }
}

async fn print_status(router: &Router) {
    let status = router.router_status().await;
    println!(
        "Config: {} ({})",
        status
            .config_path
            .as_ref()
            .map_or_else(|| "built-in defaults".to_string(), |p| p.display().to_string()),
        if status.config_loaded { "loaded" } else { "defaults" }
    );
    println!("Active sessions: {}\n", status.active_sessions);
    println!("{:<20} {:<10} {:<10} {:<8} {:<10} MODEL", "PROVIDER", "TIER", "FORMAT", "KEY", "STATE");
    for p in &status.providers {
        let state = match (p.available, p.cooldown_remaining_secs) {
            (true, _) => "ready".to_string(),
            (false, Some(secs)) => format!("cool {}s", secs),
            (false, None) => "no key".to_string(),
        };
        println!(
            "{:<20} {:<10} {:<10} {:<8} {:<10} {}",
            p.name,
            p.tier,
            p.format,
            if p.key_set { "set" } else { "missing" },
            state,
            p.model
        );
    }
    println!();
    print_budget(router);
}

fn print_budget(router: &Router) {
    let b = router.budget_status();
    println!("Budget (this process):");
    println!("  daily:   ${:.4} / ${:.2}", b.daily_spent, b.daily_limit);
    println!("  monthly: ${:.4} / ${:.2}", b.monthly_spent, b.monthly_limit);
}
