// cmdgate - Main Entry Point
//
// Operator CLI for the admission engine:
// - Evaluate a command invocation against the configured policies
// - Grant and revoke premium entitlements
// - Inspect per-user usage windows and recent decisions
// - Serve Prometheus metrics

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use cmdgate::admission::engine::format_window;
use cmdgate::admission::{AnalyticsWorker, TierLimit, TierRule};
use cmdgate::config::Config;
use cmdgate::{build_engine, load_policies, metrics, metrics_server};
use serde_json::json;
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

/// cmdgate: tiered command admission control
#[derive(Parser, Debug)]
#[command(name = "cmdgate")]
#[command(author = "cmdgate Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Tiered usage limits and premium entitlements for chat commands", long_about = None)]
struct Args {
    /// Configuration file (defaults to ~/.config/cmdgate/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decide whether a user may run a command now
    Evaluate {
        /// User identifier
        #[arg(long)]
        user: String,

        /// Command name (a leading / or ! is ignored)
        #[arg(long)]
        command: String,

        /// Group or channel the command was issued in
        #[arg(long)]
        group: Option<String>,
    },
    /// Grant premium to a user
    Grant {
        #[arg(long)]
        user: String,

        /// Expire after this many days (never expires when omitted)
        #[arg(long)]
        days: Option<i64>,
    },
    /// Revoke premium from a user
    Revoke {
        #[arg(long)]
        user: String,
    },
    /// Show premium status and usage windows for a user
    Status {
        #[arg(long)]
        user: String,
    },
    /// List the loaded command policies
    Policies,
    /// Show recent admission decisions
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Serve /metrics and /health over HTTP
    ServeMetrics {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(&config, args.verbose)?;
    if config.metrics.enabled {
        metrics::init();
    }
    debug!("cmdgate v0.1.0 starting");

    match args.command {
        Commands::Evaluate {
            user,
            command,
            group,
        } => {
            let (engine, worker) = build_engine(&config)?;
            let decision = engine.evaluate(&user, &command, group.as_deref()).await?;
            drop(engine);
            flush(worker).await;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Commands::Grant { user, days } => {
            let expires_at = premium_expiry(Utc::now(), days)?;
            let (engine, worker) = build_engine(&config)?;
            engine.grant_premium(&user, expires_at).await?;
            drop(engine);
            flush(worker).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "user_id": user.trim(),
                    "is_premium": true,
                    "premium_expires_at": expires_at,
                }))?
            );
        }
        Commands::Revoke { user } => {
            let (engine, worker) = build_engine(&config)?;
            engine.revoke_premium(&user).await?;
            drop(engine);
            flush(worker).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "user_id": user.trim(),
                    "is_premium": false,
                }))?
            );
        }
        Commands::Status { user } => {
            let (engine, worker) = build_engine(&config)?;
            let report = engine.usage_report(&user).await?;
            drop(engine);
            flush(worker).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Policies => {
            let policies = load_policies(&config)?;
            if let Some(default) = policies.default_policy() {
                print_policy("default", default.tier(true), default.tier(false));
            }
            for policy in policies.commands() {
                print_policy(
                    &policy.command_name,
                    policy.tier(true),
                    policy.tier(false),
                );
            }
            if policies.is_empty() {
                println!("No command policies configured");
            }
        }
        Commands::Events { limit } => {
            let (engine, worker) = build_engine(&config)?;
            let (events, summary) = engine.recent_events(limit).await?;
            drop(engine);
            flush(worker).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "events": events,
                    "summary": summary,
                }))?
            );
        }
        Commands::ServeMetrics { port } => {
            let port = port.unwrap_or(config.metrics.port);
            info!("Serving metrics on port {}", port);
            metrics_server::start_metrics_server(port).await?;
        }
    }

    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // Logs go to stderr so that command output on stdout stays machine readable
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

/// Expiry for a grant of `days` starting at `now`; `None` grants forever
fn premium_expiry(now: DateTime<Utc>, days: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    let Some(days) = days else {
        return Ok(None);
    };
    if days <= 0 {
        anyhow::bail!("--days must be > 0");
    }
    let expires_at = Duration::try_days(days)
        .and_then(|d| now.checked_add_signed(d))
        .with_context(|| format!("--days {} is too far in the future", days))?;
    Ok(Some(expires_at))
}

async fn flush(worker: Option<AnalyticsWorker>) {
    if let Some(worker) = worker {
        let written = worker.join().await;
        debug!(written, "Flushed admission events");
    }
}

fn print_policy(name: &str, premium: Option<&TierLimit>, non_premium: Option<&TierLimit>) {
    println!(
        "{:<20} premium: {:<24} nonPremium: {}",
        name,
        describe_tier(premium),
        describe_tier(non_premium)
    );
}

fn describe_tier(tier: Option<&TierLimit>) -> String {
    match tier.map(|t| t.rule()) {
        None => "unconfigured".to_string(),
        Some(TierRule::Unlimited) => "unlimited".to_string(),
        Some(TierRule::Disabled) => "disabled".to_string(),
        Some(TierRule::Bounded { limit, window }) => {
            format!("{} per {}", limit, format_window(window))
        }
    }
}
