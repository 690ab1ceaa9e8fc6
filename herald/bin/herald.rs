//! Herald service and operator commands
//!
//! `herald serve` runs the maintenance runtime. The other subcommands act on
//! the shared store directly, so they only see fleet state when the store is
//! Redis.

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use herald::{Engine, HeraldConfig, find_config_file};
use herald_admission::{Candidate, DeliveryResult, Outcome, Scope, Verdict};
use herald_common::{Domain, logging};
use herald_store::StoreConfig;

/// Outbound send admission and distribution engine
#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(version)]
struct Cli {
    /// Configuration file, overriding `HERALD_CONFIG` and the default paths
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the maintenance runtime until interrupted
    Serve,
    /// Run one address through admission (consumes throttle headroom when admitted)
    Check {
        #[arg(long)]
        org: String,
        #[arg(long)]
        campaign: String,
        /// Suppression lists that apply in addition to the global list
        #[arg(long, value_delimiter = ',')]
        lists: Vec<String>,
        email: String,
    },
    /// Record a delivery result
    Report {
        #[arg(long)]
        campaign: String,
        #[arg(long)]
        profile: String,
        #[arg(long, value_enum)]
        result: ResultArg,
        email: String,
    },
    /// Show per-profile distribution tallies of a campaign
    Stats {
        campaign: String,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Reset the distribution tallies of a campaign
    ClearStats { campaign: String },
    /// Mark a profile healthy again by forgetting its recent failures
    ResetFailures { campaign: String, profile: String },
    /// Show throttle usage and backoff for a domain
    Usage {
        #[arg(long)]
        org: String,
        domain: String,
    },
    /// Lift a bounce backoff
    ClearBackoff { domain: String },
    /// List configured suppression lists with their sizes
    Lists,
    /// Check whether a lock is currently free
    Lock { resource: String },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ResultArg {
    Delivered,
    Bounced,
    Failed,
}

impl From<ResultArg> for DeliveryResult {
    fn from(value: ResultArg) -> Self {
        match value {
            ResultArg::Delivered => Self::Delivered,
            ResultArg::Bounced => Self::Bounced,
            ResultArg::Failed => Self::Failed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => find_config_file()?,
    };
    let config = HeraldConfig::load(&config_path)?;

    let engine = Engine::build(config)?;

    if !matches!(cli.command, Commands::Serve) {
        logging::init();
        if matches!(engine.config().store, StoreConfig::Memory(_)) {
            eprintln!(
                "Warning: the memory store is private to this command, fleet state is not visible"
            );
        }
    }

    match cli.command {
        Commands::Serve => engine.run().await,
        Commands::Check {
            org,
            campaign,
            lists,
            email,
        } => cmd_check(&engine, &org, &campaign, &lists, &email).await,
        Commands::Report {
            campaign,
            profile,
            result,
            email,
        } => {
            engine
                .pipeline()
                .report(&Outcome {
                    campaign: &campaign,
                    profile: &profile,
                    email: &email,
                    result: result.into(),
                })
                .await?;
            println!("Recorded {result:?} for {profile}");
            Ok(())
        }
        Commands::Stats { campaign, format } => cmd_stats(&engine, &campaign, format).await,
        Commands::ClearStats { campaign } => {
            engine.pipeline().distributor().clear_stats(&campaign).await?;
            println!("Cleared distribution stats for {campaign}");
            Ok(())
        }
        Commands::ResetFailures { campaign, profile } => {
            engine
                .pipeline()
                .distributor()
                .reset_failures(&campaign, &profile)
                .await?;
            println!("Reset recent failures of {profile} in {campaign}");
            Ok(())
        }
        Commands::Usage { org, domain } => cmd_usage(&engine, &org, &domain).await,
        Commands::ClearBackoff { domain } => {
            engine
                .pipeline()
                .throttle()
                .clear_backoff(&Domain::new(&domain))
                .await?;
            println!("Cleared backoff for {domain}");
            Ok(())
        }
        Commands::Lists => {
            engine.load_suppression().await;
            println!("{:<24} {:<8} {:>10}  NAME", "ID", "SCOPE", "COUNT");
            for list in engine.pipeline().suppression().lists() {
                let scope = match list.scope {
                    Scope::Global => "global",
                    Scope::List => "list",
                };
                println!(
                    "{:<24} {:<8} {:>10}  {}",
                    list.id, scope, list.count, list.name
                );
            }
            Ok(())
        }
        Commands::Lock { resource } => {
            let lock = engine.locks().lock(&resource);
            if lock.try_acquire().await? {
                lock.release().await;
                println!("{resource} is free");
            } else {
                println!("{resource} is held");
            }
            Ok(())
        }
    }
}

async fn cmd_check(
    engine: &Engine,
    org: &str,
    campaign: &str,
    lists: &[String],
    email: &str,
) -> anyhow::Result<()> {
    engine.load_suppression().await;
    let quotas = engine.config().quotas(campaign)?;

    let verdict = engine
        .pipeline()
        .admit(&Candidate {
            org,
            campaign,
            email,
            lists,
            quotas,
        })
        .await?;

    match verdict {
        Verdict::Suppressed => println!("suppressed"),
        Verdict::Deferred(reason) => println!("deferred: {reason}"),
        Verdict::Send(selection) if selection.failover => {
            println!("send via {} (failover)", selection.profile);
        }
        Verdict::Send(selection) => println!("send via {}", selection.profile),
    }
    Ok(())
}

async fn cmd_stats(engine: &Engine, campaign: &str, format: OutputFormat) -> anyhow::Result<()> {
    let stats = engine.pipeline().distributor().stats(campaign).await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    if stats.is_empty() {
        println!("No sends recorded for {campaign}");
        return Ok(());
    }

    let total: u64 = stats.iter().map(|s| s.sent).sum();
    println!(
        "{:<24} {:>10} {:>7} {:>10} {:>8}",
        "PROFILE", "SENT", "SHARE", "FAILED", "RECENT"
    );
    for profile in &stats {
        #[allow(clippy::cast_precision_loss)]
        let share = if total == 0 {
            0.0
        } else {
            profile.sent as f64 * 100.0 / total as f64
        };
        println!(
            "{:<24} {:>10} {:>6.1}% {:>10} {:>8}",
            profile.profile, profile.sent, share, profile.failed, profile.recent_failures
        );
    }
    Ok(())
}

fn format_limit(limit: Option<u64>) -> String {
    limit.map_or_else(|| String::from("unlimited"), |limit| limit.to_string())
}

async fn cmd_usage(engine: &Engine, org: &str, domain: &str) -> anyhow::Result<()> {
    let usage = engine
        .pipeline()
        .throttle()
        .usage(org, &Domain::new(domain))
        .await?;

    println!("unit:    {}", usage.unit);
    println!("hourly:  {} / {}", usage.hourly, format_limit(usage.limits.unit.hourly));
    println!("daily:   {} / {}", usage.daily, format_limit(usage.limits.unit.daily));
    match usage.backoff_until {
        Some(until) => println!("backoff: until {}", until.to_rfc3339()),
        None => println!("backoff: none"),
    }
    Ok(())
}
