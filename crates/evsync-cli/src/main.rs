use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "evsync-cli")]
#[command(about = "Community event sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch new calendar events, categorize and store them, refresh stats.
    Sync {
        /// Run against in-memory stores; nothing is persisted.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Recompute the cached stats snapshot from stored events.
    Stats,
    /// Fetch and print events without storing them.
    Fetch {
        /// RFC 3339 timestamp or `YYYY-MM-DD` (midnight UTC).
        #[arg(long, value_parser = parse_after)]
        after: Option<DateTime<Utc>>,
        #[arg(long)]
        categorize: bool,
    },
    /// Member skills and interests from a reception-channel export.
    Reception {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "member-stats.json")]
        output: PathBuf,
    },
    /// Idea and app leaderboard from a discussion-channel export.
    Discussion {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "discussion-stats.json")]
        output: PathBuf,
    },
    /// Run the cron-driven sync until interrupted.
    Schedule,
}

fn parse_after(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .ok_or_else(|| format!("expected an RFC 3339 timestamp or YYYY-MM-DD, got {raw:?}"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli.command.unwrap_or(Commands::Sync { dry_run: false })).await {
        error!(error = %format!("{err:#}"), "command failed");
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Sync { dry_run } => {
            let summary = evsync_sync::run_sync_once_from_env(dry_run).await?;
            println!(
                "sync complete: run_id={} fetched={} inserted={} updated={} skipped={} total_events={} cursor={}",
                summary.run_id,
                summary.fetched,
                summary.inserted,
                summary.updated,
                summary.skipped,
                summary.total_events,
                summary.cursor.as_deref().unwrap_or("-")
            );
        }
        Commands::Migrate => {
            evsync_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Stats => {
            let snapshot = evsync_sync::refresh_stats_from_env().await?;
            println!(
                "stats refreshed: events={} registrations={} months={}",
                snapshot.total_events,
                snapshot.total_registrations,
                snapshot.monthly_data.len()
            );
        }
        Commands::Fetch { after, categorize } => {
            let preview = evsync_sync::fetch_preview_from_env(after, categorize).await?;
            for event in &preview.events {
                println!(
                    "{}  {}  guests={}  {}",
                    event.start_time.format("%Y-%m-%d %H:%M"),
                    event.identity_key(),
                    event.guest_count,
                    event.title
                );
            }
            if let Some(breakdown) = preview.breakdown {
                println!();
                for (category, count) in breakdown {
                    println!("{count:>5}  {}", category.label());
                }
            }
            println!("fetched {} events", preview.events.len());
        }
        Commands::Reception { input, output } => {
            let stats = evsync_sync::run_reception_from_env(&input, &output).await?;
            println!(
                "reception complete: messages={} intros={} report={}",
                stats.total_messages,
                stats.total_intros,
                output.display()
            );
        }
        Commands::Discussion { input, output } => {
            let stats = evsync_sync::run_discussion_from_env(&input, &output).await?;
            println!(
                "discussion complete: messages={} ideas={} apps={} report={}",
                stats.total_messages,
                stats.ideas.len(),
                stats.apps.len(),
                output.display()
            );
        }
        Commands::Schedule => {
            let Some(mut sched) = evsync_sync::schedule_from_env().await? else {
                println!("scheduler disabled; set EVSYNC_SCHEDULER_ENABLED=1");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
