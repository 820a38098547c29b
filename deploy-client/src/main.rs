//! Deploy - command-line front end for the sync engine.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use deploy_client::transfer::progress::{format_bytes, format_duration, format_speed};
use deploy_client::transfer::{ProgressReporter, TransferProgress};
use deploy_client::{logger, ClientConfig, ConflictPolicy, SyncEngine, SyncOptions, SyncReport, TransportClient};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "deploy", author, version, about, long_about = None)]
struct Args {
    /// Project root
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Point this project at an agent
    Init {
        /// Agent base URL
        #[arg(long)]
        url: String,

        /// Bearer token (or set DEPLOY_TOKEN)
        #[arg(long)]
        token: Option<String>,
    },
    /// Check connectivity and the token
    Test,
    /// Show the agent's health
    Health,
    /// Show what push and pull would transfer
    Status,
    /// Upload local changes
    Push(TransferArgs),
    /// Download remote changes
    Pull(TransferArgs),
    /// Push and pull
    Sync(TransferArgs),
    /// Show transfers queued after failures
    Queue,
}

#[derive(clap::Args, Debug)]
struct TransferArgs {
    /// Only show the plan
    #[arg(long)]
    dry_run: bool,

    /// Resolve conflicts in favor of one side
    #[arg(long, value_enum)]
    prefer: Option<Prefer>,

    /// Leave remote files that were deleted locally
    #[arg(long)]
    keep_remote: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Prefer {
    Local,
    Remote,
}

impl TransferArgs {
    fn options(&self) -> SyncOptions {
        SyncOptions {
            dry_run: self.dry_run,
            policy: match self.prefer {
                None => ConflictPolicy::Report,
                Some(Prefer::Local) => ConflictPolicy::PreferLocal,
                Some(Prefer::Remote) => ConflictPolicy::PreferRemote,
            },
            delete_remote: !self.keep_remote,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let root = args.root.canonicalize()?;

    let mut config = ClientConfig::load(&root)?;
    if let Command::Init { url, token } = &args.command {
        config.remote.url = url.clone();
        if let Some(token) = token {
            config.remote.token = token.clone();
        }
        config.save(&root)?;
        println!("Wrote {}", ClientConfig::path_for(&root).display());
        return Ok(());
    }

    config.apply_env_overrides();
    let level = args.log_level.as_deref().unwrap_or(&config.log.level);
    logger::init(level)?;
    config.validate()?;

    match args.command {
        Command::Init { .. } => {}
        Command::Test => {
            let client = TransportClient::new(&config.remote)?;
            let agent = client.test().await?;
            println!(
                "Connected to {} (agent {}, v{}, root {})",
                client.base_url(),
                agent.agent_id,
                agent.version,
                agent.root
            );
        }
        Command::Health => {
            let client = TransportClient::new(&config.remote)?;
            let health = client.health().await?;
            println!("Status: {:?} (v{}, up {})", health.status, health.version, format_duration(health.uptime_secs));
            for (check, ok) in &health.checks {
                println!("  {:<16} {}", check, if *ok { "ok" } else { "FAILED" });
            }
            if let Some(message) = health.maintenance_message {
                println!("  maintenance: {message}");
            }
        }
        Command::Status => {
            let engine = SyncEngine::new(&root, &config)?;
            let plan = engine.status().await?;
            let diff = &plan.diff;
            for path in &diff.to_upload {
                println!("upload    {path}");
            }
            for path in &diff.to_download {
                println!("download  {path}");
            }
            for path in &diff.to_delete {
                println!("delete    {path}");
            }
            for path in &diff.conflicts {
                println!("conflict  {path}");
            }
            if diff.is_clean() {
                println!("Up to date ({} files)", diff.unchanged.len());
            }
        }
        Command::Push(transfer) => {
            let engine = SyncEngine::new(&root, &config)?.with_reporter(reporter());
            finish(engine.push(transfer.options()).await?)?;
        }
        Command::Pull(transfer) => {
            let engine = SyncEngine::new(&root, &config)?.with_reporter(reporter());
            finish(engine.pull(transfer.options()).await?)?;
        }
        Command::Sync(transfer) => {
            let engine = SyncEngine::new(&root, &config)?.with_reporter(reporter());
            finish(engine.sync(transfer.options()).await?)?;
        }
        Command::Queue => {
            let engine = SyncEngine::new(&root, &config)?;
            let queued = engine.queue().list()?;
            if queued.is_empty() {
                println!("Queue is empty");
            }
            for op in queued {
                println!(
                    "{:<9} {} ({} attempts, last error: {})",
                    format!("{:?}", op.kind).to_lowercase(),
                    op.path,
                    op.attempts,
                    op.last_error
                );
            }
        }
    }

    Ok(())
}

fn reporter() -> ProgressReporter {
    Arc::new(|progress: &TransferProgress| {
        tracing::debug!(
            "[{}/{}] {} of {} ({}, ETA {})",
            progress.files_done,
            progress.total_files,
            format_bytes(progress.transferred_bytes),
            format_bytes(progress.total_bytes),
            format_speed(progress.bytes_per_second),
            format_duration(progress.eta_seconds)
        );
    })
}

/// Print the summary; unresolved conflicts or failed items exit non-zero.
fn finish(report: SyncReport) -> Result<()> {
    let verb = if report.dry_run { "would " } else { "" };
    for path in &report.uploaded {
        println!("{verb}upload    {path}");
    }
    for path in &report.downloaded {
        println!("{verb}download  {path}");
    }
    for path in &report.deleted {
        println!("{verb}delete    {path}");
    }
    for path in &report.conflicts {
        println!("conflict  {path}  (rerun with --prefer local|remote)");
    }
    for error in &report.batch.errors {
        println!("failed    {}: {}", error.path, error.error);
    }
    if let Some(id) = &report.backup_id {
        println!("Local backup: {id}");
    }
    println!(
        "{} succeeded, {} failed, {} conflicts",
        report.batch.succeeded,
        report.batch.failed,
        report.conflicts.len()
    );

    if !report.is_clean() {
        bail!(
            "{} transfers failed and {} conflicts are unresolved",
            report.batch.failed,
            report.conflicts.len()
        );
    }
    Ok(())
}
