//! chat-export-rs: resumable archiver for one chat's media and messages.
//!
//! Walks the chat history in ascending message order, downloads media that
//! passes the configured filters, optionally exports message metadata as
//! JSON Lines, and records its progress after every message so an
//! interrupted run resumes exactly where it stopped.

#![warn(clippy::all)]

mod cli;
mod config;
mod download;
mod engine;
mod export;
mod filter;
mod logging;
mod progress;
pub mod retry;
mod shutdown;
mod source;
mod state;
mod types;

use std::path::Path;

use clap::Parser;
use cli::{Cli, Command};
use config::Config;
use download::DownloadOrchestrator;
use engine::{EngineError, EngineOptions, ExportEngine};
use export::MessageExporter;
use progress::{ProgressBarSink, RunSummary};
use source::HttpSource;
use state::{
    ItemStatus, JsonStateStore, Ledger, SqliteLedger, StateError, StateLock, StateStore,
};

async fn run_export(cli: &Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)?;
    tracing::debug!(?config, "Loaded config");
    tracing::info!(
        "Exporting chat {} into {}",
        config.chat,
        config.download.directory.display()
    );
    if cli.dry_run {
        tracing::info!("[DRY RUN] Nothing will be downloaded or written");
    }

    // Held until the run ends; a second export on the same state file fails fast.
    let _lock = if cli.dry_run {
        None
    } else {
        Some(StateLock::acquire(&config.state_file).await?)
    };

    let source = HttpSource::new(
        &config.source.base_url,
        &config.chat.to_string(),
        config.source.token.clone(),
        config.source.request_timeout,
    )?;
    let store = JsonStateStore::new(&config.state_file);

    let ledger = if cli.dry_run {
        None
    } else {
        let path = state::ledger_path(&config.state_file);
        match SqliteLedger::open(&path).await {
            Ok(ledger) => Some(ledger),
            Err(e) => {
                tracing::warn!("Archive ledger unavailable, continuing without it: {}", e);
                None
            }
        }
    };
    let exporter = match &config.export_file {
        Some(path) if !cli.dry_run => {
            tracing::info!("Exporting message metadata to {}", path.display());
            Some(MessageExporter::open(path).await?)
        }
        _ => None,
    };

    let progress = ProgressBarSink::new(cli.no_progress_bar);
    let shutdown_token = shutdown::install_signal_handler();

    let orchestrator = DownloadOrchestrator::new(&source, config.download.clone());
    let mut engine = ExportEngine::new(
        &source,
        &store,
        orchestrator,
        config.criteria.clone(),
        EngineOptions {
            pagination_limit: config.pagination_limit,
            dry_run: cli.dry_run,
        },
    )
    .with_progress(&progress);
    if let Some(ledger) = &ledger {
        engine = engine.with_ledger(ledger);
    }
    if let Some(exporter) = exporter {
        engine = engine.with_exporter(exporter);
    }

    let report = match engine.run(&shutdown_token).await {
        Ok(report) => report,
        Err(EngineError::State(e @ StateError::Corrupt { .. })) => {
            return Err(anyhow::Error::new(e).context(
                "Refusing to start over silently. Repair the state file or run \
                 `chat-export-rs reset-state`",
            ));
        }
        Err(e) => {
            tracing::error!("Export aborted, the next run resumes from the last saved message");
            return Err(e.into());
        }
    };

    RunSummary {
        totals: report.totals.clone(),
        elapsed: report.elapsed,
        retry_pending: report.state.retry_set.len(),
        interrupted: report.interrupted,
        dry_run: cli.dry_run,
    }
    .log();

    if !report.permanent_failures.is_empty() {
        for (message_id, reason) in &report.permanent_failures {
            tracing::error!(message_id, "Permanent failure: {}", reason);
        }
        anyhow::bail!(
            "{} downloads failed permanently",
            report.permanent_failures.len()
        );
    }
    Ok(())
}

async fn run_status(config_path: &Path, show_failed: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let store = JsonStateStore::new(&config.state_file);

    println!("State file: {}", config.state_file.display());
    match store.load().await {
        Ok(state) => {
            println!("  Resume after message: {}", state.cursor);
            if state.retry_set.is_empty() {
                println!("  Pending retries:      none");
            } else {
                let ids: Vec<String> = state.retry_set.iter().map(|id| id.to_string()).collect();
                println!(
                    "  Pending retries:      {} ({})",
                    state.retry_set.len(),
                    ids.join(", ")
                );
            }
        }
        Err(e) => println!("  {}", e),
    }
    println!();

    let db_path = state::ledger_path(&config.state_file);
    if !db_path.exists() {
        println!("No archive ledger found at {}", db_path.display());
        println!("Run an export first to create it.");
        return Ok(());
    }

    let ledger = SqliteLedger::open(&db_path).await?;
    let summary = ledger.get_summary().await?;

    println!("Archive ledger: {}", db_path.display());
    println!("  Total:      {}", summary.total_items);
    println!(
        "  Downloaded: {} ({})",
        summary.downloaded,
        progress::format_size(summary.total_bytes)
    );
    println!("  Deferred:   {}", summary.deferred);
    println!("  Failed:     {}", summary.failed);
    println!();

    if let Some(started) = &summary.last_run_started {
        println!(
            "Last run started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_run_completed {
        println!(
            "Last run completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    if show_failed {
        let failed: Vec<_> = ledger
            .get_failed()
            .await?
            .into_iter()
            .filter(|item| item.status == ItemStatus::Failed)
            .collect();
        if !failed.is_empty() {
            println!();
            println!("Failed items:");
            for item in failed {
                println!(
                    "  #{} {} ({}) - {}",
                    item.message_id,
                    item.file_name,
                    item.kind,
                    item.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    Ok(())
}

async fn run_verify(config_path: &Path, checksums: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let db_path = state::ledger_path(&config.state_file);
    if !db_path.exists() {
        println!("No archive ledger found at {}", db_path.display());
        println!("Run an export first to create it.");
        return Ok(());
    }

    let ledger = SqliteLedger::open(&db_path).await?;
    let downloaded = ledger.get_all_downloaded().await?;
    println!("Verifying {} archived files...", downloaded.len());
    println!();

    let mut missing = 0;
    let mut corrupted = 0;
    let mut verified = 0;

    for item in &downloaded {
        let Some(local_path) = &item.local_path else {
            println!("NO PATH: message {} has no local path recorded", item.message_id);
            missing += 1;
            continue;
        };
        if !local_path.exists() {
            println!("MISSING: {} (message {})", local_path.display(), item.message_id);
            missing += 1;
            continue;
        }
        if !checksums {
            verified += 1;
            continue;
        }
        let Some(expected) = &item.sha256 else {
            println!("NO DIGEST: {} (message {})", local_path.display(), item.message_id);
            corrupted += 1;
            continue;
        };
        match download::file::sha256_file(local_path).await {
            Ok(actual) if actual.eq_ignore_ascii_case(expected) => verified += 1,
            Ok(_) => {
                println!("CORRUPTED: {} (message {})", local_path.display(), item.message_id);
                corrupted += 1;
            }
            Err(e) => {
                println!("ERROR: {} - {}", local_path.display(), e);
                corrupted += 1;
            }
        }
    }

    println!();
    println!("Results:");
    println!("  Verified:  {}", verified);
    println!("  Missing:   {}", missing);
    if checksums {
        println!("  Corrupted: {}", corrupted);
    }

    if missing > 0 || corrupted > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_reset_state(config_path: &Path, yes: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let state_path = &config.state_file;
    if !state_path.exists() {
        println!("No state file found at {}", state_path.display());
        return Ok(());
    }
    let _lock = StateLock::acquire(state_path).await?;

    if !yes {
        println!("This deletes the resume point and pending retries in:");
        println!("  {}", state_path.display());
        println!("The next run starts from the first message of the chat.");
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    std::fs::remove_file(state_path)?;
    println!("State file deleted. Archived files and the ledger are kept.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = logging::init_logging(cli.log_level, cli.log_dir.as_deref());

    match cli.effective_command() {
        Command::Run => run_export(&cli).await,
        Command::Status { failed } => run_status(&cli.config, failed).await,
        Command::Verify { checksums } => run_verify(&cli.config, checksums).await,
        Command::ResetState { yes } => run_reset_state(&cli.config, yes).await,
    }
}
