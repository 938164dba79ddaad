#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `bucket_mover` command-line front end.
//!
//! Runs migration jobs described by TOML job files and inspects the
//! progress and failure records they leave in the state directory.
//! Re-running `migrate` for the same job id resumes from the last listing
//! page the previous run started.
//!
//! Uses `indicatif-log-bridge` (via [`progress::init_logger`]) to route
//! `log` output through `indicatif::MultiProgress` so that log lines and
//! the job's progress bar never fight for the terminal.

mod job_file;
mod progress;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bucket_mover_ledger::file::{FileFailureSink, FileLedger};
use bucket_mover_ledger::{FailedObjectSink as _, ProgressLedger};
use bucket_mover_migrate::{JobEngine, JobHandle, JobReport};
use bucket_mover_migrate_models::JobId;
use bucket_mover_storage::DefaultConnector;
use clap::{Parser, Subcommand};
use indicatif::MultiProgress;

use crate::progress::IndicatifProgress;

/// Counters and markers of every job run from this state directory.
const PROGRESS_FILE: &str = "progress.json";

/// Failed objects of every job run from this state directory.
const FAILURES_FILE: &str = "failures.jsonl";

const PROGRESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "bucket_mover", about = "Bulk bucket-to-bucket object migration")]
struct Cli {
    /// Directory holding progress and failure records
    #[arg(long, global = true, default_value = ".bucket_mover")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate every object under the source prefix
    Migrate {
        /// TOML job file
        #[arg(long)]
        config: PathBuf,
        /// Listing marker to resume after. Defaults to the marker persisted
        /// by the last run of this job
        #[arg(long)]
        marker: Option<String>,
    },
    /// Migrate selected keys again
    Retry {
        /// TOML job file
        #[arg(long)]
        config: PathBuf,
        /// Comma-separated source keys. Defaults to the job's recorded
        /// failures
        #[arg(long, value_delimiter = ',')]
        keys: Option<Vec<String>>,
    },
    /// Print a job's persisted counters
    Status {
        /// Job id
        #[arg(long)]
        job_id: String,
    },
    /// Print a job's recorded failures
    Failures {
        /// Job id
        #[arg(long)]
        job_id: String,
        /// Drop the job's recorded failures after printing them
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = progress::init_logger();
    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.state_dir)?;
    let ledger = Arc::new(FileLedger::open(cli.state_dir.join(PROGRESS_FILE))?);
    let sink = Arc::new(FileFailureSink::new(cli.state_dir.join(FAILURES_FILE)));
    let engine = JobEngine::new(ledger.clone(), sink.clone());

    match cli.command {
        Commands::Migrate { config, marker } => {
            let mut request = job_file::load(&config)?;
            if marker.is_some() {
                request.resume_marker = marker;
            } else if request.resume_marker.is_none() {
                let persisted = ledger.get(&JobId::new(request.job_id.trim()))?.marker;
                if let Some(marker) = &persisted {
                    log::info!("{}: resuming after {marker}", request.job_id);
                }
                request.resume_marker = persisted;
            }

            let handle = engine.submit(&request, &DefaultConnector).await?;
            let report = follow(&multi, &engine, handle).await?;
            println!("{report}");
        }
        Commands::Retry { config, keys } => {
            let mut request = job_file::load(&config)?;
            let handle = if let Some(keys) = keys {
                request.retry_keys = Some(keys);
                engine.submit(&request, &DefaultConnector).await?
            } else {
                engine
                    .submit_failure_retry(&request, &DefaultConnector)
                    .await?
            };
            let report = follow(&multi, &engine, handle).await?;
            println!("{report}");
        }
        Commands::Status { job_id } => {
            let job_id = JobId::new(job_id);
            let snapshot = ledger.get(&job_id)?;
            println!("job:     {job_id}");
            println!("success: {}", snapshot.success);
            println!("failure: {}", snapshot.failure);
            match snapshot.total {
                Some(total) => println!("total:   {total}"),
                None => println!("total:   (not counted)"),
            }
            println!("marker:  {}", snapshot.marker.as_deref().unwrap_or("(start)"));
        }
        Commands::Failures { job_id, clear } => {
            let job_id = JobId::new(job_id);
            let records = sink.list(&job_id)?;
            for record in &records {
                println!(
                    "{}\t{}\t{}",
                    record.recorded_at.to_rfc3339(),
                    record.error_code,
                    record.key
                );
            }
            log::info!("{} recorded failures", records.len());
            if clear {
                sink.clear(&job_id)?;
                log::info!("{job_id}: recorded failures cleared");
            }
        }
    }

    Ok(())
}

/// Renders the job's ledger counters until it has drained.
async fn follow(
    multi: &MultiProgress,
    engine: &JobEngine,
    handle: JobHandle,
) -> Result<JobReport, Box<dyn std::error::Error>> {
    let ledger = engine.ledger();
    let job_id = handle.job_id().clone();
    let bar = IndicatifProgress::objects_bar(multi, job_id.as_str());
    let mut ticker = tokio::time::interval(PROGRESS_POLL_INTERVAL);
    let mut total_known = false;
    let finished = handle.finished();
    tokio::pin!(finished);

    loop {
        tokio::select! {
            report = &mut finished => {
                return match report {
                    Ok(report) => {
                        bar.finish(report.to_string());
                        Ok(report)
                    }
                    Err(e) => {
                        bar.finish_and_clear();
                        Err(e.into())
                    }
                };
            }
            _ = ticker.tick() => {
                let snapshot = ledger.get(&job_id)?;
                if !total_known && let Some(total) = snapshot.total {
                    bar.set_total(total);
                    total_known = true;
                }
                bar.set_position(snapshot.processed());
                let in_flight = engine
                    .pool_stats(&job_id)
                    .map_or(0, |stats| stats.submitted.saturating_sub(stats.completed));
                bar.set_message(format!(
                    "{job_id} ({in_flight} in flight, {} failed)",
                    snapshot.failure
                ));
            }
        }
    }
}
