//! Maintenance CLI for the idempotency store.
//!
//! Subcommands: `cleanup` evicts expired records, `generate-key` prints a
//! fresh key, `test-storage` round-trips a probe record against the
//! configured backend, `stats` prints backend statistics. Exit code 0 on
//! success, 1 on any failure.

use axum_idem::{Config, Result, StoredRecord, key, storage};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode, time::Duration};

#[derive(Parser, Debug)]
#[command(author, version, about = "Idempotency store maintenance")]
struct Cli {
    /// Path to a TOML configuration file. Falls back to config/{RUST_ENV}.toml.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evict expired records from the configured storage backend.
    Cleanup {
        /// Maximum number of records to remove in this pass.
        #[arg(long, default_value_t = 1000)]
        batch: usize,
    },
    /// Print a fresh idempotency key in canonical UUID form.
    GenerateKey,
    /// Verify the configured storage backend answers and round-trips a record.
    TestStorage,
    /// Print backend statistics as JSON.
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // generate-key needs no configuration at all.
    if matches!(cli.command, Command::GenerateKey) {
        println!("{}", key::generate());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::from_rust_env().unwrap_or_default(),
    };
    config.setup_tracing();
    config.validate()?;

    let storage = storage::from_config(&config.storage).await?;

    match cli.command {
        Command::GenerateKey => unreachable!("handled above"),

        Command::Cleanup { batch } => {
            let removed = storage.cleanup(batch).await?;
            println!("removed {removed} expired record(s)");
        }

        Command::TestStorage => {
            storage.ping().await?;

            let probe_key = format!("idem-admin-probe-{}", key::generate());
            let record = StoredRecord::new(200, Bytes::from_static(b"probe"), vec![], 60);

            if !storage
                .put(&probe_key, &record, Duration::from_secs(60))
                .await?
            {
                return Err(axum_idem::Error::backend(
                    "probe key unexpectedly already present",
                ));
            }
            let read_back = storage.get(&probe_key).await?;
            storage.delete(&probe_key).await?;

            match read_back {
                Some(stored) if stored.body == record.body => {
                    println!("storage backend ok ({})", config.storage.backend_name());
                }
                Some(_) => {
                    return Err(axum_idem::Error::backend("probe record came back altered"));
                }
                None => {
                    return Err(axum_idem::Error::backend("probe record was not readable"));
                }
            }
        }

        Command::Stats => {
            let stats = storage.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
