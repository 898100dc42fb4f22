use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "launch-cli")]
#[command(about = "Fetch the launch dataset and upsert it into postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch once and upsert every record (default).
    Ingest,
    /// Create the raw.launches table if missing.
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Usage errors exit 1 like any other failure; --help and --version exit 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli.command.unwrap_or(Commands::Ingest)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Ingest => {
            let summary = launch_sync::run_ingest_once_from_env().await?;
            println!(
                "ingest complete: run_id={} fetched={} skipped={} superseded={} upserted={} stored_total={}",
                summary.run_id,
                summary.fetched,
                summary.skipped_without_id,
                summary.superseded,
                summary.upserted,
                summary.stored_total
            );
        }
        Commands::Migrate => {
            launch_sync::run_migrations_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
