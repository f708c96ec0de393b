use clap::Parser;
use epg_merge::cli::{exit_code, run, Cli};
use epg_merge::logging;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.log_file().as_deref(), cli.wants_json()) {
        eprintln!("Failed to initialise tracing: {e}");
    }
    tracing::info!("CLI application startup: tracing initialised, environment loaded");

    match run(cli).await {
        Ok(_) => {
            tracing::info!("CLI completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "CLI exited with error");
            ExitCode::from(exit_code(&e))
        }
    }
}
