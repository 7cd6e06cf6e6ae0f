//! ChatRelay - Message-routing daemon bridging chat channels to AI agents.

use clap::Parser;
use std::process::ExitCode;

use chatrelay::logging;
use chatrelay::Commands;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    if let Err(e) = logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    // Parse command line arguments
    let args = Commands::parse();

    // Run the command
    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
